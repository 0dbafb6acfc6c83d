// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and rewriting XPI (zip) archives.
//!
//! Signing an XPI never modifies content entries. Instead, every entry in the
//! reserved signature area (`META-INF/`) is stripped and a fresh set of
//! signature artifacts is appended after the content entries.

use {
    crate::error::XpiSigningError,
    log::debug,
    std::{
        collections::HashSet,
        io::{Cursor, Read, Write},
    },
    zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter},
};

/// Directory holding signature artifacts.
pub const SIGNATURE_DIRECTORY: &str = "META-INF/";

/// Path of the legacy JAR manifest.
pub const MANIFEST_PATH: &str = "META-INF/manifest.mf";

/// Path of the signature file (the manifest of the manifest).
pub const SIGNATURE_FILE_PATH: &str = "META-INF/mozilla.sf";

/// Path of the detached PKCS#7 signature over the signature file.
pub const SIGNATURE_PATH: &str = "META-INF/mozilla.rsa";

/// Path of the manifest covered by the COSE signature.
pub const COSE_MANIFEST_PATH: &str = "META-INF/cose.manifest";

/// Path of the COSE_Sign envelope.
pub const COSE_SIGNATURE_PATH: &str = "META-INF/cose.sig";

/// Whether an archive entry name belongs to the signature area.
///
/// The directory prefix must match exactly. The remainder is compared
/// case-insensitively.
pub fn is_signature_file(name: &str) -> bool {
    let rest = match name.strip_prefix(SIGNATURE_DIRECTORY) {
        Some(rest) => rest.to_ascii_lowercase(),
        None => return false,
    };

    rest == "manifest.mf"
        || rest.ends_with(".sf")
        || rest.ends_with(".rsa")
        || rest.ends_with(".dsa")
        || rest.starts_with("sig-")
}

/// An entry to inject into a repacked archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metafile {
    pub name: String,
    pub body: Vec<u8>,
}

impl Metafile {
    pub fn new(name: impl ToString, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            body: body.into(),
        }
    }
}

/// Open archive data for random access.
pub fn open_archive(data: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, XpiSigningError> {
    ZipArchive::new(Cursor::new(data)).map_err(XpiSigningError::MalformedArchive)
}

/// Read the full decompressed content of a named entry.
pub fn read_entry(data: &[u8], name: &str) -> Result<Vec<u8>, XpiSigningError> {
    let mut archive = open_archive(data)?;

    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => {
            return Err(XpiSigningError::EntryNotFound(name.to_string()));
        }
        Err(e) => {
            return Err(XpiSigningError::EntryReadFailure {
                name: name.to_string(),
                source: e.into(),
            });
        }
    };

    let mut buffer = vec![];
    file.read_to_end(&mut buffer)
        .map_err(|source| XpiSigningError::EntryReadFailure {
            name: name.to_string(),
            source,
        })?;

    Ok(buffer)
}

/// Obtain the names of all entries in archive order.
pub fn entry_names(data: &[u8]) -> Result<Vec<String>, XpiSigningError> {
    let mut archive = open_archive(data)?;

    (0..archive.len())
        .map(|i| {
            archive
                .by_index_raw(i)
                .map(|file| file.name().to_string())
                .map_err(XpiSigningError::MalformedArchive)
        })
        .collect::<Result<Vec<_>, _>>()
}

/// Content entries of an archive, in archive order.
///
/// Directories and signature area entries are skipped. Names must be unique,
/// since a manifest can't tell two entries with the same name apart.
pub fn content_entries(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>, XpiSigningError> {
    let mut archive = open_archive(data)?;
    let mut entries = vec![];
    let mut seen = HashSet::new();

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(XpiSigningError::MalformedArchive)?;

        if file.is_dir() || is_signature_file(file.name()) {
            debug!("skipping {}", file.name());
            continue;
        }

        let name = file.name().to_string();
        if !seen.insert(name.clone()) {
            return Err(XpiSigningError::DuplicateEntry(name));
        }

        let mut buffer = vec![];
        file.read_to_end(&mut buffer)
            .map_err(|source| XpiSigningError::EntryReadFailure {
                name: name.clone(),
                source,
            })?;

        entries.push((name, buffer));
    }

    Ok(entries)
}

/// Rewrite an archive with a new set of signature area entries.
///
/// Every existing entry outside the signature area is copied in archive order
/// and recompressed. Existing signature area entries are dropped. `metafiles`
/// are then appended in the order given.
pub fn repack_with_metafiles(
    data: &[u8],
    metafiles: &[Metafile],
) -> Result<Vec<u8>, XpiSigningError> {
    let mut archive = open_archive(data)?;
    let mut zf = ZipWriter::new(Cursor::new(vec![]));

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(XpiSigningError::MalformedArchive)?;
        let name = file.name().to_string();

        if is_signature_file(&name) {
            debug!("dropping signature area entry {}", name);
            continue;
        }

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(file.last_modified());
        let options = if let Some(mode) = file.unix_mode() {
            options.unix_permissions(mode)
        } else {
            options
        };

        let write_error = |e: ZipError| XpiSigningError::EntryWriteFailure {
            name: name.clone(),
            source: e.into(),
        };

        if file.is_dir() {
            zf.add_directory(name.clone(), options)
                .map_err(write_error)?;
            continue;
        }

        let mut buffer = vec![];
        file.read_to_end(&mut buffer)
            .map_err(|source| XpiSigningError::EntryWriteFailure {
                name: name.clone(),
                source,
            })?;

        zf.start_file(name.clone(), options).map_err(write_error)?;
        zf.write_all(&buffer)
            .map_err(|source| XpiSigningError::EntryWriteFailure {
                name: name.clone(),
                source,
            })?;
    }

    for metafile in metafiles {
        debug!("adding {} ({} bytes)", metafile.name, metafile.body.len());

        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zf.start_file(metafile.name.clone(), options)
            .map_err(|e| XpiSigningError::EntryWriteFailure {
                name: metafile.name.clone(),
                source: e.into(),
            })?;
        zf.write_all(&metafile.body)
            .map_err(|source| XpiSigningError::EntryWriteFailure {
                name: metafile.name.clone(),
                source,
            })?;
    }

    let writer = zf.finish().map_err(XpiSigningError::ArchiveWriteFailure)?;

    Ok(writer.into_inner())
}

/// Repack an archive with the three legacy signature artifacts.
///
/// Artifacts are written in a fixed order: manifest, signature file, signature.
pub fn repack(
    data: &[u8],
    manifest: &[u8],
    signature_file: &[u8],
    signature: &[u8],
) -> Result<Vec<u8>, XpiSigningError> {
    repack_with_metafiles(
        data,
        &[
            Metafile::new(MANIFEST_PATH, manifest),
            Metafile::new(SIGNATURE_FILE_PATH, signature_file),
            Metafile::new(SIGNATURE_PATH, signature),
        ],
    )
}

#[cfg(test)]
mod tests {
    use {super::*, crate::{error::ErrorKind, testutil::*}};

    #[test]
    fn signature_file_names() {
        for name in [
            "META-INF/manifest.mf",
            "META-INF/MANIFEST.MF",
            "META-INF/Manifest.Mf",
            "META-INF/mozilla.sf",
            "META-INF/foo.SF",
            "META-INF/mozilla.rsa",
            "META-INF/MOZILLA.RSA",
            "META-INF/foo.dsa",
            "META-INF/sig-anything",
            "META-INF/SIG-X",
        ] {
            assert!(is_signature_file(name), "{}", name);
        }

        for name in [
            "manifest.mf",
            "meta-inf/manifest.mf",
            "META-INF/cose.manifest",
            "META-INF/cose.sig",
            "META-INF/manifest.mf.bak",
            "META-INF/other.txt",
            "content/foo.sf.js",
            "META-INF/",
        ] {
            assert!(!is_signature_file(name), "{}", name);
        }
    }

    #[test]
    fn read_entry_found() -> Result<(), XpiSigningError> {
        let data = make_archive(&[("a.txt", b"hello"), ("b/c.txt", b"world")]);

        assert_eq!(read_entry(&data, "a.txt")?, b"hello");
        assert_eq!(read_entry(&data, "b/c.txt")?, b"world");

        Ok(())
    }

    #[test]
    fn read_entry_missing() {
        let data = make_archive(&[("a.txt", b"hello")]);

        assert!(matches!(
            read_entry(&data, "missing.txt"),
            Err(XpiSigningError::EntryNotFound(name)) if name == "missing.txt"
        ));
    }

    #[test]
    fn malformed_archive() {
        assert!(matches!(
            read_entry(b"not a zip file", "a.txt"),
            Err(XpiSigningError::MalformedArchive(_))
        ));
        assert!(matches!(
            repack_with_metafiles(b"not a zip file", &[]),
            Err(XpiSigningError::MalformedArchive(_))
        ));
    }

    #[test]
    fn content_entries_skip_signature_area() -> Result<(), XpiSigningError> {
        let data = make_archive_with_directories(
            &["content/"],
            &[
                ("content/a.js", b"a"),
                ("META-INF/manifest.mf", b"old"),
                ("META-INF/cose.manifest", b"cose"),
                ("META-INF/SIG-X", b"x"),
                ("install.rdf", b"rdf"),
            ],
        );

        let names = content_entries(&data)?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            vec!["content/a.js", "META-INF/cose.manifest", "install.rdf"]
        );

        Ok(())
    }

    #[test]
    fn content_entries_reject_duplicate_names() {
        let data = make_archive(&[("a.js", b"one"), ("b.js", b"b"), ("a.js", b"two")]);

        let err = content_entries(&data).unwrap_err();
        assert!(matches!(&err, XpiSigningError::DuplicateEntry(name) if name == "a.js"));
        assert_eq!(err.kind(), ErrorKind::ArchiveFormat);

        // Signature area duplicates are dropped, not rejected.
        let data = make_archive(&[
            ("a.js", b"a"),
            ("META-INF/mozilla.rsa", b"old"),
            ("META-INF/mozilla.rsa", b"older"),
        ]);
        assert_eq!(content_entries(&data).unwrap().len(), 1);
    }

    #[test]
    fn repack_replaces_signature_area() -> Result<(), XpiSigningError> {
        let data = make_archive_with_directories(
            &["content/"],
            &[
                ("content/a.js", b"a"),
                ("META-INF/manifest.mf", b"old manifest"),
                ("META-INF/mozilla.sf", b"old sf"),
                ("META-INF/mozilla.rsa", b"old rsa"),
                ("META-INF/zigbert.SF", b"old zigbert"),
                ("install.rdf", b"rdf"),
            ],
        );

        let repacked = repack(&data, b"manifest", b"sf", b"rsa")?;

        assert_eq!(
            entry_names(&repacked)?,
            vec![
                "content/",
                "content/a.js",
                "install.rdf",
                MANIFEST_PATH,
                SIGNATURE_FILE_PATH,
                SIGNATURE_PATH,
            ]
        );
        assert_eq!(read_entry(&repacked, "content/a.js")?, b"a");
        assert_eq!(read_entry(&repacked, "install.rdf")?, b"rdf");
        assert_eq!(read_entry(&repacked, MANIFEST_PATH)?, b"manifest");
        assert_eq!(read_entry(&repacked, SIGNATURE_FILE_PATH)?, b"sf");
        assert_eq!(read_entry(&repacked, SIGNATURE_PATH)?, b"rsa");

        let mut archive = open_archive(&repacked)?;
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(XpiSigningError::MalformedArchive)?;
            if !file.is_dir() {
                assert_eq!(file.compression(), CompressionMethod::Deflated);
            }
        }

        Ok(())
    }

    #[test]
    fn repack_generic_metafiles() -> Result<(), XpiSigningError> {
        let data = make_archive(&[("a.txt", b"a")]);

        let repacked = repack_with_metafiles(
            &data,
            &[
                Metafile::new(COSE_MANIFEST_PATH, "cose manifest"),
                Metafile::new(COSE_SIGNATURE_PATH, vec![0xd8, 0x62]),
            ],
        )?;

        assert_eq!(
            entry_names(&repacked)?,
            vec!["a.txt", COSE_MANIFEST_PATH, COSE_SIGNATURE_PATH]
        );
        assert_eq!(read_entry(&repacked, COSE_SIGNATURE_PATH)?, vec![0xd8, 0x62]);

        Ok(())
    }
}
