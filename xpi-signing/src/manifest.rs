// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JAR manifest and signature file handling.
//!
//! The manifest records a SHA-1 and SHA-256 digest of every content entry in
//! an archive. The signature file records the same two digests over the
//! manifest itself and is what actually gets signed.

use {
    crate::{
        archive::{self, MANIFEST_PATH, SIGNATURE_FILE_PATH},
        error::XpiSigningError,
    },
    log::debug,
    ring::digest,
};

const MANIFEST_HEADER: &str = "Manifest-Version: 1.0";
const SIGNATURE_FILE_HEADER: &str = "Signature-Version: 1.0";

fn sha1(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data)
        .as_ref()
        .to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Split manifest text into blocks of `(key, value)` pairs.
fn parse_blocks(data: &[u8], what: &str) -> Result<Vec<Vec<(String, String)>>, XpiSigningError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| XpiSigningError::ManifestMismatch(format!("{} is not UTF-8: {}", what, e)))?;

    let mut blocks = vec![];
    let mut current = vec![];

    for line in text.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }

        let (key, value) = line.split_once(": ").ok_or_else(|| {
            XpiSigningError::ManifestMismatch(format!("malformed {} line: {}", what, line))
        })?;
        current.push((key.to_string(), value.to_string()));
    }

    if !current.is_empty() {
        blocks.push(current);
    }

    Ok(blocks)
}

fn block_value<'a>(block: &'a [(String, String)], key: &str) -> Option<&'a str> {
    block
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn decode_digest(block: &[(String, String)], key: &str, what: &str) -> Result<Vec<u8>, XpiSigningError> {
    let value = block_value(block, key)
        .ok_or_else(|| XpiSigningError::ManifestMismatch(format!("{} lacks {}", what, key)))?;

    Ok(base64::decode(value)?)
}

/// Digests of a single archive entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    pub sha1: Vec<u8>,
    pub sha256: Vec<u8>,
}

impl ManifestEntry {
    pub fn from_content(name: impl ToString, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            sha1: sha1(data),
            sha256: sha256(data),
        }
    }
}

/// A JAR manifest.
///
/// Entries are kept in archive order, which is significant for producing
/// byte identical output.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Compute the manifest of an archive.
    pub fn from_archive(data: &[u8]) -> Result<Self, XpiSigningError> {
        let entries = archive::content_entries(data)?
            .into_iter()
            .map(|(name, content)| {
                debug!("digesting {} ({} bytes)", name, content.len());
                ManifestEntry::from_content(name, &content)
            })
            .collect::<Vec<_>>();

        Ok(Self { entries })
    }

    /// Parse manifest text.
    pub fn parse(data: &[u8]) -> Result<Self, XpiSigningError> {
        let mut blocks = parse_blocks(data, "manifest")?.into_iter();

        match blocks.next() {
            Some(header) if block_value(&header, "Manifest-Version") == Some("1.0") => {}
            _ => {
                return Err(XpiSigningError::ManifestMismatch(
                    "manifest lacks version header".into(),
                ));
            }
        }

        let entries = blocks
            .map(|block| {
                let name = block_value(&block, "Name").ok_or_else(|| {
                    XpiSigningError::ManifestMismatch("manifest block lacks Name".into())
                })?;

                Ok(ManifestEntry {
                    name: name.to_string(),
                    sha1: decode_digest(&block, "SHA1-Digest", name)?,
                    sha256: decode_digest(&block, "SHA256-Digest", name)?,
                })
            })
            .collect::<Result<Vec<_>, XpiSigningError>>()?;

        Ok(Self { entries })
    }

    /// Serialize to the JAR manifest text format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = format!("{}\n\n", MANIFEST_HEADER);

        for entry in &self.entries {
            s.push_str(&format!(
                "Name: {}\nDigest-Algorithms: SHA1 SHA256\nSHA1-Digest: {}\nSHA256-Digest: {}\n\n",
                entry.name,
                base64::encode(&entry.sha1),
                base64::encode(&entry.sha256)
            ));
        }

        s.into_bytes()
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// A JAR signature file: digests of the manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureFile {
    pub manifest_sha1: Vec<u8>,
    pub manifest_sha256: Vec<u8>,
}

impl SignatureFile {
    pub fn from_manifest(manifest: &[u8]) -> Self {
        Self {
            manifest_sha1: sha1(manifest),
            manifest_sha256: sha256(manifest),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, XpiSigningError> {
        let blocks = parse_blocks(data, "signature file")?;
        let header = match blocks.first() {
            Some(header) if block_value(header, "Signature-Version") == Some("1.0") => header,
            _ => {
                return Err(XpiSigningError::ManifestMismatch(
                    "signature file lacks version header".into(),
                ));
            }
        };

        Ok(Self {
            manifest_sha1: decode_digest(header, "SHA1-Digest-Manifest", "signature file")?,
            manifest_sha256: decode_digest(header, "SHA256-Digest-Manifest", "signature file")?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}\nSHA1-Digest-Manifest: {}\nSHA256-Digest-Manifest: {}\n\n",
            SIGNATURE_FILE_HEADER,
            base64::encode(&self.manifest_sha1),
            base64::encode(&self.manifest_sha256)
        )
        .into_bytes()
    }
}

/// Build the JAR manifest for archive data.
pub fn build_manifest(data: &[u8]) -> Result<Vec<u8>, XpiSigningError> {
    Ok(Manifest::from_archive(data)?.to_bytes())
}

/// Build the signature file for manifest data.
pub fn build_signature_file(manifest: &[u8]) -> Vec<u8> {
    SignatureFile::from_manifest(manifest).to_bytes()
}

/// Verify the legacy manifest layers of a signed archive agree with its content.
///
/// Every content entry must be listed in the embedded manifest with matching
/// digests, the manifest must not list anything else, and the signature file
/// must carry the digests of the embedded manifest.
pub fn verify_manifest_consistency(signed: &[u8]) -> Result<(), XpiSigningError> {
    let manifest_data = archive::read_entry(signed, MANIFEST_PATH)?;
    let signature_file = SignatureFile::parse(&archive::read_entry(signed, SIGNATURE_FILE_PATH)?)?;

    if signature_file != SignatureFile::from_manifest(&manifest_data) {
        return Err(XpiSigningError::ManifestMismatch(
            "signature file digests do not match manifest".into(),
        ));
    }

    let recorded = Manifest::parse(&manifest_data)?;
    let actual = Manifest::from_archive(signed)?;

    for entry in &actual.entries {
        match recorded.get(&entry.name) {
            Some(recorded_entry) if recorded_entry == entry => {}
            Some(_) => {
                return Err(XpiSigningError::ManifestMismatch(format!(
                    "digest mismatch for {}",
                    entry.name
                )));
            }
            None => {
                return Err(XpiSigningError::ManifestMismatch(format!(
                    "{} is not listed in manifest",
                    entry.name
                )));
            }
        }
    }

    if let Some(extra) = recorded
        .entries
        .iter()
        .find(|e| actual.get(&e.name).is_none())
    {
        return Err(XpiSigningError::ManifestMismatch(format!(
            "manifest lists missing entry {}",
            extra.name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::*, indoc::indoc};

    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hello_digests() -> Result<(), XpiSigningError> {
        let data = make_archive(&[("hello.txt", b"hello")]);
        let manifest = build_manifest(&data)?;

        let expected = format!(
            "Manifest-Version: 1.0\n\nName: hello.txt\nDigest-Algorithms: SHA1 SHA256\nSHA1-Digest: {}\nSHA256-Digest: {}\n\n",
            base64::encode(hex::decode(HELLO_SHA1).unwrap()),
            base64::encode(hex::decode(HELLO_SHA256).unwrap())
        );
        assert_eq!(String::from_utf8(manifest.clone()).unwrap(), expected);

        let parsed = Manifest::parse(&manifest)?;
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(hex::encode(&parsed.entries[0].sha1), HELLO_SHA1);
        assert_eq!(hex::encode(&parsed.entries[0].sha256), HELLO_SHA256);

        Ok(())
    }

    #[test]
    fn deterministic() -> Result<(), XpiSigningError> {
        let data = make_archive(&[("b.js", b"b"), ("a.js", b"a"), ("c/d.css", b"d")]);

        let first = build_manifest(&data)?;
        assert_eq!(first, build_manifest(&data)?);

        let names = Manifest::parse(&first)?
            .entries
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b.js", "a.js", "c/d.css"]);

        Ok(())
    }

    #[test]
    fn excludes_directories_and_signature_area() -> Result<(), XpiSigningError> {
        let data = make_archive_with_directories(
            &["content/", "META-INF/"],
            &[
                ("content/a.js", b"a"),
                ("META-INF/manifest.mf", b"old"),
                ("META-INF/MANIFEST.MF", b"old"),
                ("META-INF/foo.SF", b"old"),
                ("META-INF/mozilla.rsa", b"old"),
                ("META-INF/SIG-X", b"old"),
                ("META-INF/sig-y", b"old"),
            ],
        );

        let manifest = Manifest::parse(&build_manifest(&data)?)?;
        let names = manifest
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["content/a.js"]);

        Ok(())
    }

    #[test]
    fn empty_archive() -> Result<(), XpiSigningError> {
        let data = make_archive(&[]);

        assert_eq!(build_manifest(&data)?, b"Manifest-Version: 1.0\n\n");

        Ok(())
    }

    #[test]
    fn signature_file_format() -> Result<(), XpiSigningError> {
        let sf = build_signature_file(b"hello");

        assert_eq!(
            String::from_utf8(sf.clone()).unwrap(),
            indoc! {"
                Signature-Version: 1.0
                SHA1-Digest-Manifest: qvTGHdzF6KLavt4PO0gs2a6pQ00=
                SHA256-Digest-Manifest: LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=

            "}
        );

        let parsed = SignatureFile::parse(&sf)?;
        assert_eq!(hex::encode(parsed.manifest_sha1), HELLO_SHA1);
        assert_eq!(hex::encode(parsed.manifest_sha256), HELLO_SHA256);

        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Manifest::parse(b"Name: foo\n\n"),
            Err(XpiSigningError::ManifestMismatch(_))
        ));
        assert!(matches!(
            Manifest::parse(b"Manifest-Version: 1.0\n\nName: foo\nSHA1-Digest: !!!\n\n"),
            Err(XpiSigningError::Base64Decode(_))
        ));
        assert!(matches!(
            SignatureFile::parse(b"garbage"),
            Err(XpiSigningError::ManifestMismatch(_))
        ));
    }

    #[test]
    fn consistency() -> Result<(), XpiSigningError> {
        let data = make_archive(&[("a.js", b"a"), ("b.js", b"b")]);
        let manifest = build_manifest(&data)?;
        let sf = build_signature_file(&manifest);

        let good = archive::repack(&data, &manifest, &sf, b"sig")?;
        verify_manifest_consistency(&good)?;

        // Stale signature file.
        let bad = archive::repack(&data, &manifest, &build_signature_file(b"other"), b"sig")?;
        assert!(matches!(
            verify_manifest_consistency(&bad),
            Err(XpiSigningError::ManifestMismatch(_))
        ));

        // Content changed after manifest generation.
        let changed = make_archive(&[("a.js", b"A"), ("b.js", b"b")]);
        let bad = archive::repack(&changed, &manifest, &sf, b"sig")?;
        assert!(matches!(
            verify_manifest_consistency(&bad),
            Err(XpiSigningError::ManifestMismatch(_))
        ));

        // Entry added after manifest generation.
        let added = make_archive(&[("a.js", b"a"), ("b.js", b"b"), ("c.js", b"c")]);
        let bad = archive::repack(&added, &manifest, &sf, b"sig")?;
        assert!(matches!(
            verify_manifest_consistency(&bad),
            Err(XpiSigningError::ManifestMismatch(_))
        ));

        // Entry removed after manifest generation.
        let removed = make_archive(&[("a.js", b"a")]);
        let bad = archive::repack(&removed, &manifest, &sf, b"sig")?;
        assert!(matches!(
            verify_manifest_consistency(&bad),
            Err(XpiSigningError::ManifestMismatch(_))
        ));

        Ok(())
    }
}
