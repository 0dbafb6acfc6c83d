// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared test fixtures.

use {
    crate::{
        config::SignerConfiguration, error::XpiSigningError, signature::TrustStore,
        signer::XpiSigner,
    },
    minicbor::{data::Tag, Encoder},
    std::io::{Cursor, Write},
    x509_certificate::{EcdsaCurve, InMemorySigningKeyPair},
    zip::{write::FileOptions, CompressionMethod, ZipWriter},
};

pub const ISSUER_ECDSA_CERT: &str = include_str!("testdata/issuer-ecdsa.crt");
pub const ISSUER_ECDSA_KEY: &str = include_str!("testdata/issuer-ecdsa.key");
pub const ISSUER_RSA_CERT: &str = include_str!("testdata/issuer-rsa.crt");
pub const ISSUER_RSA_KEY: &str = include_str!("testdata/issuer-rsa.key");
pub const ISSUER_RSA_PKCS1_KEY: &str = include_str!("testdata/issuer-rsa-pkcs1.key");
pub const NOT_CA_CERT: &str = include_str!("testdata/not-ca.crt");
pub const EXPIRED_CERT: &str = include_str!("testdata/expired.crt");
pub const NOT_YET_VALID_CERT: &str = include_str!("testdata/not-yet-valid.crt");
pub const NO_CERT_SIGN_CERT: &str = include_str!("testdata/no-cert-sign.crt");
pub const NO_CODE_SIGNING_CERT: &str = include_str!("testdata/no-code-signing.crt");
pub const OTHER_ECDSA_CERT: &str = include_str!("testdata/other-ecdsa.crt");

/// Build a stored zip archive from `(name, data)` pairs, in order.
pub fn make_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    make_archive_with_directories(&[], files)
}

/// Build a stored zip archive with directory entries followed by files.
pub fn make_archive_with_directories(directories: &[&str], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zf = ZipWriter::new(Cursor::new(vec![]));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    for dir in directories {
        zf.add_directory(*dir, options).unwrap();
    }

    for (name, data) in files {
        zf.start_file(*name, options).unwrap();
        zf.write_all(data).unwrap();
    }

    zf.finish().unwrap().into_inner()
}

pub fn generate_ecdsa_key() -> InMemorySigningKeyPair {
    let pkcs8 = crate::signer::generate_ecdsa_pkcs8(EcdsaCurve::Secp256r1).unwrap();

    InMemorySigningKeyPair::from_pkcs8_der(&pkcs8).unwrap()
}

pub fn ecdsa_config(mode: &str) -> SignerConfiguration {
    SignerConfiguration {
        signer_type: "xpi".into(),
        id: "test-ecdsa".into(),
        private_key: ISSUER_ECDSA_KEY.into(),
        certificate: ISSUER_ECDSA_CERT.into(),
        mode: mode.into(),
    }
}

pub fn rsa_config(mode: &str) -> SignerConfiguration {
    SignerConfiguration {
        signer_type: "xpi".into(),
        id: "test-rsa".into(),
        private_key: ISSUER_RSA_KEY.into(),
        certificate: ISSUER_RSA_CERT.into(),
        mode: mode.into(),
    }
}

pub fn ecdsa_signer(mode: &str) -> Result<XpiSigner, XpiSigningError> {
    XpiSigner::from_config(ecdsa_config(mode))
}

pub fn ecdsa_trust_store() -> TrustStore {
    TrustStore::from_pem(ISSUER_ECDSA_CERT).unwrap()
}

pub fn rsa_trust_store() -> TrustStore {
    TrustStore::from_pem(ISSUER_RSA_CERT).unwrap()
}

/// A header value in a test envelope.
pub enum EnvelopeValue {
    Int(i64),
    Bytes(Vec<u8>),
    BytesArray(Vec<Vec<u8>>),
}

pub type EnvelopeHeaders = Vec<(i64, EnvelopeValue)>;

pub struct EnvelopeSignature {
    pub protected: EnvelopeHeaders,
    pub unprotected: EnvelopeHeaders,
}

/// Description of a `COSE_Sign` message to encode.
///
/// Signature values are the bytes `sig`. Nothing is validated, so any
/// malformed shape can be produced.
pub struct CoseEnvelope {
    pub tag: Option<u64>,
    pub protected: EnvelopeHeaders,
    pub unprotected: EnvelopeHeaders,
    pub payload: Option<Vec<u8>>,
    pub signatures: Vec<EnvelopeSignature>,
}

fn encode_headers(e: &mut Encoder<Vec<u8>>, headers: &EnvelopeHeaders) {
    e.map(headers.len() as u64).unwrap();

    for (label, value) in headers {
        e.i64(*label).unwrap();
        match value {
            EnvelopeValue::Int(v) => {
                e.i64(*v).unwrap();
            }
            EnvelopeValue::Bytes(v) => {
                e.bytes(v).unwrap();
            }
            EnvelopeValue::BytesArray(values) => {
                e.array(values.len() as u64).unwrap();
                for v in values {
                    e.bytes(v).unwrap();
                }
            }
        }
    }
}

fn encode_protected(e: &mut Encoder<Vec<u8>>, headers: &EnvelopeHeaders) {
    if headers.is_empty() {
        e.bytes(&[]).unwrap();
    } else {
        let mut inner = Encoder::new(Vec::<u8>::new());
        encode_headers(&mut inner, headers);
        e.bytes(&inner.into_writer()).unwrap();
    }
}

impl CoseEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new(Vec::<u8>::new());

        if let Some(tag) = self.tag {
            e.tag(Tag::Unassigned(tag)).unwrap();
        }
        e.array(4).unwrap();
        encode_protected(&mut e, &self.protected);
        encode_headers(&mut e, &self.unprotected);
        match &self.payload {
            Some(payload) => {
                e.bytes(payload).unwrap();
            }
            None => {
                e.null().unwrap();
            }
        }

        e.array(self.signatures.len() as u64).unwrap();
        for signature in &self.signatures {
            e.array(3).unwrap();
            encode_protected(&mut e, &signature.protected);
            encode_headers(&mut e, &signature.unprotected);
            e.bytes(b"sig").unwrap();
        }

        e.into_writer()
    }
}
