// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! COSE signature envelopes.
//!
//! Besides the PKCS#7 signature, an XPI may carry a `COSE_Sign` message at
//! `META-INF/cose.sig` covering `META-INF/cose.manifest`. This module parses
//! that envelope and checks its structure:
//!
//! 1. The COSE manifest, the COSE signature and the legacy manifest exist.
//! 2. The legacy manifest names the COSE artifacts and the COSE manifest
//!    does not.
//! 3. The envelope decodes as a tagged `COSE_Sign` message.
//! 4. It has exactly one signature per requested algorithm.
//! 5. The outer headers carry only a `kid` array of intermediate
//!    certificates. Every signature carries only an allow-listed `alg` and a
//!    `kid` holding its end-entity certificate.
//!
//! Checks run in that order and stop at the first failure.
//!
//! Path validation from the end-entity certificates to a root is not done
//! here. Callers that have a trust policy can plug one in through
//! [CoseTrustVerifier].

use {
    crate::{
        archive::{self, COSE_MANIFEST_PATH, COSE_SIGNATURE_PATH, MANIFEST_PATH},
        config::SigningOptions,
        error::XpiSigningError,
    },
    log::debug,
    minicbor::{data::Tag, data::Type, Decoder},
    std::str::FromStr,
    x509_certificate::CapturedX509Certificate,
};

/// CBOR tag of a `COSE_Sign` message.
pub const COSE_SIGN_TAG: u64 = 98;

/// Header label of the algorithm identifier.
pub const HEADER_ALG: i64 = 1;

/// Header label of the key identifier.
pub const HEADER_KID: i64 = 4;

/// How deeply nested header values are decoded.
const MAX_NESTING: usize = 8;

type DecodeResult<T> = Result<T, minicbor::decode::Error>;

/// Signature algorithms accepted in COSE signatures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoseAlgorithm {
    Ps256,
    Es256,
    Es384,
    Es512,
}

impl CoseAlgorithm {
    pub fn all() -> &'static [Self] {
        &[Self::Ps256, Self::Es256, Self::Es384, Self::Es512]
    }

    /// The IANA COSE algorithm value.
    pub fn value(&self) -> i64 {
        match self {
            Self::Ps256 => -37,
            Self::Es256 => -7,
            Self::Es384 => -35,
            Self::Es512 => -36,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ps256 => "PS256",
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
            Self::Es512 => "ES512",
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        Self::all().iter().copied().find(|alg| alg.value() == value)
    }
}

impl std::fmt::Display for CoseAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CoseAlgorithm {
    type Err = XpiSigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| XpiSigningError::UnsupportedAlgorithm {
                location: "requested algorithms".into(),
                value: s.to_string(),
            })
    }
}

/// A COSE header map key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderLabel {
    Int(i64),
    Text(String),
}

/// A COSE header value.
///
/// Only the shapes the envelope checks look at are kept. Anything else is
/// recorded as [HeaderValue::Other].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<HeaderValue>),
    Other,
}

/// A decoded header map, in encoded order.
pub type HeaderMap = Vec<(HeaderLabel, HeaderValue)>;

fn header_get(map: &HeaderMap, label: i64) -> Option<&HeaderValue> {
    map.iter()
        .find(|(l, _)| *l == HeaderLabel::Int(label))
        .map(|(_, v)| v)
}

/// Protected and unprotected headers of a message or signature.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoseHeaders {
    pub protected: HeaderMap,
    pub unprotected: HeaderMap,
}

/// One `COSE_Signature`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoseSignature {
    pub headers: CoseHeaders,
    pub signature: Vec<u8>,
}

/// A `COSE_Sign` message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoseSignMessage {
    pub headers: CoseHeaders,
    pub payload: Option<Vec<u8>>,
    pub signatures: Vec<CoseSignature>,
}

fn decode_label(d: &mut Decoder) -> DecodeResult<HeaderLabel> {
    match d.datatype()? {
        Type::U8
        | Type::U16
        | Type::U32
        | Type::U64
        | Type::I8
        | Type::I16
        | Type::I32
        | Type::I64 => Ok(HeaderLabel::Int(d.i64()?)),
        Type::String => Ok(HeaderLabel::Text(d.str()?.to_string())),
        t => Err(minicbor::decode::Error::message(format!(
            "header label has unsupported type {}",
            t
        ))),
    }
}

fn decode_value(d: &mut Decoder, depth: usize) -> DecodeResult<HeaderValue> {
    match d.datatype()? {
        Type::U8
        | Type::U16
        | Type::U32
        | Type::U64
        | Type::I8
        | Type::I16
        | Type::I32
        | Type::I64 => Ok(HeaderValue::Int(d.i64()?)),
        Type::Bytes => Ok(HeaderValue::Bytes(d.bytes()?.to_vec())),
        Type::String => Ok(HeaderValue::Text(d.str()?.to_string())),
        Type::Array if depth < MAX_NESTING => {
            let len = d
                .array()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite length array"))?;

            // The length is attacker controlled, so nothing is reserved up front.
            let mut values = vec![];
            for _ in 0..len {
                values.push(decode_value(d, depth + 1)?);
            }

            Ok(HeaderValue::Array(values))
        }
        _ => {
            d.skip()?;
            Ok(HeaderValue::Other)
        }
    }
}

fn decode_map(d: &mut Decoder) -> DecodeResult<HeaderMap> {
    let len = d
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite length header map"))?;

    let mut map = HeaderMap::new();
    for _ in 0..len {
        let label = decode_label(d)?;
        if map.iter().any(|(l, _)| *l == label) {
            return Err(minicbor::decode::Error::message(format!(
                "duplicate header label {:?}",
                label
            )));
        }

        let value = decode_value(d, 0)?;
        map.push((label, value));
    }

    Ok(map)
}

/// Decode a serialized protected header map. An empty string is an empty map.
fn decode_protected(data: &[u8]) -> DecodeResult<HeaderMap> {
    if data.is_empty() {
        return Ok(HeaderMap::new());
    }

    let mut d = Decoder::new(data);
    let map = decode_map(&mut d)?;

    if d.position() != data.len() {
        return Err(minicbor::decode::Error::message(
            "trailing data after protected headers",
        ));
    }

    Ok(map)
}

fn decode_headers(d: &mut Decoder) -> DecodeResult<CoseHeaders> {
    let protected = decode_protected(d.bytes()?)?;
    let unprotected = decode_map(d)?;

    Ok(CoseHeaders {
        protected,
        unprotected,
    })
}

fn decode_signature(d: &mut Decoder) -> DecodeResult<CoseSignature> {
    if !matches!(d.array()?, Some(3)) {
        return Err(minicbor::decode::Error::message(
            "COSE_Signature is not an array of 3 elements",
        ));
    }

    let headers = decode_headers(d)?;
    let signature = d.bytes()?.to_vec();

    Ok(CoseSignature { headers, signature })
}

fn decode_message(data: &[u8]) -> DecodeResult<CoseSignMessage> {
    let mut d = Decoder::new(data);

    if d.datatype()? != Type::Tag {
        return Err(minicbor::decode::Error::message("untagged message"));
    }
    let tag = d.tag()?;
    if tag != Tag::Unassigned(COSE_SIGN_TAG) {
        return Err(minicbor::decode::Error::message(format!(
            "message tag {:?} is not COSE_Sign",
            tag
        )));
    }

    if !matches!(d.array()?, Some(4)) {
        return Err(minicbor::decode::Error::message(
            "COSE_Sign is not an array of 4 elements",
        ));
    }

    let headers = decode_headers(&mut d)?;

    let payload = match d.datatype()? {
        Type::Null => {
            d.null()?;
            None
        }
        _ => Some(d.bytes()?.to_vec()),
    };

    let count = d
        .array()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite length signatures"))?;
    let mut signatures = vec![];
    for _ in 0..count {
        signatures.push(decode_signature(&mut d)?);
    }

    if d.position() != data.len() {
        return Err(minicbor::decode::Error::message(
            "trailing data after COSE_Sign",
        ));
    }

    Ok(CoseSignMessage {
        headers,
        payload,
        signatures,
    })
}

impl CoseSignMessage {
    /// Parse a tagged `COSE_Sign` message.
    pub fn parse(data: &[u8]) -> Result<Self, XpiSigningError> {
        decode_message(data).map_err(|e| XpiSigningError::EnvelopeParse(e.to_string()))
    }
}

/// Certificates found in a structurally valid envelope.
#[derive(Clone, Debug)]
pub struct CoseCertificates {
    /// Certificates from the message `kid`.
    pub intermediates: Vec<CapturedX509Certificate>,
    /// One certificate per signature, in signature order.
    pub end_entities: Vec<CapturedX509Certificate>,
}

fn decode_certificate(location: &str, data: &[u8]) -> Result<CapturedX509Certificate, XpiSigningError> {
    CapturedX509Certificate::from_der(data.to_vec()).map_err(|e| XpiSigningError::CertificateDecode {
        location: location.to_string(),
        reason: e.to_string(),
    })
}

fn check_header_shape(
    location: &str,
    headers: &CoseHeaders,
    expected: usize,
) -> Result<(), XpiSigningError> {
    if !headers.unprotected.is_empty() {
        return Err(XpiSigningError::UnexpectedUnprotectedHeaders {
            location: location.to_string(),
        });
    }
    if headers.protected.len() != expected {
        return Err(XpiSigningError::ProtectedHeaderCardinalityMismatch {
            location: location.to_string(),
            expected,
            found: headers.protected.len(),
        });
    }

    Ok(())
}

fn required_header<'a>(
    location: &str,
    headers: &'a CoseHeaders,
    label: i64,
) -> Result<&'a HeaderValue, XpiSigningError> {
    header_get(&headers.protected, label).ok_or_else(|| XpiSigningError::MissingProtectedHeader {
        location: location.to_string(),
        label,
    })
}

fn validate_signature(
    location: &str,
    signature: &CoseSignature,
) -> Result<CapturedX509Certificate, XpiSigningError> {
    check_header_shape(location, &signature.headers, 2)?;

    match required_header(location, &signature.headers, HEADER_ALG)? {
        HeaderValue::Int(value) if CoseAlgorithm::from_value(*value).is_some() => {}
        HeaderValue::Int(value) => {
            return Err(XpiSigningError::UnsupportedAlgorithm {
                location: location.to_string(),
                value: value.to_string(),
            });
        }
        other => {
            return Err(XpiSigningError::UnsupportedAlgorithm {
                location: location.to_string(),
                value: format!("{:?}", other),
            });
        }
    }

    match required_header(location, &signature.headers, HEADER_KID)? {
        HeaderValue::Bytes(data) => decode_certificate(location, data),
        _ => Err(XpiSigningError::CertificateDecode {
            location: location.to_string(),
            reason: "kid is not a byte string".into(),
        }),
    }
}

/// Check the headers of a parsed message and extract its certificates.
pub fn validate_message(message: &CoseSignMessage) -> Result<CoseCertificates, XpiSigningError> {
    let location = "COSE_Sign";

    if message.payload.is_some() {
        return Err(XpiSigningError::UnexpectedPayload);
    }
    check_header_shape(location, &message.headers, 1)?;

    let kid = match required_header(location, &message.headers, HEADER_KID)? {
        HeaderValue::Array(values) => values,
        _ => {
            return Err(XpiSigningError::CertificateDecode {
                location: location.to_string(),
                reason: "kid is not an array".into(),
            });
        }
    };

    let intermediates = kid
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            HeaderValue::Bytes(data) => decode_certificate(location, data),
            _ => Err(XpiSigningError::CertificateDecode {
                location: location.to_string(),
                reason: format!("kid element {} is not a byte string", i),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let end_entities = message
        .signatures
        .iter()
        .enumerate()
        .map(|(i, signature)| validate_signature(&format!("signature {}", i), signature))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CoseCertificates {
        intermediates,
        end_entities,
    })
}

/// Validates envelope certificates against a trust policy.
///
/// No implementation ships with this crate.
pub trait CoseTrustVerifier {
    fn verify(&self, certificates: &CoseCertificates) -> Result<(), XpiSigningError>;
}

fn read_artifact(signed: &[u8], name: &str) -> Result<Vec<u8>, XpiSigningError> {
    archive::read_entry(signed, name).map_err(|e| match e {
        XpiSigningError::EntryNotFound(name) => XpiSigningError::ArtifactNotFound(name),
        e => e,
    })
}

/// Run the envelope checks on a signed archive.
pub fn verify_cose_signatures(
    signed: &[u8],
    options: &SigningOptions,
) -> Result<CoseCertificates, XpiSigningError> {
    verify_cose_signatures_with_trust(signed, options, None)
}

/// Run the envelope checks, then hand the certificates to `trust` if given.
pub fn verify_cose_signatures_with_trust(
    signed: &[u8],
    options: &SigningOptions,
    trust: Option<&dyn CoseTrustVerifier>,
) -> Result<CoseCertificates, XpiSigningError> {
    let cose_manifest = read_artifact(signed, COSE_MANIFEST_PATH)?;
    let envelope = read_artifact(signed, COSE_SIGNATURE_PATH)?;
    let manifest = read_artifact(signed, MANIFEST_PATH)?;

    let references = |data: &[u8]| {
        let text = String::from_utf8_lossy(data);
        (
            text.contains(COSE_MANIFEST_PATH),
            text.contains(COSE_SIGNATURE_PATH),
        )
    };
    if references(&manifest) != (true, true) {
        return Err(XpiSigningError::InconsistentManifestReferences);
    }
    if references(&cose_manifest) != (false, false) {
        return Err(XpiSigningError::SelfReferencingManifest);
    }

    let message = CoseSignMessage::parse(&envelope)?;

    if message.signatures.len() != options.cose_algorithms.len() {
        return Err(XpiSigningError::SignatureCountMismatch {
            found: message.signatures.len(),
            expected: options.cose_algorithms.len(),
        });
    }

    let certificates = validate_message(&message)?;
    debug!(
        "COSE envelope has {} intermediate(s) and {} signature(s)",
        certificates.intermediates.len(),
        certificates.end_entities.len()
    );

    if let Some(trust) = trust {
        trust.verify(&certificates)?;
    }

    Ok(certificates)
}
