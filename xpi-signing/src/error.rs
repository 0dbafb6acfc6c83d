// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, thiserror::Error, x509_certificate::X509CertificateError,
};

/// Broad classification of [XpiSigningError] values.
///
/// Callers use this to decide how to react to a failure without matching
/// every variant: configuration errors are fatal for a signer, round trip
/// errors indicate an implementation bug rather than a bad signature, etc.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Signer construction input was rejected.
    Configuration,
    /// The archive is unparseable or lacks a required entry.
    ArchiveFormat,
    /// Key generation, certificate issuance, signing, or verification failed.
    CryptoOperation,
    /// The alternate COSE envelope violates a structural rule.
    EnvelopeValidation,
    /// Parsing and serializing a signature are not exact inverses.
    RoundTrip,
    /// Command line usage or generic I/O.
    Io,
}

/// Unified error type for XPI signing.
#[derive(Debug, Error)]
pub enum XpiSigningError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Signer configuration.
    #[error("signer type {0:?} is not xpi")]
    InvalidSignerType(String),

    #[error("signer id is empty")]
    MissingSignerId,

    #[error("signer has no private key")]
    MissingPrivateKey,

    #[error("failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("signer has no certificate")]
    MissingCertificate,

    #[error("PEM error: {0}")]
    CertificatePem(#[from] pem::PemError),

    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("issuer certificate is not a CA")]
    IssuerNotCa,

    #[error("issuer certificate is not valid at {now}: valid from {not_before} to {not_after}")]
    IssuerCertificateNotTimeValid {
        now: chrono::DateTime<chrono::Utc>,
        not_before: chrono::DateTime<chrono::Utc>,
        not_after: chrono::DateTime<chrono::Utc>,
    },

    #[error("issuer certificate lacks the keyCertSign key usage")]
    IssuerMissingCertSign,

    #[error("issuer certificate lacks the codeSigning extended key usage")]
    IssuerMissingCodeSigning,

    #[error("issuer private key does not match issuer certificate")]
    IssuerKeyMismatch,

    #[error("unknown signer mode {0:?}")]
    UnknownMode(String),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),

    // Archive handling.
    #[error("malformed archive: {0}")]
    MalformedArchive(#[source] zip::result::ZipError),

    #[error("archive entry {0} not found")]
    EntryNotFound(String),

    #[error("archive entry {0} appears more than once")]
    DuplicateEntry(String),

    #[error("failed to read archive entry {name}: {source}")]
    EntryReadFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive entry {name}: {source}")]
    EntryWriteFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to finish archive: {0}")]
    ArchiveWriteFailure(#[source] zip::result::ZipError),

    // Cryptographic operations.
    #[error("no common name for end-entity certificate")]
    MissingCommonName,

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("end-entity certificate issuance failed: {0}")]
    CertificateIssuance(#[source] X509CertificateError),

    #[error("failed to initialize signed data: {0}")]
    SignedDataInit(#[source] X509CertificateError),

    #[error("failed to finalize signature: {0}")]
    SignFinalize(#[source] CmsError),

    #[error("signature is not finished")]
    UnfinishedSignature,

    #[error("signature data is empty")]
    EmptySignatureData,

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("failed to parse signature: {0}")]
    SignatureParse(#[source] CmsError),

    #[error("signature verification failed: {0}")]
    SignatureVerification(#[source] CmsError),

    #[error("signature carries no certificate for signer")]
    SignerCertificateNotFound,

    #[error("certificate chain verification failed: {0}")]
    ChainVerification(String),

    #[error("RSA key cache producer is no longer running")]
    KeyCacheClosed,

    #[error("manifest mismatch: {0}")]
    ManifestMismatch(String),

    // Alternate envelope validation.
    #[error("required artifact {0} not found in archive")]
    ArtifactNotFound(String),

    #[error("legacy manifest does not reference COSE artifacts")]
    InconsistentManifestReferences,

    #[error("COSE manifest references COSE artifacts")]
    SelfReferencingManifest,

    #[error("failed to parse COSE envelope: {0}")]
    EnvelopeParse(String),

    #[error("envelope has {found} signatures; expected {expected}")]
    SignatureCountMismatch { found: usize, expected: usize },

    #[error("envelope payload is present")]
    UnexpectedPayload,

    #[error("{location} has non-empty unprotected headers")]
    UnexpectedUnprotectedHeaders { location: String },

    #[error("{location} has {found} protected headers; expected {expected}")]
    ProtectedHeaderCardinalityMismatch {
        location: String,
        expected: usize,
        found: usize,
    },

    #[error("{location} lacks protected header {label}")]
    MissingProtectedHeader { location: String, label: i64 },

    #[error("{location} uses unsupported algorithm {value}")]
    UnsupportedAlgorithm { location: String, value: String },

    #[error("{location} has an undecodable certificate: {reason}")]
    CertificateDecode { location: String, reason: String },

    // Round trip.
    #[error("signature round trip mismatch: expected {expected}, received {received}")]
    SignatureRoundTripMismatch { expected: String, received: String },
}

impl XpiSigningError {
    /// Obtain the [ErrorKind] this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CliUnknownCommand
            | Self::CliBadArgument(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Json(_) => ErrorKind::Io,

            Self::InvalidSignerType(_)
            | Self::MissingSignerId
            | Self::MissingPrivateKey
            | Self::PrivateKeyParse(_)
            | Self::MissingCertificate
            | Self::CertificatePem(_)
            | Self::CertificateParse(_)
            | Self::IssuerNotCa
            | Self::IssuerCertificateNotTimeValid { .. }
            | Self::IssuerMissingCertSign
            | Self::IssuerMissingCodeSigning
            | Self::IssuerKeyMismatch
            | Self::UnknownMode(_)
            | Self::UnsupportedKeyAlgorithm(_) => ErrorKind::Configuration,

            Self::MalformedArchive(_)
            | Self::EntryNotFound(_)
            | Self::DuplicateEntry(_)
            | Self::EntryReadFailure { .. }
            | Self::EntryWriteFailure { .. }
            | Self::ArchiveWriteFailure(_) => ErrorKind::ArchiveFormat,

            Self::MissingCommonName
            | Self::KeyGeneration(_)
            | Self::CertificateIssuance(_)
            | Self::SignedDataInit(_)
            | Self::SignFinalize(_)
            | Self::UnfinishedSignature
            | Self::EmptySignatureData
            | Self::Base64Decode(_)
            | Self::SignatureParse(_)
            | Self::SignatureVerification(_)
            | Self::SignerCertificateNotFound
            | Self::ChainVerification(_)
            | Self::KeyCacheClosed
            | Self::ManifestMismatch(_) => ErrorKind::CryptoOperation,

            Self::ArtifactNotFound(_)
            | Self::InconsistentManifestReferences
            | Self::SelfReferencingManifest
            | Self::EnvelopeParse(_)
            | Self::SignatureCountMismatch { .. }
            | Self::UnexpectedPayload
            | Self::UnexpectedUnprotectedHeaders { .. }
            | Self::ProtectedHeaderCardinalityMismatch { .. }
            | Self::MissingProtectedHeader { .. }
            | Self::UnsupportedAlgorithm { .. }
            | Self::CertificateDecode { .. } => ErrorKind::EnvelopeValidation,

            Self::SignatureRoundTripMismatch { .. } => ErrorKind::RoundTrip,
        }
    }
}
