// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing of XPI add-on archives in pure Rust.
//!
//! An XPI is a zip archive. Signing one follows the JAR signing scheme:
//!
//! 1. Every content entry is digested with SHA-1 and SHA-256 into a
//!    manifest (`META-INF/manifest.mf`).
//! 2. The manifest is digested into a signature file (`META-INF/mozilla.sf`).
//! 3. The signature file is signed with a detached PKCS#7 signature
//!    (`META-INF/mozilla.rsa`) made by a short-lived end-entity certificate
//!    issued from a long-lived issuer.
//! 4. The archive is rewritten with any old signature entries removed and
//!    the three new ones appended.
//!
//! The main entry points are [XpiSigner::sign_file] and
//! [verify::verify_signed_file].
//!
//! Archives may also carry a COSE signature (`META-INF/cose.sig`). The
//! [cose] module checks the structure of those envelopes but does not
//! produce them.
//!
//! RSA issuers need a fresh RSA key per signature. Key generation runs on a
//! background thread feeding [key_cache::RsaKeyCache] so signing rarely has
//! to wait for it.

pub mod archive;
pub mod certificate;
pub mod config;
pub mod cose;
mod error;
pub mod key_cache;
pub mod manifest;
pub mod signature;
pub mod signer;
#[cfg(test)]
mod testutil;
pub mod verify;

pub use crate::{
    config::{SignerConfiguration, SignerMode, SigningOptions},
    cose::{verify_cose_signatures, CoseAlgorithm},
    error::{ErrorKind, XpiSigningError},
    signature::{DetachedSignature, TrustStore},
    signer::XpiSigner,
    verify::verify_signed_file,
};
