// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Verification of signed XPIs.

use {
    crate::{
        archive::{self, SIGNATURE_FILE_PATH, SIGNATURE_PATH},
        error::XpiSigningError,
        manifest,
        signature::{DetachedSignature, TrustStore},
    },
    log::{debug, info},
};

/// Read the PKCS#7 signature of a signed archive.
///
/// The returned signature carries the signature file as its content.
pub fn extract_signature(signed: &[u8]) -> Result<DetachedSignature, XpiSigningError> {
    let signature = archive::read_entry(signed, SIGNATURE_PATH)?;
    let signature_file = archive::read_entry(signed, SIGNATURE_FILE_PATH)?;

    DetachedSignature::unmarshal(&base64::encode(signature), signature_file)
}

/// Verify a signed archive using only the certificates it embeds.
pub fn verify_signed_file(signed: &[u8]) -> Result<(), XpiSigningError> {
    verify_signed_file_with_trust(signed, None)
}

/// Verify a signed archive.
///
/// The signature is verified, marshaled back to its transport form, compared
/// against the stored bytes, and verified again. The legacy manifest layers
/// are then checked against the archive content.
pub fn verify_signed_file_with_trust(
    signed: &[u8],
    trust: Option<&TrustStore>,
) -> Result<(), XpiSigningError> {
    let expected = base64::encode(archive::read_entry(signed, SIGNATURE_PATH)?);
    let signature = extract_signature(signed)?;

    signature.verify_with_chain(trust)?;

    let received = signature.marshal()?;
    if received != expected {
        return Err(XpiSigningError::SignatureRoundTripMismatch { expected, received });
    }

    let restored = DetachedSignature::unmarshal(&received, signature.content().to_vec())?;
    restored.verify_with_chain(trust)?;
    debug!("PKCS#7 signature survived marshal round trip");

    manifest::verify_manifest_consistency(signed)?;

    info!("verified signed XPI ({} bytes)", signed.len());

    Ok(())
}
