// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! XPI signer identity and signing.

use {
    crate::{
        archive,
        certificate::{CertificateTemplate, IssuerCertificate, OID_EKU_PURPOSE_CODE_SIGNING},
        config::{SignerConfiguration, SignerMode, SigningOptions, SIGNER_TYPE},
        error::XpiSigningError,
        key_cache::RsaKeyCache,
        manifest,
        signature::{sign_detached, DetachedSignature},
    },
    chrono::{Duration, Utc},
    log::{debug, info},
    ring::{
        rand::SystemRandom,
        signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING, ECDSA_P384_SHA384_ASN1_SIGNING},
    },
    rsa::{
        pkcs1::DecodeRsaPrivateKey,
        pkcs8::{DecodePrivateKey, EncodePrivateKey},
        traits::PublicKeyParts,
        RsaPrivateKey,
    },
    x509_certificate::{
        certificate::KeyUsage,
        rfc4519::{
            OID_COMMON_NAME, OID_COUNTRY_NAME, OID_LOCALITY_NAME, OID_ORGANIZATIONAL_UNIT_NAME,
            OID_ORGANIZATION_NAME, OID_STATE_PROVINCE_NAME,
        },
        CapturedX509Certificate, EcdsaCurve, InMemorySigningKeyPair, KeyAlgorithm, Sign,
    },
};

/// How end-entity keys are produced.
#[derive(Debug)]
enum EndEntityKeySource {
    /// RSA keys of the issuer's bit length, drawn from a background cache.
    Rsa(RsaKeyCache),
    /// ECDSA keys generated on demand on the issuer's curve.
    Ecdsa(EcdsaCurve),
}

/// Parse a PEM private key into PKCS#8 DER.
///
/// `PRIVATE KEY` (PKCS#8) and `RSA PRIVATE KEY` (PKCS#1) are accepted.
pub fn parse_private_key_pem(data: &str) -> Result<Vec<u8>, XpiSigningError> {
    let doc = pem::parse(data).map_err(|e| XpiSigningError::PrivateKeyParse(e.to_string()))?;

    match doc.tag.as_str() {
        "PRIVATE KEY" => Ok(doc.contents),
        "RSA PRIVATE KEY" => {
            let key = RsaPrivateKey::from_pkcs1_der(&doc.contents)
                .map_err(|e| XpiSigningError::PrivateKeyParse(e.to_string()))?;

            Ok(key
                .to_pkcs8_der()
                .map_err(|e| XpiSigningError::PrivateKeyParse(e.to_string()))?
                .as_bytes()
                .to_vec())
        }
        tag => Err(XpiSigningError::PrivateKeyParse(format!(
            "unsupported PEM tag {}",
            tag
        ))),
    }
}

/// Generate a PKCS#8 ECDSA key on `curve`.
pub fn generate_ecdsa_pkcs8(curve: EcdsaCurve) -> Result<Vec<u8>, XpiSigningError> {
    let algorithm = match curve {
        EcdsaCurve::Secp256r1 => &ECDSA_P256_SHA256_ASN1_SIGNING,
        EcdsaCurve::Secp384r1 => &ECDSA_P384_SHA384_ASN1_SIGNING,
        #[allow(unreachable_patterns)]
        other => {
            return Err(XpiSigningError::UnsupportedKeyAlgorithm(format!(
                "{:?}",
                other
            )));
        }
    };

    let doc = EcdsaKeyPair::generate_pkcs8(algorithm, &SystemRandom::new())
        .map_err(|e| XpiSigningError::KeyGeneration(format!("ECDSA: {}", e)))?;

    Ok(doc.as_ref().to_vec())
}

/// Encode an RSA key as PKCS#8 DER.
pub fn rsa_pkcs8(key: &RsaPrivateKey) -> Result<Vec<u8>, XpiSigningError> {
    Ok(key
        .to_pkcs8_der()
        .map_err(|e| XpiSigningError::KeyGeneration(format!("RSA: {}", e)))?
        .as_bytes()
        .to_vec())
}

/// A long-lived XPI signing identity.
///
/// Holds a CA issuer certificate and key. Each signing operation issues a
/// short-lived end-entity certificate chained to the issuer and signs with
/// it. All configuration is validated on construction.
pub struct XpiSigner {
    config: SignerConfiguration,
    mode: SignerMode,
    issuer_key: InMemorySigningKeyPair,
    issuer_cert: CapturedX509Certificate,
    key_source: EndEntityKeySource,
}

impl std::fmt::Debug for XpiSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XpiSigner")
            .field("id", &self.config.id)
            .field("mode", &self.mode)
            .field("issuer", &self.issuer_cert.subject_common_name())
            .field("key_source", &self.key_source)
            .finish()
    }
}

impl XpiSigner {
    /// Construct a signer, rejecting any invalid configuration.
    pub fn from_config(config: SignerConfiguration) -> Result<Self, XpiSigningError> {
        if config.signer_type != SIGNER_TYPE {
            return Err(XpiSigningError::InvalidSignerType(config.signer_type));
        }
        if config.id.is_empty() {
            return Err(XpiSigningError::MissingSignerId);
        }
        if config.private_key.trim().is_empty() {
            return Err(XpiSigningError::MissingPrivateKey);
        }
        if config.certificate.trim().is_empty() {
            return Err(XpiSigningError::MissingCertificate);
        }

        let pkcs8 = parse_private_key_pem(&config.private_key)?;
        let issuer_key = InMemorySigningKeyPair::from_pkcs8_der(&pkcs8)
            .map_err(|e| XpiSigningError::PrivateKeyParse(e.to_string()))?;

        let issuer_cert = CapturedX509Certificate::from_der(pem::parse(&config.certificate)?.contents)
            .map_err(|e| XpiSigningError::CertificateParse(e.to_string()))?;

        if !issuer_cert.is_ca()? {
            return Err(XpiSigningError::IssuerNotCa);
        }

        let now = Utc::now();
        if !issuer_cert.time_constraints_valid(Some(now)) {
            return Err(XpiSigningError::IssuerCertificateNotTimeValid {
                now,
                not_before: issuer_cert.validity_not_before(),
                not_after: issuer_cert.validity_not_after(),
            });
        }

        if !issuer_cert.has_key_usage(KeyUsage::KeyCertSign)? {
            return Err(XpiSigningError::IssuerMissingCertSign);
        }
        if !issuer_cert.has_extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)? {
            return Err(XpiSigningError::IssuerMissingCodeSigning);
        }

        if issuer_key.public_key_data() != issuer_cert.public_key_data() {
            return Err(XpiSigningError::IssuerKeyMismatch);
        }

        let mode = config.signer_mode()?;

        let key_source = match issuer_key.key_algorithm() {
            Some(KeyAlgorithm::Rsa) => {
                let bits = RsaPrivateKey::from_pkcs8_der(&pkcs8)
                    .map_err(|e| XpiSigningError::PrivateKeyParse(e.to_string()))?
                    .size()
                    * 8;
                EndEntityKeySource::Rsa(RsaKeyCache::new(bits)?)
            }
            Some(KeyAlgorithm::Ecdsa(curve)) => EndEntityKeySource::Ecdsa(curve),
            Some(other) => {
                return Err(XpiSigningError::UnsupportedKeyAlgorithm(format!(
                    "{:?}",
                    other
                )));
            }
            None => {
                return Err(XpiSigningError::UnsupportedKeyAlgorithm(
                    "unrecognized issuer key".into(),
                ));
            }
        };

        info!(
            "initialized {} signer {} in {} mode",
            SIGNER_TYPE, config.id, mode
        );

        Ok(Self {
            config,
            mode,
            issuer_key,
            issuer_cert,
            key_source,
        })
    }

    /// The configuration this signer was built from.
    pub fn config(&self) -> &SignerConfiguration {
        &self.config
    }

    pub fn mode(&self) -> SignerMode {
        self.mode
    }

    pub fn issuer_certificate(&self) -> &CapturedX509Certificate {
        &self.issuer_cert
    }

    /// Obtain a fresh end-entity key pair.
    fn end_entity_key(&self) -> Result<InMemorySigningKeyPair, XpiSigningError> {
        let pkcs8 = match &self.key_source {
            EndEntityKeySource::Rsa(cache) => rsa_pkcs8(&cache.acquire()?)?,
            EndEntityKeySource::Ecdsa(curve) => generate_ecdsa_pkcs8(*curve)?,
        };

        InMemorySigningKeyPair::from_pkcs8_der(&pkcs8).map_err(XpiSigningError::SignedDataInit)
    }

    /// Issue an end-entity certificate for `common_name` bound to `key`.
    fn issue_end_entity(
        &self,
        common_name: &str,
        key: &InMemorySigningKeyPair,
    ) -> Result<CapturedX509Certificate, XpiSigningError> {
        let now = Utc::now();
        let not_after = std::cmp::min(
            now + Duration::days(365),
            self.issuer_cert.validity_not_after(),
        );

        CertificateTemplate::new(Duration::days(365))
            .validity(now - Duration::minutes(1), not_after)
            .subject_attribute(&OID_COMMON_NAME, common_name)
            .subject_attribute(
                &OID_ORGANIZATIONAL_UNIT_NAME,
                self.mode.profile().organizational_unit,
            )
            .subject_attribute(&OID_ORGANIZATION_NAME, "Addons")
            .subject_attribute(&OID_COUNTRY_NAME, "US")
            .subject_attribute(&OID_STATE_PROVINCE_NAME, "CA")
            .subject_attribute(&OID_LOCALITY_NAME, "Mountain View")
            .key_usage(KeyUsage::DigitalSignature)
            .extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)
            .issue(self.issuer_cert.subject_name(), &self.issuer_key, key)
    }

    /// Resolve the end-entity common name for an operation.
    fn common_name<'a>(&self, options: &'a SigningOptions) -> Result<&'a str, XpiSigningError> {
        match self.mode.profile().common_name {
            Some(cn) => Ok(cn),
            None if !options.id.is_empty() => Ok(&options.id),
            None => Err(XpiSigningError::MissingCommonName),
        }
    }

    /// Produce raw detached PKCS#7 signature bytes over `data`.
    pub fn sign_data_raw(
        &self,
        data: &[u8],
        options: &SigningOptions,
    ) -> Result<Vec<u8>, XpiSigningError> {
        let common_name = self.common_name(options)?;

        let key = self.end_entity_key()?;
        let cert = self.issue_end_entity(common_name, &key)?;
        debug!("issued end-entity certificate for {}", common_name);

        sign_detached(data, &key, &cert, std::slice::from_ref(&self.issuer_cert))
    }

    /// Produce a finished detached signature over `data`.
    pub fn sign_data(
        &self,
        data: &[u8],
        options: &SigningOptions,
    ) -> Result<DetachedSignature, XpiSigningError> {
        DetachedSignature::new(self.sign_data_raw(data, options)?).finish(data.to_vec())
    }

    /// Sign an XPI, returning the repacked archive.
    ///
    /// Nothing is returned unless every stage succeeds.
    pub fn sign_file(
        &self,
        input: &[u8],
        options: &SigningOptions,
    ) -> Result<Vec<u8>, XpiSigningError> {
        let manifest = manifest::build_manifest(input)?;
        let signature_file = manifest::build_signature_file(&manifest);
        let signature = self.sign_data_raw(&signature_file, options)?;

        let output = archive::repack(input, &manifest, &signature_file, &signature)?;

        info!(
            "signed XPI for {} ({} bytes in, {} bytes out)",
            self.common_name(options)?,
            input.len(),
            output.len()
        );

        Ok(output)
    }
}
