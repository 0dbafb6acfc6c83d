// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Detached PKCS#7 signatures.
//!
//! A [DetachedSignature] wraps the DER of a CMS `SignedData` whose
//! encapsulated content is absent. The signed content (the JAR signature
//! file) has to be supplied separately for verification.

use {
    crate::{certificate::IssuerCertificate, error::XpiSigningError},
    bcder::{
        encode::{PrimitiveContent, Values},
        Captured, Mode, Oid,
    },
    bytes::Bytes,
    chrono::Utc,
    cryptographic_message_syntax::{
        asn1::rfc5652::{
            self, CertificateChoices, CertificateSet, CmsVersion, DigestAlgorithmIdentifier,
            DigestAlgorithmIdentifiers, EncapsulatedContentInfo, IssuerAndSerialNumber,
            SignatureValue, SignedAttributes, SignerIdentifier, SignerInfos, OID_CONTENT_TYPE,
            OID_ID_DATA, OID_MESSAGE_DIGEST, OID_SIGNING_TIME,
        },
        CmsError, SignedData, SignerInfo,
    },
    log::debug,
    x509_certificate::{
        asn1time::UtcTime,
        rfc5652::{Attribute, AttributeValue},
        CapturedX509Certificate, DigestAlgorithm, KeyInfoSigner, Sign, Signer, X509Certificate,
    },
};

/// Longest certificate chain we will walk.
const MAX_CHAIN_DEPTH: usize = 8;

/// Digest algorithm of the message digest signed attribute.
///
/// Clients verifying JAR signatures only understand SHA-1 here.
pub const SIGNATURE_DIGEST_ALGORITHM: DigestAlgorithm = DigestAlgorithm::Sha1;

fn der_oid(oid: &[u8]) -> Oid {
    Oid(Bytes::copy_from_slice(oid))
}

fn build_signed_data(
    content: &[u8],
    signing_key: &dyn KeyInfoSigner,
    certificate: &CapturedX509Certificate,
    chain: &[CapturedX509Certificate],
) -> Result<Vec<u8>, CmsError> {
    let mut hasher = SIGNATURE_DIGEST_ALGORITHM.digester();
    hasher.update(content);
    let digest = hasher.finish();

    let mut signed_attributes = SignedAttributes::default();
    signed_attributes.push(Attribute {
        typ: der_oid(OID_CONTENT_TYPE.as_ref()),
        values: vec![AttributeValue::new(Captured::from_values(
            Mode::Der,
            OID_ID_DATA.encode_ref(),
        ))],
    });
    signed_attributes.push(Attribute {
        typ: der_oid(OID_MESSAGE_DIGEST.as_ref()),
        values: vec![AttributeValue::new(Captured::from_values(
            Mode::Der,
            digest.as_ref().encode(),
        ))],
    });
    signed_attributes.push(Attribute {
        typ: der_oid(OID_SIGNING_TIME.as_ref()),
        values: vec![AttributeValue::new(Captured::from_values(
            Mode::Der,
            UtcTime::now().encode(),
        ))],
    });

    // DER requires the SET OF to be sorted.
    let signed_attributes = signed_attributes.as_sorted()?;

    let mut signer_info = rfc5652::SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: certificate.issuer_name().clone(),
            serial_number: certificate.serial_number_asn1().clone(),
        }),
        digest_algorithm: DigestAlgorithmIdentifier {
            algorithm: SIGNATURE_DIGEST_ALGORITHM.into(),
            parameters: None,
        },
        signed_attributes: Some(signed_attributes),
        signature_algorithm: signing_key.signature_algorithm()?.into(),
        signature: SignatureValue::new(Bytes::new()),
        unsigned_attributes: None,
        signed_attributes_data: None,
    };

    let signed_content = signer_info
        .signed_attributes_digested_content()?
        .ok_or(CmsError::NoSignedAttributes)?;
    let signature = signing_key.try_sign(&signed_content)?;
    signer_info.signature = SignatureValue::new(Bytes::from(signature));

    let mut signer_infos = SignerInfos::default();
    signer_infos.push(signer_info);

    let mut digest_algorithms = DigestAlgorithmIdentifiers::default();
    digest_algorithms.push(DigestAlgorithmIdentifier {
        algorithm: SIGNATURE_DIGEST_ALGORITHM.into(),
        parameters: None,
    });

    // The signer's certificate leads, followed by its issuers.
    let mut certificates = CertificateSet::default();
    for cert in std::iter::once(certificate).chain(chain.iter()) {
        certificates.push(CertificateChoices::Certificate(Box::new(cert.clone().into())));
    }

    let signed_data = rfc5652::SignedData {
        version: CmsVersion::V1,
        digest_algorithms,
        content_info: EncapsulatedContentInfo {
            content_type: der_oid(OID_ID_DATA.as_ref()),
            content: None,
        },
        certificates: Some(certificates),
        crls: None,
        signer_infos,
    };

    let mut der = vec![];
    signed_data
        .encode_ref()
        .write_encoded(Mode::Der, &mut der)?;

    Ok(der)
}

/// Produce the DER of a detached CMS `SignedData` over `content`.
///
/// `certificate` belongs to `signing_key`. `chain` holds the issuing
/// certificates embedded after it. The message digest always uses
/// [SIGNATURE_DIGEST_ALGORITHM], which
/// [cryptographic_message_syntax::SignedDataBuilder] can't be configured
/// for, so the structure is assembled directly.
pub fn sign_detached(
    content: &[u8],
    signing_key: &dyn KeyInfoSigner,
    certificate: &CapturedX509Certificate,
    chain: &[CapturedX509Certificate],
) -> Result<Vec<u8>, XpiSigningError> {
    build_signed_data(content, signing_key, certificate, chain)
        .map_err(XpiSigningError::SignFinalize)
}

/// Trust anchors for chain verification.
#[derive(Clone, Debug, Default)]
pub struct TrustStore {
    anchors: Vec<CapturedX509Certificate>,
}

impl TrustStore {
    pub fn new(anchors: Vec<CapturedX509Certificate>) -> Self {
        Self { anchors }
    }

    /// Construct from one or more PEM encoded certificates.
    pub fn from_pem(data: impl AsRef<[u8]>) -> Result<Self, XpiSigningError> {
        let anchors = CapturedX509Certificate::from_pem_multiple(data)
            .map_err(|e| XpiSigningError::CertificateParse(e.to_string()))?;

        Ok(Self { anchors })
    }

    pub fn add(&mut self, cert: CapturedX509Certificate) {
        self.anchors.push(cert);
    }

    pub fn anchors(&self) -> &[CapturedX509Certificate] {
        &self.anchors
    }

    fn find_issuer(&self, cert: &X509Certificate) -> Option<&CapturedX509Certificate> {
        self.anchors.iter().find(|anchor| anchor.issued(cert))
    }
}

/// A detached PKCS#7 signature.
pub struct DetachedSignature {
    data: Vec<u8>,
    signed_data: Option<SignedData>,
    content: Vec<u8>,
}

impl std::fmt::Debug for DetachedSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedSignature")
            .field("data", &hex::encode(&self.data))
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl DetachedSignature {
    /// Wrap freshly produced signature bytes.
    ///
    /// The signature is not finished until [Self::finish] attaches content.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            signed_data: None,
            content: vec![],
        }
    }

    /// Parse the signature data and attach the content it was made over.
    pub fn finish(mut self, content: Vec<u8>) -> Result<Self, XpiSigningError> {
        if self.data.is_empty() {
            return Err(XpiSigningError::EmptySignatureData);
        }

        let signed_data = SignedData::parse_ber(&self.data).map_err(XpiSigningError::SignatureParse)?;

        self.signed_data = Some(signed_data);
        self.content = content;

        Ok(self)
    }

    pub fn is_finished(&self) -> bool {
        self.signed_data.is_some()
    }

    /// Raw DER of the signature.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The detached content the signature covers.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    fn signed_data(&self) -> Result<&SignedData, XpiSigningError> {
        self.signed_data
            .as_ref()
            .ok_or(XpiSigningError::UnfinishedSignature)
    }

    /// Certificates embedded in the signature.
    pub fn certificates(&self) -> Result<Vec<CapturedX509Certificate>, XpiSigningError> {
        Ok(self.signed_data()?.certificates().cloned().collect::<Vec<_>>())
    }

    /// Encode to the base64 transport form.
    pub fn marshal(&self) -> Result<String, XpiSigningError> {
        if !self.is_finished() {
            return Err(XpiSigningError::UnfinishedSignature);
        }
        if self.data.is_empty() {
            return Err(XpiSigningError::EmptySignatureData);
        }

        Ok(base64::encode(&self.data))
    }

    /// Decode the base64 transport form and attach `content`.
    pub fn unmarshal(signature: &str, content: Vec<u8>) -> Result<Self, XpiSigningError> {
        let data = base64::decode(signature)?;

        Self::new(data).finish(content)
    }

    /// Render as a PEM `PKCS7` block.
    pub fn to_pem(&self) -> Result<String, XpiSigningError> {
        if !self.is_finished() {
            return Err(XpiSigningError::UnfinishedSignature);
        }

        Ok(pem::encode_config(
            &pem::Pem {
                tag: "PKCS7".to_string(),
                contents: self.data.clone(),
            },
            pem::EncodeConfig {
                line_ending: pem::LineEnding::LF,
            },
        ))
    }

    /// Verify every signer over the attached content.
    ///
    /// Each signer's signature and message digest are always verified. When
    /// `trust` is given, the signer's certificate must also chain through the
    /// embedded certificates to one of its anchors. `None` means the
    /// embedded certificates are trusted as is.
    pub fn verify_with_chain(&self, trust: Option<&TrustStore>) -> Result<(), XpiSigningError> {
        let signed_data = self.signed_data()?;

        let mut signers = 0;
        for signer in signed_data.signers() {
            signers += 1;

            signer
                .verify_signature_with_signed_data(signed_data)
                .map_err(XpiSigningError::SignatureVerification)?;
            signer
                .verify_message_digest_with_content(&self.content)
                .map_err(XpiSigningError::SignatureVerification)?;

            if let Some(trust) = trust {
                let cert = signer_certificate(signed_data, signer)?;
                verify_chain(signed_data, cert, trust)?;
            }
        }

        if signers == 0 {
            return Err(XpiSigningError::ChainVerification(
                "signature has no signers".into(),
            ));
        }

        debug!("verified {} signer(s)", signers);

        Ok(())
    }
}

impl std::fmt::Display for DetachedSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_pem() {
            Ok(pem) => f.write_str(&pem),
            Err(_) => f.write_str("<unfinished PKCS7 signature>"),
        }
    }
}

fn signer_certificate<'a>(
    signed_data: &'a SignedData,
    signer: &SignerInfo,
) -> Result<&'a CapturedX509Certificate, XpiSigningError> {
    let (issuer, serial) = signer
        .certificate_issuer_and_serial()
        .ok_or(XpiSigningError::SignerCertificateNotFound)?;

    signed_data
        .certificates()
        .find(|cert| cert.issuer_name() == issuer && cert.serial_number_asn1() == serial)
        .ok_or(XpiSigningError::SignerCertificateNotFound)
}

/// Walk from `leaf` to a trust anchor.
///
/// Every hop checks name linkage, that the issuer is a CA, that the issuer
/// signed the certificate, and that both are currently valid.
fn verify_chain(
    signed_data: &SignedData,
    leaf: &CapturedX509Certificate,
    trust: &TrustStore,
) -> Result<(), XpiSigningError> {
    let now = Utc::now();
    let embedded = signed_data.certificates().collect::<Vec<_>>();

    let mut current = leaf;

    for _ in 0..MAX_CHAIN_DEPTH {
        if !current.time_constraints_valid(Some(now)) {
            return Err(XpiSigningError::ChainVerification(format!(
                "certificate {} is not valid at {}",
                describe(current),
                now
            )));
        }

        if let Some(anchor) = trust.find_issuer(current) {
            check_issuer(current, anchor, now)?;
            debug!("chain terminates at anchor {}", describe(anchor));
            return Ok(());
        }

        let issuer = embedded
            .iter()
            .find(|cert| {
                cert.issued(current) && cert.constructed_data() != current.constructed_data()
            })
            .ok_or_else(|| {
                XpiSigningError::ChainVerification(format!(
                    "no issuer found for {}",
                    describe(current)
                ))
            })?;

        check_issuer(current, issuer, now)?;

        current = *issuer;
    }

    Err(XpiSigningError::ChainVerification(
        "certificate chain too long".into(),
    ))
}

fn check_issuer(
    cert: &CapturedX509Certificate,
    issuer: &CapturedX509Certificate,
    now: chrono::DateTime<Utc>,
) -> Result<(), XpiSigningError> {
    if !issuer.is_ca()? {
        return Err(XpiSigningError::ChainVerification(format!(
            "issuer {} is not a CA",
            describe(issuer)
        )));
    }

    if !issuer.time_constraints_valid(Some(now)) {
        return Err(XpiSigningError::ChainVerification(format!(
            "issuer {} is not valid at {}",
            describe(issuer),
            now
        )));
    }

    cert.verify_signed_by_certificate(issuer).map_err(|e| {
        XpiSigningError::ChainVerification(format!(
            "{} is not signed by {}: {}",
            describe(cert),
            describe(issuer),
            e
        ))
    })
}

fn describe(cert: &CapturedX509Certificate) -> String {
    cert.subject_common_name()
        .unwrap_or_else(|| "<no common name>".to_string())
}
