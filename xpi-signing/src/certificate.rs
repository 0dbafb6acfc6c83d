// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! X.509 certificate inspection and issuance.
//!
//! [IssuerCertificate] reads the extensions that decide whether a
//! certificate may issue code signing certificates. [CertificateTemplate]
//! issues a certificate for one key signed by another, which
//! [x509_certificate::X509CertificateBuilder] can't do since it always signs
//! with the subject key.

use {
    crate::error::XpiSigningError,
    bcder::{
        decode::Constructed,
        encode::{PrimitiveContent, Values},
        BitString, ConstOid, Mode, OctetString, Oid,
    },
    bytes::Bytes,
    chrono::{DateTime, Datelike, Duration, Utc},
    x509_certificate::{
        asn1time::{GeneralizedTime, Time},
        certificate::KeyUsage,
        rfc3280::Name,
        rfc5280, CapturedX509Certificate, InMemorySigningKeyPair, Sign, Signer, X509Certificate,
        X509CertificateError,
    },
};

/// Key Usage extension.
///
/// 2.5.29.15
const OID_EXTENSION_KEY_USAGE: ConstOid = Oid(&[85, 29, 15]);

/// Basic Constraints extension.
///
/// 2.5.29.19
const OID_EXTENSION_BASIC_CONSTRAINTS: ConstOid = Oid(&[85, 29, 19]);

/// Extended Key Usage extension.
///
/// 2.5.29.37
const OID_EXTENSION_EXTENDED_KEY_USAGE: ConstOid = Oid(&[85, 29, 37]);

/// Extended Key Usage purpose for code signing.
///
/// 1.3.6.1.5.5.7.3.3
pub const OID_EKU_PURPOSE_CODE_SIGNING: ConstOid = Oid(&[43, 6, 1, 5, 5, 7, 3, 3]);

fn parse_error(e: impl std::fmt::Display) -> XpiSigningError {
    XpiSigningError::CertificateParse(e.to_string())
}

fn const_oid(oid: &ConstOid) -> Oid {
    Oid(Bytes::copy_from_slice(oid.as_ref()))
}

/// Extension and name checks used to validate certificate issuers.
pub trait IssuerCertificate {
    /// Find the first extension with the given OID.
    fn find_extension(&self, id: &ConstOid) -> Option<&rfc5280::Extension>;

    /// Whether basic constraints mark the certificate as a CA.
    fn is_ca(&self) -> Result<bool, XpiSigningError>;

    /// Whether the key usage extension is present and asserts `usage`.
    fn has_key_usage(&self, usage: KeyUsage) -> Result<bool, XpiSigningError>;

    /// Purposes listed by the extended key usage extension.
    fn extended_key_usage_purposes(&self) -> Result<Vec<Oid>, XpiSigningError>;

    fn has_extended_key_usage(&self, purpose: &ConstOid) -> Result<bool, XpiSigningError> {
        Ok(self
            .extended_key_usage_purposes()?
            .iter()
            .any(|oid| oid == purpose))
    }

    /// Whether `other` names this certificate's subject as its issuer.
    fn issued(&self, other: &X509Certificate) -> bool;
}

impl IssuerCertificate for X509Certificate {
    fn find_extension(&self, id: &ConstOid) -> Option<&rfc5280::Extension> {
        self.iter_extensions()
            .find(|extension| extension.id.as_ref() == id.as_ref())
    }

    fn is_ca(&self) -> Result<bool, XpiSigningError> {
        let extension = match self.find_extension(&OID_EXTENSION_BASIC_CONSTRAINTS) {
            Some(extension) => extension,
            None => return Ok(false),
        };

        Constructed::decode(extension.value.to_bytes(), Mode::Der, |cons| {
            cons.take_sequence(|cons| {
                let ca = cons.take_opt_bool()?.unwrap_or(false);
                cons.take_opt_u64()?;
                Ok(ca)
            })
        })
        .map_err(parse_error)
    }

    fn has_key_usage(&self, usage: KeyUsage) -> Result<bool, XpiSigningError> {
        let extension = match self.find_extension(&OID_EXTENSION_KEY_USAGE) {
            Some(extension) => extension,
            None => return Ok(false),
        };

        let bits = Constructed::decode(extension.value.to_bytes(), Mode::Der, BitString::take_from)
            .map_err(parse_error)?;

        Ok(bits.bit(u8::from(usage) as usize))
    }

    fn extended_key_usage_purposes(&self) -> Result<Vec<Oid>, XpiSigningError> {
        let extension = match self.find_extension(&OID_EXTENSION_EXTENDED_KEY_USAGE) {
            Some(extension) => extension,
            None => return Ok(vec![]),
        };

        Constructed::decode(extension.value.to_bytes(), Mode::Der, |cons| {
            cons.take_sequence(|cons| {
                let mut purposes = vec![];
                while let Some(oid) = Oid::take_opt_from(cons)? {
                    purposes.push(oid);
                }
                Ok(purposes)
            })
        })
        .map_err(parse_error)
    }

    fn issued(&self, other: &X509Certificate) -> bool {
        self.subject_name() == other.issuer_name()
    }
}

/// Convert to an ASN.1 `Time`, using UTCTime through 2049 as RFC 5280 requires.
///
/// Sub-second precision is dropped since DER times carry whole seconds.
fn asn1_time(time: DateTime<Utc>) -> Time {
    let time = time - Duration::nanoseconds(time.timestamp_subsec_nanos() as i64);

    if time.year() < 2050 {
        Time::from(time)
    } else {
        Time::GeneralTime(GeneralizedTime::from(time))
    }
}

fn issuance_error(e: impl Into<X509CertificateError>) -> XpiSigningError {
    XpiSigningError::CertificateIssuance(e.into())
}

/// Describes a certificate to be issued.
#[derive(Clone, Debug)]
pub struct CertificateTemplate {
    subject: Vec<(Oid, String)>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ca: bool,
    /// Key usage bits, most significant first.
    key_usage: u8,
    extended_key_usage: Vec<Oid>,
}

impl CertificateTemplate {
    /// A template valid from now for the given duration.
    pub fn new(validity: Duration) -> Self {
        let now = Utc::now();

        Self {
            subject: vec![],
            not_before: now,
            not_after: now.checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC),
            ca: false,
            key_usage: 0,
            extended_key_usage: vec![],
        }
    }

    /// Append an attribute to the subject name, one per RDN.
    pub fn subject_attribute(mut self, id: &ConstOid, value: impl ToString) -> Self {
        self.subject.push((const_oid(id), value.to_string()));
        self
    }

    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Mark the certificate as a certificate authority.
    pub fn ca(mut self, ca: bool) -> Self {
        self.ca = ca;
        self
    }

    pub fn key_usage(mut self, usage: KeyUsage) -> Self {
        self.key_usage |= 0x80 >> u8::from(usage);
        self
    }

    pub fn extended_key_usage(mut self, purpose: &ConstOid) -> Self {
        self.extended_key_usage.push(const_oid(purpose));
        self
    }

    fn subject_name(&self) -> Result<Name, XpiSigningError> {
        let mut name = Name::default();

        for (id, value) in &self.subject {
            // Countries are PrintableString per RFC 5280.
            let appended = if id == &x509_certificate::rfc4519::OID_COUNTRY_NAME {
                name.append_printable_string(id.clone(), value)
            } else {
                name.append_utf8_string(id.clone(), value)
            };

            appended.map_err(|e| {
                XpiSigningError::CertificateIssuance(X509CertificateError::Other(format!(
                    "subject attribute {}: {:?}",
                    id, e
                )))
            })?;
        }

        Ok(name)
    }

    fn extensions(&self) -> rfc5280::Extensions {
        let mut extensions = rfc5280::Extensions::default();

        if self.key_usage != 0 {
            let bits = BitString::new(
                self.key_usage.trailing_zeros() as u8,
                Bytes::copy_from_slice(&[self.key_usage]),
            );

            extensions.push(rfc5280::Extension {
                id: const_oid(&OID_EXTENSION_KEY_USAGE),
                critical: Some(true),
                value: OctetString::new(bits.encode().to_captured(Mode::Der).into_bytes()),
            });
        }

        if !self.extended_key_usage.is_empty() {
            let purposes = self
                .extended_key_usage
                .iter()
                .map(|oid| oid.encode_ref())
                .collect::<Vec<_>>();

            extensions.push(rfc5280::Extension {
                id: const_oid(&OID_EXTENSION_EXTENDED_KEY_USAGE),
                critical: Some(false),
                value: OctetString::new(
                    bcder::encode::sequence(purposes)
                        .to_captured(Mode::Der)
                        .into_bytes(),
                ),
            });
        }

        let basic_constraints = if self.ca {
            bcder::encode::sequence(true.encode())
                .to_captured(Mode::Der)
                .into_bytes()
        } else {
            Bytes::copy_from_slice(&[0x30, 0x00])
        };

        extensions.push(rfc5280::Extension {
            id: const_oid(&OID_EXTENSION_BASIC_CONSTRAINTS),
            critical: Some(self.ca),
            value: OctetString::new(basic_constraints),
        });

        extensions
    }

    /// Issue a certificate for `subject_key`, signed by `issuer_key` on
    /// behalf of `issuer_name`.
    pub fn issue(
        &self,
        issuer_name: &Name,
        issuer_key: &InMemorySigningKeyPair,
        subject_key: &InMemorySigningKeyPair,
    ) -> Result<CapturedX509Certificate, XpiSigningError> {
        let signature_algorithm = issuer_key.signature_algorithm().map_err(issuance_error)?;
        let subject_key_algorithm = subject_key.key_algorithm().ok_or_else(|| {
            XpiSigningError::UnsupportedKeyAlgorithm("unrecognized subject key".into())
        })?;
        // Positive and non-zero.
        let serial = (rand::random::<u64>() >> 1) | 1;

        let tbs_certificate = rfc5280::TbsCertificate {
            version: Some(rfc5280::Version::V3),
            serial_number: serial.into(),
            signature: signature_algorithm.into(),
            issuer: issuer_name.clone(),
            validity: rfc5280::Validity {
                not_before: asn1_time(self.not_before),
                not_after: asn1_time(self.not_after),
            },
            subject: self.subject_name()?,
            subject_public_key_info: rfc5280::SubjectPublicKeyInfo {
                algorithm: subject_key_algorithm.into(),
                subject_public_key: BitString::new(0, subject_key.public_key_data()),
            },
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(self.extensions()),
            raw_data: None,
        };

        let mut tbs_der = vec![];
        tbs_certificate
            .encode_ref()
            .write_encoded(Mode::Der, &mut tbs_der)
            .map_err(issuance_error)?;

        let signature = issuer_key.try_sign(&tbs_der).map_err(issuance_error)?;

        let cert = X509Certificate::from(rfc5280::Certificate {
            tbs_certificate,
            signature_algorithm: signature_algorithm.into(),
            signature: BitString::new(0, Bytes::copy_from_slice(signature.as_ref())),
        });

        CapturedX509Certificate::from_der(cert.encode_der().map_err(issuance_error)?)
            .map_err(XpiSigningError::CertificateIssuance)
    }

    /// Issue a self-signed certificate.
    pub fn self_sign(
        &self,
        key: &InMemorySigningKeyPair,
    ) -> Result<CapturedX509Certificate, XpiSigningError> {
        self.issue(&self.subject_name()?, key, key)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::*,
        chrono::TimeZone,
        x509_certificate::rfc4519::{OID_COMMON_NAME, OID_COUNTRY_NAME, OID_ORGANIZATIONAL_UNIT_NAME},
    };

    #[test]
    fn parse_issuer() -> Result<(), XpiSigningError> {
        let cert = CapturedX509Certificate::from_pem(ISSUER_ECDSA_CERT).unwrap();

        assert!(cert.is_ca()?);
        assert!(cert.has_key_usage(KeyUsage::KeyCertSign)?);
        assert!(cert.has_key_usage(KeyUsage::CrlSign)?);
        assert!(cert.has_key_usage(KeyUsage::DigitalSignature)?);
        assert!(!cert.has_key_usage(KeyUsage::KeyEncipherment)?);
        assert!(cert.has_extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)?);
        assert!(cert.issued(&cert));

        // UTCTime and GeneralizedTime, respectively.
        assert_eq!(
            cert.validity_not_before(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            cert.validity_not_after(),
            Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59).unwrap()
        );
        assert!(cert.time_constraints_valid(None));

        Ok(())
    }

    #[test]
    fn parse_rejected_variants() -> Result<(), XpiSigningError> {
        let parse = |pem: &str| CapturedX509Certificate::from_pem(pem).unwrap();

        assert!(!parse(NO_CODE_SIGNING_CERT).has_extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)?);
        assert!(!parse(NOT_CA_CERT).is_ca()?);
        assert!(!parse(NO_CERT_SIGN_CERT).has_key_usage(KeyUsage::KeyCertSign)?);
        assert!(!parse(EXPIRED_CERT).time_constraints_valid(None));
        assert!(!parse(NOT_YET_VALID_CERT).time_constraints_valid(None));

        Ok(())
    }

    #[test]
    fn time_encoding() {
        let utc = Utc.with_ymd_and_hms(2049, 12, 31, 23, 59, 59).unwrap();
        assert!(matches!(asn1_time(utc), Time::UtcTime(_)));

        let generalized = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(asn1_time(generalized), Time::GeneralTime(_)));

        let fractional = utc + Duration::milliseconds(250);
        assert_eq!(DateTime::<Utc>::from(asn1_time(fractional)), utc);
    }

    #[test]
    fn issue_from_ecdsa_issuer() -> Result<(), XpiSigningError> {
        let issuer_cert = CapturedX509Certificate::from_pem(ISSUER_ECDSA_CERT).unwrap();
        let issuer_key = InMemorySigningKeyPair::from_pkcs8_pem(ISSUER_ECDSA_KEY).unwrap();
        let subject_key = generate_ecdsa_key();

        let cert = CertificateTemplate::new(Duration::days(1))
            .subject_attribute(&OID_COMMON_NAME, "test@example.net")
            .subject_attribute(&OID_ORGANIZATIONAL_UNIT_NAME, "Production")
            .subject_attribute(&OID_COUNTRY_NAME, "US")
            .key_usage(KeyUsage::DigitalSignature)
            .extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)
            .issue(issuer_cert.subject_name(), &issuer_key, &subject_key)?;

        cert.verify_signed_by_certificate(&issuer_cert).unwrap();
        assert_eq!(
            cert.subject_common_name(),
            Some("test@example.net".to_string())
        );
        assert_eq!(cert.public_key_data(), subject_key.public_key_data());

        assert!(issuer_cert.issued(&cert));
        assert!(!cert.is_ca()?);
        assert!(cert.has_key_usage(KeyUsage::DigitalSignature)?);
        assert!(!cert.has_key_usage(KeyUsage::KeyCertSign)?);
        assert_eq!(
            cert.extended_key_usage_purposes()?,
            vec![const_oid(&OID_EKU_PURPOSE_CODE_SIGNING)]
        );
        assert!(cert.time_constraints_valid(None));

        Ok(())
    }

    #[test]
    fn self_signed_ca() -> Result<(), XpiSigningError> {
        let key = generate_ecdsa_key();
        let not_after = Utc.with_ymd_and_hms(2060, 6, 1, 12, 0, 0).unwrap();

        let cert = CertificateTemplate::new(Duration::days(30))
            .validity(Utc::now() - Duration::minutes(1), not_after)
            .subject_attribute(&OID_COMMON_NAME, "self signed")
            .ca(true)
            .key_usage(KeyUsage::KeyCertSign)
            .key_usage(KeyUsage::CrlSign)
            .extended_key_usage(&OID_EKU_PURPOSE_CODE_SIGNING)
            .self_sign(&key)?;

        cert.verify_signed_by_certificate(&cert).unwrap();

        assert!(cert.is_ca()?);
        assert!(cert.has_key_usage(KeyUsage::KeyCertSign)?);
        assert!(cert.has_key_usage(KeyUsage::CrlSign)?);
        assert!(!cert.has_key_usage(KeyUsage::DigitalSignature)?);
        assert!(cert.issued(&cert));
        assert_eq!(cert.validity_not_after(), not_after);

        Ok(())
    }
}
