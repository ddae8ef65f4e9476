// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::str::FromStr;

use der::{
    asn1::{BitString, GeneralizedTime, UtcTime},
    Decode, DateTime, Encode,
};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use time::{OffsetDateTime, UtcOffset};
use x509_cert::{
    certificate::{Certificate as X509Certificate, TbsCertificate, Version},
    name::Name,
    serial_number::SerialNumber,
    time::{Time, Validity},
};
use x509_parser::{certificate::X509Certificate as ParsedCertificate, der_parser::asn1_rs::FromDer};

use crate::crypto::{rsa_public_key_from_der, Error, KeyPair, SignatureAlgorithm};

/// Serial number of every self-signed certificate produced here.
pub const SELF_SIGNED_SERIAL_NUMBER: u8 = 1;

/// A DER encoded X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Wrap DER bytes, checking that they parse as a single X.509 certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, Error> {
        let certificate = Certificate { der };
        certificate.parse()?;
        Ok(certificate)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM encoding of the certificate.
    pub fn pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// Parse the certificate (using [`x509_parser`]).
    pub fn parse(&self) -> Result<ParsedCertificate<'_>, Error> {
        let (rest, certificate) =
            ParsedCertificate::from_der(&self.der).map_err(|e| Error::Parse(e.to_string()))?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{} trailing bytes after the certificate",
                rest.len()
            )));
        }
        Ok(certificate)
    }

    /// Verify the signature against the certificate's own public key and check that the
    /// algorithm identifiers are consistent with `expected`.
    pub fn verify_self_signed(&self, expected: SignatureAlgorithm) -> Result<(), Error> {
        let parsed = self.parse()?;
        let outer = parsed.signature_algorithm.algorithm.to_id_string();
        let inner = parsed.tbs_certificate.signature.algorithm.to_id_string();
        if outer != inner {
            return Err(Error::SelfVerification(format!(
                "signature algorithm `{}` differs from the signed one `{}`",
                outer, inner
            )));
        }
        let algorithm = outer
            .parse::<SignatureAlgorithm>()
            .map_err(|_| Error::SelfVerification(format!("unknown signature algorithm `{}`", outer)))?;
        if algorithm != expected {
            return Err(Error::SelfVerification(format!(
                "certificate is signed with `{}` but `{}` was requested",
                algorithm, expected
            )));
        }
        let public_key = rsa_public_key_from_der(parsed.public_key().raw)?;
        let signed: &[u8] = parsed.tbs_certificate.as_ref();
        algorithm.verify(&public_key, signed, parsed.signature_value.data.as_ref())
    }
}

/// Build the X.500 name `CN=<host>` used as issuer and subject.
pub fn subject_for_host(host: &str) -> Result<Name, Error> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::InvalidName(host.to_string()));
    }
    let dn = format!("CN={}", escape_attribute_value(host));
    Name::from_str(&dn).map_err(|_| Error::InvalidName(dn))
}

/// Escape the RFC 4514 special characters of an attribute value.
fn escape_attribute_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == ' ' || c == '#');
        if leading || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Convert to an X.509 `Time`, truncating to whole seconds.
/// RFC 5280 requires UTCTime through 2049 and GeneralizedTime from 2050 on.
fn x509_time(instant: OffsetDateTime) -> Result<Time, Error> {
    let instant = instant.to_offset(UtcOffset::UTC);
    let year = u16::try_from(instant.year())
        .map_err(|_| Error::InvalidValidity(format!("year {} is out of range", instant.year())))?;
    let date_time = DateTime::new(
        year,
        u8::from(instant.month()),
        instant.day(),
        instant.hour(),
        instant.minute(),
        instant.second(),
    )
    .map_err(|e| Error::InvalidValidity(format!("{}: {}", instant, e)))?;
    if (1950..2050).contains(&year) {
        let utc = UtcTime::from_date_time(date_time)
            .map_err(|e| Error::InvalidValidity(format!("{}: {}", instant, e)))?;
        Ok(Time::UtcTime(utc))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    }
}

/// Generate a self-signed certificate for `subject` with the given key pair.
///
/// The to-be-signed body is assembled field by field, DER encoded and signed with the
/// algorithm named by `signature_algorithm_name`. The assembled certificate is parsed
/// back and its signature checked against the embedded public key, which also confirms
/// that `signature_algorithm_identifier` matches the algorithm actually used to sign.
/// Inverted or empty validity windows are encoded as given.
pub fn create_self_signed_certificate(
    subject: &Name,
    signature_algorithm_name: &str,
    signature_algorithm_identifier: &AlgorithmIdentifierOwned,
    key_pair: &KeyPair,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<Certificate, Error> {
    let algorithm = signature_algorithm_name.parse::<SignatureAlgorithm>()?;
    let subject_public_key_info = SubjectPublicKeyInfoOwned::from_der(&key_pair.public_key_der()?)?;

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&[SELF_SIGNED_SERIAL_NUMBER])?,
        signature: signature_algorithm_identifier.clone(),
        issuer: subject.clone(),
        validity: Validity {
            not_before: x509_time(not_before)?,
            not_after: x509_time(not_after)?,
        },
        subject: subject.clone(),
        subject_public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };
    let tbs_der = tbs_certificate.to_der()?;
    let signature = algorithm.sign(key_pair.private_key(), &tbs_der)?;

    let certificate = X509Certificate {
        tbs_certificate,
        signature_algorithm: signature_algorithm_identifier.clone(),
        signature: BitString::from_bytes(&signature)?,
    };
    let certificate = Certificate::from_der(certificate.to_der()?)?;
    certificate.verify_self_signed(algorithm)?;
    log::debug!(
        "Self-signed certificate for `{}` created and verified with `{}`",
        subject,
        algorithm
    );
    Ok(certificate)
}

#[cfg(test)]
mod tests {

    use time::Duration;
    use x509_parser::x509::X509Version;

    use super::*;

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn forge(
        key_pair: &KeyPair,
        algorithm: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<Certificate, Error> {
        let subject = subject_for_host("signing.example.org")?;
        let identifier = crate::crypto::find_signature_algorithm_identifier(algorithm)?;
        create_self_signed_certificate(
            &subject,
            algorithm,
            &identifier,
            key_pair,
            not_before,
            not_after,
        )
    }

    #[test]
    fn self_signed_certificate_fields() -> Result<(), Error> {
        setup();
        let key_pair = KeyPair::generate(1024)?;
        let not_before = OffsetDateTime::now_utc() - Duration::SECOND;
        let not_after = not_before + Duration::days(365);
        let certificate = forge(&key_pair, "SHA256withRSA", not_before, not_after)?;

        let parsed = certificate.parse()?;
        assert_eq!(parsed.version(), X509Version::V3);
        assert_eq!(parsed.raw_serial(), &[SELF_SIGNED_SERIAL_NUMBER]);
        assert_eq!(parsed.issuer().as_raw(), parsed.subject().as_raw());
        assert_eq!(parsed.subject().to_string(), "CN=signing.example.org");
        assert_eq!(parsed.public_key().raw, key_pair.public_key_der()?.as_slice());
        assert!(parsed.extensions().is_empty());
        assert_eq!(
            parsed.validity().not_before.timestamp(),
            not_before.unix_timestamp()
        );
        assert_eq!(
            parsed.validity().not_after.timestamp() - parsed.validity().not_before.timestamp(),
            Duration::days(365).whole_seconds()
        );
        Ok(())
    }

    #[test]
    fn every_supported_algorithm_verifies() -> Result<(), Error> {
        let key_pair = KeyPair::generate(2048)?;
        let now = OffsetDateTime::now_utc();
        for algorithm in SignatureAlgorithm::ALL {
            let certificate = forge(&key_pair, algorithm.name(), now, now + Duration::HOUR)?;
            certificate.verify_self_signed(algorithm)?;
            let parsed = certificate.parse()?;
            assert_eq!(
                parsed.signature_algorithm.algorithm.to_id_string(),
                algorithm.oid().to_string()
            );
        }
        Ok(())
    }

    #[test]
    fn keys_above_4096_bits_are_certified() -> Result<(), Error> {
        setup();
        let key_pair = KeyPair::generate(4160)?;
        let now = OffsetDateTime::now_utc();
        let certificate = forge(&key_pair, "SHA256withRSA", now, now + Duration::DAY)?;
        certificate.verify_self_signed(SignatureAlgorithm::Sha256WithRsa)?;
        assert_eq!(
            certificate.parse()?.public_key().raw,
            key_pair.public_key_der()?.as_slice()
        );
        Ok(())
    }

    #[test]
    fn mismatched_identifier_fails_self_verification() -> Result<(), Error> {
        let key_pair = KeyPair::generate(1024)?;
        let subject = subject_for_host("localhost")?;
        let identifier = SignatureAlgorithm::Sha512WithRsa.identifier();
        let now = OffsetDateTime::now_utc();
        let err = create_self_signed_certificate(
            &subject,
            "SHA256withRSA",
            &identifier,
            &key_pair,
            now,
            now + Duration::DAY,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SelfVerification(_)), "{:?}", err);
        Ok(())
    }

    #[test]
    fn unsupported_algorithm_name_is_rejected() -> Result<(), Error> {
        let key_pair = KeyPair::generate(1024)?;
        let subject = subject_for_host("localhost")?;
        let identifier = SignatureAlgorithm::Sha256WithRsa.identifier();
        let now = OffsetDateTime::now_utc();
        let err = create_self_signed_certificate(
            &subject,
            "SHA256withECDSA",
            &identifier,
            &key_pair,
            now,
            now + Duration::DAY,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedSignatureAlgorithm(_)));
        Ok(())
    }

    #[test]
    fn inverted_validity_is_accepted() -> Result<(), Error> {
        let key_pair = KeyPair::generate(1024)?;
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before - Duration::days(1);
        let certificate = forge(&key_pair, "SHA256withRSA", not_before, not_after)?;
        let parsed = certificate.parse()?;
        assert!(
            parsed.validity().not_after.timestamp() < parsed.validity().not_before.timestamp()
        );
        Ok(())
    }

    #[test]
    fn far_future_validity_uses_generalized_time() -> Result<(), Error> {
        let key_pair = KeyPair::generate(1024)?;
        let not_before = OffsetDateTime::now_utc();
        // 2100-01-01T00:00:00Z
        let not_after = OffsetDateTime::from_unix_timestamp(4_102_444_800)
            .map_err(|e| Error::InvalidValidity(e.to_string()))?;
        let certificate = forge(&key_pair, "SHA256withRSA", not_before, not_after)?;
        let parsed = certificate.parse()?;
        assert_eq!(
            parsed.validity().not_after.timestamp(),
            not_after.unix_timestamp()
        );
        assert!(matches!(x509_time(not_after)?, Time::GeneralTime(_)));
        assert!(matches!(x509_time(not_before)?, Time::UtcTime(_)));
        Ok(())
    }

    #[test]
    fn subject_escapes_special_characters() -> Result<(), Error> {
        assert_eq!(escape_attribute_value("a,b+c"), "a\\,b\\+c");
        assert!(subject_for_host("   ").is_err());
        let name = subject_for_host("host.local")?;
        assert_eq!(name.to_string(), "CN=host.local");
        Ok(())
    }

    #[test]
    fn pem_armours_the_der_bytes() -> Result<(), Error> {
        let key_pair = KeyPair::generate(1024)?;
        let now = OffsetDateTime::now_utc();
        let certificate = forge(&key_pair, "SHA1withRSA", now, now + Duration::DAY)?;
        let parsed = pem::parse(certificate.pem()).map_err(|e| Error::Parse(e.to_string()))?;
        assert_eq!(parsed.tag(), "CERTIFICATE");
        assert_eq!(parsed.contents(), certificate.der());
        Ok(())
    }
}
