//! Generation and verification of the self-managed trust chain: one root CA
//! plus one server certificate per policy server (and one for the
//! controller's own webhook endpoint). Certificates are stored PEM-encoded,
//! private keys as PKCS#8 DER.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use time::{Duration, OffsetDateTime};
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::constants::{
    CA_ROOT_CERT_KEY, CA_ROOT_PRIVATE_KEY_KEY, OLD_CA_ROOT_CERT_KEY, SERVER_CERT_KEY,
    SERVER_PRIVATE_KEY_KEY,
};
use crate::errors::Error;

pub const CA_LIFETIME: Duration = Duration::days(10 * 365);
pub const SERVER_CERT_LIFETIME: Duration = Duration::days(365);

/// Certificates are rotated this long before their notAfter.
pub const ROTATION_LOOKAHEAD: Duration = Duration::days(60);

const ROOT_CA_COMMON_NAME: &str = "kubewarden-root-ca";
const ORGANIZATION_NAME: &str = "kubewarden";

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("cannot generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("cannot parse certificate: {0}")]
    Parse(String),

    #[error("certificate expires within the rotation lookahead")]
    ExpiringSoon,

    #[error("certificate does not carry the expected SAN {0}")]
    SanMismatch(String),

    #[error("certificate is not signed by the current certificate authority")]
    NotSignedByCa,
}

/// The root of the trust chain. `key_der` is the PKCS#8 encoding of the CA
/// private key, exactly as persisted in the root CA secret.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    pub key_der: Vec<u8>,
}

/// A leaf certificate plus its private key, ready to be written into a
/// server certificate secret.
#[derive(Clone, Debug)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_der: Vec<u8>,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, CertificateError> {
        Self::generate_with_lifetime(CA_LIFETIME)
    }

    pub fn generate_with_lifetime(lifetime: Duration) -> Result<Self, CertificateError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION_NAME);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + lifetime;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        Ok(CertificateAuthority {
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
        })
    }

    /// Generates a new server certificate signed by this CA, with the given
    /// DNS name as both common name and subject alternative name.
    pub fn sign_server_cert(&self, san: &str) -> Result<CertificatePair, CertificateError> {
        self.sign_server_cert_with_lifetime(san, SERVER_CERT_LIFETIME)
    }

    pub fn sign_server_cert_with_lifetime(
        &self,
        san: &str,
        lifetime: Duration,
    ) -> Result<CertificatePair, CertificateError> {
        let ca_key = KeyPair::try_from(self.key_der.as_slice())?;
        let ca_params = CertificateParams::from_ca_cert_pem(&self.cert_pem)?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, san);
        dn.push(DnType::OrganizationName, ORGANIZATION_NAME);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            san.to_string()
                .try_into()
                .map_err(|_| CertificateError::SanMismatch(san.to_string()))?,
        )];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + lifetime;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;

        Ok(CertificatePair {
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
        })
    }
}

fn parse_pem(pem_bytes: &[u8]) -> Result<Pem, CertificateError> {
    let (_, pem) =
        parse_x509_pem(pem_bytes).map_err(|e| CertificateError::Parse(e.to_string()))?;
    Ok(pem)
}

fn parse_cert(pem: &Pem) -> Result<X509Certificate<'_>, CertificateError> {
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    Ok(cert)
}

/// Whether the certificate's notAfter falls within `lookahead` from now.
pub fn expires_within(cert_pem: &[u8], lookahead: Duration) -> Result<bool, CertificateError> {
    let pem = parse_pem(cert_pem)?;
    let cert = parse_cert(&pem)?;
    let deadline = OffsetDateTime::now_utc() + lookahead;
    Ok(cert.validity().not_after.timestamp() < deadline.unix_timestamp())
}

/// Whether the certificate's notAfter is already in the past.
pub fn is_expired(cert_pem: &[u8]) -> Result<bool, CertificateError> {
    expires_within(cert_pem, Duration::ZERO)
}

/// Full server-certificate check used by the rotation loop: not expiring
/// within the lookahead, carries the expected SAN, and verifies against the
/// given CA.
pub fn verify_server_cert(
    cert_pem: &[u8],
    ca_pem: &[u8],
    expected_san: &str,
) -> Result<(), CertificateError> {
    let leaf_pem = parse_pem(cert_pem)?;
    let leaf = parse_cert(&leaf_pem)?;
    let ca_parsed_pem = parse_pem(ca_pem)?;
    let ca = parse_cert(&ca_parsed_pem)?;

    let deadline = OffsetDateTime::now_utc() + ROTATION_LOOKAHEAD;
    if leaf.validity().not_after.timestamp() < deadline.unix_timestamp() {
        return Err(CertificateError::ExpiringSoon);
    }

    let san_matches = leaf
        .subject_alternative_name()
        .map_err(|e| CertificateError::Parse(e.to_string()))?
        .map(|ext| {
            ext.value.general_names.iter().any(
                |name| matches!(name, GeneralName::DNSName(dns) if *dns == expected_san),
            )
        })
        .unwrap_or(false);
    if !san_matches {
        return Err(CertificateError::SanMismatch(expected_san.to_string()));
    }

    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|_| CertificateError::NotSignedByCa)
}

/// Reads the root CA out of its secret. A secret that exists but cannot be
/// parsed is an error: trust material is never silently regenerated.
pub fn ca_from_secret(secret: &Secret) -> Result<CertificateAuthority, Error> {
    let data = secret.data.as_ref();
    let secret_name = secret.metadata.name.clone().unwrap_or_default();

    let cert_pem = data
        .and_then(|data| data.get(CA_ROOT_CERT_KEY))
        .ok_or_else(|| Error::MalformedSecret {
            secret: secret_name.clone(),
            key: CA_ROOT_CERT_KEY.to_string(),
        })
        .and_then(|bytes| {
            String::from_utf8(bytes.0.clone()).map_err(|_| Error::MalformedSecret {
                secret: secret_name.clone(),
                key: CA_ROOT_CERT_KEY.to_string(),
            })
        })?;

    let key_der = data
        .and_then(|data| data.get(CA_ROOT_PRIVATE_KEY_KEY))
        .ok_or_else(|| Error::MalformedSecret {
            secret: secret_name,
            key: CA_ROOT_PRIVATE_KEY_KEY.to_string(),
        })?
        .0
        .clone();

    Ok(CertificateAuthority { cert_pem, key_der })
}

/// The CA bundle published to webhook clients: the current root certificate,
/// concatenated with the previous one while a rotation overlap is open.
pub fn ca_bundle_from_secret(secret: &Secret) -> Result<Vec<u8>, Error> {
    let data = secret.data.as_ref();
    let secret_name = secret.metadata.name.clone().unwrap_or_default();

    let mut bundle = data
        .and_then(|data| data.get(CA_ROOT_CERT_KEY))
        .ok_or(Error::MalformedSecret {
            secret: secret_name,
            key: CA_ROOT_CERT_KEY.to_string(),
        })?
        .0
        .clone();

    if let Some(old_cert) = data.and_then(|data| data.get(OLD_CA_ROOT_CERT_KEY)) {
        bundle.extend_from_slice(&old_cert.0);
    }

    Ok(bundle)
}

pub fn root_ca_secret_data(
    ca: &CertificateAuthority,
    old_cert_pem: Option<&str>,
) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    data.insert(
        CA_ROOT_CERT_KEY.to_string(),
        ByteString(ca.cert_pem.clone().into_bytes()),
    );
    data.insert(
        CA_ROOT_PRIVATE_KEY_KEY.to_string(),
        ByteString(ca.key_der.clone()),
    );
    if let Some(old_cert_pem) = old_cert_pem {
        data.insert(
            OLD_CA_ROOT_CERT_KEY.to_string(),
            ByteString(old_cert_pem.as_bytes().to_vec()),
        );
    }
    data
}

pub fn server_cert_secret_data(pair: &CertificatePair) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    data.insert(
        SERVER_CERT_KEY.to_string(),
        ByteString(pair.cert_pem.clone().into_bytes()),
    );
    data.insert(
        SERVER_PRIVATE_KEY_KEY.to_string(),
        ByteString(pair.key_der.clone()),
    );
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_server_cert_verifies_against_its_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let pair = ca
            .sign_server_cert("policy-server-default.kubewarden.svc")
            .unwrap();

        verify_server_cert(
            pair.cert_pem.as_bytes(),
            ca.cert_pem.as_bytes(),
            "policy-server-default.kubewarden.svc",
        )
        .unwrap();
    }

    #[test]
    fn verification_rejects_wrong_san() {
        let ca = CertificateAuthority::generate().unwrap();
        let pair = ca
            .sign_server_cert("policy-server-default.kubewarden.svc")
            .unwrap();

        let err = verify_server_cert(
            pair.cert_pem.as_bytes(),
            ca.cert_pem.as_bytes(),
            "policy-server-other.kubewarden.svc",
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::SanMismatch(_)));
    }

    #[test]
    fn verification_rejects_foreign_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let other_ca = CertificateAuthority::generate().unwrap();
        let pair = ca
            .sign_server_cert("policy-server-default.kubewarden.svc")
            .unwrap();

        let err = verify_server_cert(
            pair.cert_pem.as_bytes(),
            other_ca.cert_pem.as_bytes(),
            "policy-server-default.kubewarden.svc",
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::NotSignedByCa));
    }

    #[test]
    fn verification_rejects_cert_expiring_within_lookahead() {
        let ca = CertificateAuthority::generate().unwrap();
        let pair = ca
            .sign_server_cert_with_lifetime(
                "policy-server-default.kubewarden.svc",
                Duration::days(30),
            )
            .unwrap();

        let err = verify_server_cert(
            pair.cert_pem.as_bytes(),
            ca.cert_pem.as_bytes(),
            "policy-server-default.kubewarden.svc",
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::ExpiringSoon));
    }

    #[test]
    fn expiry_window_detection() {
        let short_lived = CertificateAuthority::generate_with_lifetime(Duration::days(30)).unwrap();
        assert!(expires_within(short_lived.cert_pem.as_bytes(), ROTATION_LOOKAHEAD).unwrap());
        assert!(!is_expired(short_lived.cert_pem.as_bytes()).unwrap());

        let long_lived = CertificateAuthority::generate().unwrap();
        assert!(!expires_within(long_lived.cert_pem.as_bytes(), ROTATION_LOOKAHEAD).unwrap());

        let expired = CertificateAuthority::generate_with_lifetime(-Duration::hours(2)).unwrap();
        assert!(is_expired(expired.cert_pem.as_bytes()).unwrap());
    }

    #[test]
    fn ca_round_trips_through_secret_data() {
        let ca = CertificateAuthority::generate().unwrap();
        let secret = Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("kubewarden-root-ca".to_string()),
                ..Default::default()
            },
            data: Some(root_ca_secret_data(&ca, None)),
            ..Default::default()
        };

        let loaded = ca_from_secret(&secret).unwrap();
        assert_eq!(loaded.cert_pem, ca.cert_pem);
        assert_eq!(loaded.key_der, ca.key_der);

        // the reloaded CA is still able to sign
        loaded
            .sign_server_cert("policy-server-default.kubewarden.svc")
            .unwrap();
    }

    #[test]
    fn bundle_concatenates_old_ca_during_overlap() {
        let new_ca = CertificateAuthority::generate().unwrap();
        let old_ca = CertificateAuthority::generate().unwrap();

        let secret = Secret {
            data: Some(root_ca_secret_data(&new_ca, Some(&old_ca.cert_pem))),
            ..Default::default()
        };

        let bundle = ca_bundle_from_secret(&secret).unwrap();
        let expected = format!("{}{}", new_ca.cert_pem, old_ca.cert_pem);
        assert_eq!(bundle, expected.as_bytes());

        // during the overlap, leaves signed by either CA verify against one
        // of the bundled certificates
        let pair = old_ca.sign_server_cert("svc.ns.svc").unwrap();
        verify_server_cert(pair.cert_pem.as_bytes(), old_ca.cert_pem.as_bytes(), "svc.ns.svc")
            .unwrap();
    }

    #[test]
    fn malformed_secret_is_reported_not_repaired() {
        let secret = Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("kubewarden-root-ca".to_string()),
                ..Default::default()
            },
            data: None,
            ..Default::default()
        };

        let err = ca_from_secret(&secret).unwrap_err();
        assert!(matches!(err, Error::MalformedSecret { .. }));
    }
}
