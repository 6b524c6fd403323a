//! Certificate helpers.
//!
//! Ephemeral self-signed identities for the commissioning listener,
//! CSR construction on the device, CA issuance on the controller, and
//! the deterministic id derivations both sides rely on.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, PublicKeyData, SanType,
};
use sha2::{Digest, Sha256};
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

use crate::model::DeviceIdentity;

/// Validity of the throwaway TLS identity used while commissioning.
pub const COMMISSIONING_CERT_VALIDITY_HOURS: i64 = 24;

/// Validity of issued operational certificates.
pub const OPERATIONAL_CERT_VALIDITY_DAYS: i64 = 365;

#[derive(Debug)]
pub enum CertError {
    Generate(rcgen::Error),
    Parse(String),
    Verify(String),
    MissingCommonName,
}

impl std::error::Error for CertError {}

impl std::fmt::Display for CertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate(e) => write!(f, "generate: {}", e),
            Self::Parse(e) => write!(f, "parse: {}", e),
            Self::Verify(e) => write!(f, "verify: {}", e),
            Self::MissingCommonName => write!(f, "missing common name"),
        }
    }
}

impl From<rcgen::Error> for CertError {
    fn from(value: rcgen::Error) -> Self {
        Self::Generate(value)
    }
}

/// A DER certificate and its PKCS#8 private key.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// The zone id is the first 8 bytes of SHA-256 over the PASE shared
/// secret, rendered as 16 lowercase hex characters.
///
/// # Test
///
/// ```
/// let zone_id = mash_service::certs::zone_id_from_secret(b"shared secret");
///
/// assert_eq!(zone_id.len(), 16);
/// assert!(zone_id.chars().all(|c| c.is_ascii_hexdigit()));
/// ```
pub fn zone_id_from_secret(secret: &[u8]) -> String {
    short_hash(secret)
}

/// Device ids derive deterministically from the CSR public key, so a
/// controller re-commissioning the same device reproduces the same id.
pub fn device_id_from_public_key(spki: &[u8]) -> String {
    short_hash(spki)
}

fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generates the in-memory self-signed identity presented by the
/// commissioning listener. Never persisted.
pub fn commissioning_identity(common_name: &str) -> Result<TlsIdentity, CertError> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![common_name.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::hours(COMMISSIONING_CERT_VALIDITY_HOURS);

    let cert = params.self_signed(&key)?;

    Ok(TlsIdentity {
        cert: cert.der().as_ref().to_vec(),
        private_key: key.serialize_der(),
    })
}

/// Builds the device's CSR for a zone, returning the request DER and
/// the freshly generated private key DER.
///
/// The subject carries the device serial as CommonName, the vendor and
/// product ids as OrganizationName and the zone id as
/// OrganizationalUnitName.
pub fn build_csr(
    identity: &DeviceIdentity,
    zone_id: &str,
) -> Result<(Vec<u8>, Vec<u8>), CertError> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.serial.as_str());
    dn.push(
        DnType::OrganizationName,
        format!("{:04x}:{:04x}", identity.vendor_id, identity.product_id),
    );
    dn.push(DnType::OrganizationalUnitName, zone_id);
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key)?;

    Ok((csr.der().as_ref().to_vec(), key.serialize_der()))
}

/// A certificate freshly issued from a CSR.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert: Vec<u8>,
    pub device_id: String,
}

/// Controller-side certificate authority for one zone.
///
/// Holds the CA material in memory for the lifetime of the
/// commissioner; the CA certificate DER is what devices receive in
/// `CertRenewalRequest` and verify installs against.
pub struct ZoneAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    pub zone_name: String,
}

impl ZoneAuthority {
    pub fn new(zone_name: &str) -> Result<Self, CertError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("mash-zone-ca:{}", zone_name));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);

        Ok(Self {
            cert: params.self_signed(&key)?,
            key,
            zone_name: zone_name.to_string(),
        })
    }

    pub fn ca_der(&self) -> Vec<u8> {
        self.cert.der().as_ref().to_vec()
    }

    /// Issues the controller's own client certificate for operational
    /// connections into the zone.
    pub fn controller_identity(&self, controller_name: &str) -> Result<TlsIdentity, CertError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            format!("mash-controller:{}", controller_name),
        );
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after =
            OffsetDateTime::now_utc() + Duration::days(OPERATIONAL_CERT_VALIDITY_DAYS);

        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        Ok(TlsIdentity {
            cert: cert.der().as_ref().to_vec(),
            private_key: key.serialize_der(),
        })
    }

    /// Generates the device id from the CSR and issues the operational
    /// certificate with the id as CommonName.
    pub fn sign_csr(&self, csr_der: &[u8]) -> Result<IssuedCert, CertError> {
        let mut csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| CertError::Parse(e.to_string()))?;

        let device_id = device_id_from_public_key(csr.public_key.der_bytes());
        let zone_id = csr_zone_id(csr_der)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id.as_str());
        csr.params.distinguished_name = dn;

        // Operational dials use `<device_id>.<zone_id>.mash.arpa` as
        // the server name; the SAN is what makes that verify.
        let san = format!("{}.{}.mash.arpa", device_id, zone_id);
        csr.params.subject_alt_names = vec![SanType::DnsName(
            san.try_into().map_err(|_| CertError::MissingCommonName)?,
        )];
        csr.params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        csr.params.not_after =
            OffsetDateTime::now_utc() + Duration::days(OPERATIONAL_CERT_VALIDITY_DAYS);

        let cert = csr.signed_by(&self.cert, &self.key)?;

        Ok(IssuedCert {
            cert: cert.der().as_ref().to_vec(),
            device_id,
        })
    }
}

/// Extracts the zone id a CSR was built for, from its
/// OrganizationalUnitName.
///
/// Both ends derive the zone id from their own PASE secret; comparing
/// the CSR's value against the controller's derivation is what catches
/// a mismatched setup code before anything is issued.
pub fn csr_zone_id(csr_der: &[u8]) -> Result<String, CertError> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| CertError::Parse(e.to_string()))?;

    csr.certification_request_info
        .subject
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .map(|ou| ou.to_string())
        .ok_or(CertError::MissingCommonName)
}

/// Extracts the device id from an operational certificate's
/// CommonName.
pub fn extract_device_id(cert_der: &[u8]) -> Result<String, CertError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| CertError::Parse(e.to_string()))?;

    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string())
        .ok_or(CertError::MissingCommonName)
}

/// Verifies that `cert_der` is signed by the CA in `ca_der`.
pub fn verify_signed_by(cert_der: &[u8], ca_der: &[u8]) -> Result<(), CertError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| CertError::Parse(e.to_string()))?;
    let (_, ca) = X509Certificate::from_der(ca_der).map_err(|e| CertError::Parse(e.to_string()))?;

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| CertError::Verify(e.to_string()))
}
