//! Certificate Codec
//!
//! Decodes transport-encoded (base64 DER, optionally PEM armoured) certificates
//! into owned, immutable `Certificate` values. Everything the path builder,
//! validator and revocation checker need is extracted once, here, so the rest
//! of the engine never touches the ASN.1 parser or its borrowed lifetimes.

use crate::error::{Result, VssError};
use crate::pkix::signature::SignatureAlgorithm;
use crate::types::oids;

use base64::{engine::general_purpose, Engine};
use der::Encode;
use ring::digest;
use std::fmt;
use std::str::FromStr;
use x509_cert::name::RdnSequence;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::*;

/// SHA-256 thumbprint of a certificate's DER encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        let hash = digest::digest(&digest::SHA256, der);
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(hash.as_ref());
        Self(fingerprint)
    }

    /// x5t#S256 rendering: base64url without padding.
    pub fn x5t_s256(&self) -> String {
        general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.x5t_s256())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Distinguished name kept in both encoded and printable form.
/// Equality is on the DER encoding.
#[derive(Debug, Clone)]
pub struct Name {
    der: Vec<u8>,
    display: String,
}

impl Name {
    pub fn new(der: Vec<u8>, display: String) -> Self {
        Self { der, display }
    }

    /// Parse an RFC 4514 string such as `CN=Root,O=Example`. Attribute
    /// values are encoded as UTF8String.
    pub fn parse(text: &str) -> Result<Self> {
        let rdns = RdnSequence::from_str(text)
            .map_err(|e| VssError::CertificateDecode(format!("invalid distinguished name '{}': {}", text, e)))?;
        let der = rdns
            .to_der()
            .map_err(|e| VssError::CertificateDecode(format!("cannot encode distinguished name '{}': {}", text, e)))?;
        Ok(Self::new(der, text.to_string()))
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Name {}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    /// SPKI algorithm OID, dotted.
    pub algorithm: String,
    /// Named curve for EC keys.
    pub curve: Option<String>,
    /// Contents of the subjectPublicKey BIT STRING.
    pub key: Vec<u8>,
}

impl PublicKeyInfo {
    fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Self {
        Self {
            algorithm: spki.algorithm.algorithm.to_id_string(),
            curve: spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.as_oid().ok())
                .map(|oid| oid.to_id_string()),
            key: spki.subject_public_key.data.to_vec(),
        }
    }

    /// Decode a SubjectPublicKeyInfo, PEM (`PUBLIC KEY`) or DER.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let der = if looks_like_pem(bytes) {
            let (_, pem) = x509_parser::pem::parse_x509_pem(bytes)
                .map_err(|e| VssError::CertificateDecode(format!("failed to parse public key PEM: {}", e)))?;
            if pem.label != "PUBLIC KEY" {
                return Err(VssError::CertificateDecode(format!(
                    "expected a PUBLIC KEY PEM block, found {}",
                    pem.label
                )));
            }
            pem.contents
        } else {
            bytes.to_vec()
        };

        let (remaining, spki) = SubjectPublicKeyInfo::from_der(&der)
            .map_err(|e| VssError::CertificateDecode(format!("public key parsing failed: {}", e)))?;
        if !remaining.is_empty() {
            return Err(VssError::CertificateDecode("public key contains trailing data".to_string()));
        }

        Ok(Self::from_spki(&spki))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicConstraints {
    pub ca: bool,
    pub path_len_constraint: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage {
    pub digital_signature: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyConstraints {
    pub require_explicit_policy: Option<u32>,
    pub inhibit_policy_mapping: Option<u32>,
}

/// Extension data relevant to path processing and revocation.
#[derive(Debug, Clone, Default)]
pub struct CertificateExtensions {
    pub basic_constraints: Option<BasicConstraints>,
    pub key_usage: Option<KeyUsage>,
    pub subject_key_id: Option<Vec<u8>>,
    pub authority_key_id: Option<Vec<u8>>,
    /// `None` when the certificatePolicies extension is absent.
    pub certificate_policies: Option<Vec<String>>,
    /// (issuerDomainPolicy, subjectDomainPolicy) pairs.
    pub policy_mappings: Vec<(String, String)>,
    pub policy_constraints: Option<PolicyConstraints>,
    pub inhibit_any_policy: Option<u32>,
    pub ocsp_signing: bool,
    pub ocsp_urls: Vec<String>,
    pub ca_issuers_urls: Vec<String>,
    pub crl_urls: Vec<String>,
    /// Critical extensions this engine does not process.
    pub unsupported_critical: Vec<String>,
}

/// Decoded X.509 certificate. Immutable once decoded.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    fingerprint: Fingerprint,
    subject: Name,
    issuer: Name,
    serial: Vec<u8>,
    not_before: i64,
    not_after: i64,
    public_key: PublicKeyInfo,
    tbs: Vec<u8>,
    signature_algorithm: SignatureAlgorithm,
    signature: Vec<u8>,
    extensions: CertificateExtensions,
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (remaining, parsed) = X509Certificate::from_der(der)
            .map_err(|e| VssError::CertificateDecode(format!("certificate parsing failed: {}", e)))?;

        if !remaining.is_empty() {
            return Err(VssError::CertificateDecode(
                "certificate contains trailing data".to_string(),
            ));
        }

        let public_key = PublicKeyInfo::from_spki(parsed.public_key());
        let extensions = extract_extensions(&parsed)?;

        Ok(Self {
            der: der.to_vec(),
            fingerprint: Fingerprint::of(der),
            subject: Name::new(parsed.subject().as_raw().to_vec(), parsed.subject().to_string()),
            issuer: Name::new(parsed.issuer().as_raw().to_vec(), parsed.issuer().to_string()),
            serial: parsed.raw_serial().to_vec(),
            not_before: parsed.validity().not_before.timestamp(),
            not_after: parsed.validity().not_after.timestamp(),
            public_key,
            tbs: parsed.tbs_certificate.as_ref().to_vec(),
            signature_algorithm: SignatureAlgorithm::from_identifier(&parsed.signature_algorithm),
            signature: parsed.signature_value.data.to_vec(),
            extensions,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn subject(&self) -> &Name {
        &self.subject
    }

    pub fn issuer(&self) -> &Name {
        &self.issuer
    }

    /// Serial number content octets, as encoded.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Serial number without sign-padding octets.
    pub fn serial_magnitude(&self) -> &[u8] {
        unsigned_magnitude(&self.serial)
    }

    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    pub fn tbs(&self) -> &[u8] {
        &self.tbs
    }

    pub fn signature_algorithm(&self) -> &SignatureAlgorithm {
        &self.signature_algorithm
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn extensions(&self) -> &CertificateExtensions {
        &self.extensions
    }

    /// Subject and issuer names are identical.
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    pub fn is_ca(&self) -> bool {
        self.extensions.basic_constraints.map(|bc| bc.ca).unwrap_or(false)
    }

    pub fn is_valid_at(&self, timestamp: i64) -> bool {
        timestamp >= self.not_before && timestamp <= self.not_after
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Certificate {}

fn extract_extensions(cert: &X509Certificate<'_>) -> Result<CertificateExtensions> {
    let mut extensions = CertificateExtensions::default();

    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        let handled = match ext.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => {
                extensions.basic_constraints = Some(BasicConstraints {
                    ca: bc.ca,
                    path_len_constraint: bc.path_len_constraint,
                });
                true
            }
            ParsedExtension::KeyUsage(ku) => {
                extensions.key_usage = Some(KeyUsage {
                    digital_signature: ku.digital_signature(),
                    key_cert_sign: ku.key_cert_sign(),
                    crl_sign: ku.crl_sign(),
                });
                true
            }
            ParsedExtension::SubjectKeyIdentifier(ski) => {
                extensions.subject_key_id = Some(ski.0.to_vec());
                true
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                extensions.authority_key_id = aki.key_identifier.as_ref().map(|ki| ki.0.to_vec());
                true
            }
            ParsedExtension::CertificatePolicies(policies) => {
                extensions.certificate_policies = Some(
                    policies.iter().map(|p| p.policy_id.to_id_string()).collect(),
                );
                true
            }
            ParsedExtension::PolicyMappings(mappings) => {
                extensions.policy_mappings = mappings
                    .mappings
                    .iter()
                    .map(|m| {
                        (
                            m.issuer_domain_policy.to_id_string(),
                            m.subject_domain_policy.to_id_string(),
                        )
                    })
                    .collect();
                true
            }
            ParsedExtension::PolicyConstraints(pc) => {
                extensions.policy_constraints = Some(PolicyConstraints {
                    require_explicit_policy: pc.require_explicit_policy,
                    inhibit_policy_mapping: pc.inhibit_policy_mapping,
                });
                true
            }
            ParsedExtension::InhibitAnyPolicy(iap) => {
                extensions.inhibit_any_policy = Some(iap.skip_certs);
                true
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                extensions.ocsp_signing = eku.ocsp_signing;
                true
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in &aia.accessdescs {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        match desc.access_method.to_id_string().as_str() {
                            oids::AD_OCSP => extensions.ocsp_urls.push(uri.to_string()),
                            oids::AD_CA_ISSUERS => extensions.ca_issuers_urls.push(uri.to_string()),
                            _ => {}
                        }
                    }
                }
                true
            }
            ParsedExtension::CRLDistributionPoints(cdp) => {
                for dp in cdp.points.iter() {
                    if let Some(DistributionPointName::FullName(names)) = &dp.distribution_point {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                extensions.crl_urls.push(uri.to_string());
                            }
                        }
                    }
                }
                true
            }
            ParsedExtension::SubjectAlternativeName(_) => true,
            ParsedExtension::ParseError { error } => {
                return Err(VssError::CertificateDecode(format!(
                    "malformed extension {}: {}",
                    oid, error
                )));
            }
            _ => false,
        };

        if oid == oids::OCSP_NOCHECK {
            continue;
        }

        if !handled && ext.critical {
            extensions.unsupported_critical.push(oid);
        }
    }

    Ok(extensions)
}

/// Content octets of a non-negative INTEGER with leading zero octets
/// removed. Encoders disagree on sign padding, so serials compare this way.
pub fn unsigned_magnitude(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or_else(|| bytes.len().saturating_sub(1));
    &bytes[start..]
}

/// Decode the transport form used on the wire: base64 of DER. PEM armour,
/// whitespace and the URL-safe alphabet are tolerated.
pub fn decode_transport(encoded: &str) -> Result<Certificate> {
    let body: String = encoded
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .collect::<String>()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    if body.is_empty() {
        return Err(VssError::CertificateDecode("empty x509Certificate".to_string()));
    }

    let der = general_purpose::STANDARD_NO_PAD
        .decode(body.as_bytes())
        .map_err(|e| VssError::CertificateDecode(format!("invalid base64: {}", e)))?;

    Certificate::from_der(&der)
}

/// Decode every certificate in a PEM bundle, or a single DER certificate.
fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(5)
        .eq(b"-----".iter())
}

pub fn decode_pem_bundle(bytes: &[u8]) -> Result<Vec<Certificate>> {
    if !looks_like_pem(bytes) {
        return Ok(vec![Certificate::from_der(bytes)?]);
    }

    let ders = rustls_pemfile::certs(&mut &bytes[..])
        .map_err(|e| VssError::CertificateDecode(format!("failed to parse PEM certificates: {}", e)))?;

    ders.iter().map(|der| Certificate::from_der(der)).collect()
}
