//! Policy Registry
//!
//! Immutable mapping from validation-policy OID to its trust requirements.
//! Built once from configuration before the engine serves requests; lookups
//! afterwards are plain reads of a `HashMap` behind an `Arc`.

use crate::config::{Config, PolicyConfig, TrustAnchorConfig};
use crate::error::{Result, VssError};
use crate::pkix::codec::{decode_pem_bundle, Certificate, Fingerprint, Name, PublicKeyInfo};
use crate::pkix::policy_tree::PolicyInputs;

pub use crate::config::{FailMode, RevocationMechanism, RevocationPolicy};

use der::asn1::ObjectIdentifier;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A configured root of trust. Either a full certificate or a bare public
/// key with its subject name.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    name: String,
    subject: Name,
    public_key: PublicKeyInfo,
    key_id: Option<Vec<u8>>,
    certificate: Option<Arc<Certificate>>,
}

impl TrustAnchor {
    pub fn from_certificate(name: impl Into<String>, certificate: Certificate) -> Self {
        Self {
            name: name.into(),
            subject: certificate.subject().clone(),
            public_key: certificate.public_key().clone(),
            key_id: certificate.extensions().subject_key_id.clone(),
            certificate: Some(Arc::new(certificate)),
        }
    }

    pub fn from_public_key(
        name: impl Into<String>,
        subject: Name,
        public_key: PublicKeyInfo,
        key_id: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            subject,
            public_key,
            key_id,
            certificate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &Name {
        &self.subject
    }

    pub fn public_key(&self) -> &PublicKeyInfo {
        &self.public_key
    }

    pub fn key_id(&self) -> Option<&[u8]> {
        self.key_id.as_deref()
    }

    pub fn certificate(&self) -> Option<&Arc<Certificate>> {
        self.certificate.as_ref()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.certificate.as_ref().map(|c| c.fingerprint())
    }

    /// Whether `cert` names this anchor as its issuer: the issuer name must
    /// equal the anchor subject, and key identifiers must agree when both
    /// sides carry one.
    pub fn is_issuer_of(&self, cert: &Certificate) -> bool {
        if cert.issuer() != &self.subject {
            return false;
        }

        match (cert.extensions().authority_key_id.as_deref(), self.key_id()) {
            (Some(aki), Some(ski)) => aki == ski,
            _ => true,
        }
    }

    fn load(config: &TrustAnchorConfig) -> Result<Self> {
        let read = |path: &std::path::Path| {
            std::fs::read(path)
                .map_err(|e| VssError::TrustAnchor(format!("{}: cannot read {}: {}", config.name, path.display(), e)))
        };

        let (bytes, bare_key) = match (
            &config.certificate_path,
            &config.certificate_pem,
            &config.public_key_path,
            &config.public_key_pem,
        ) {
            (Some(path), None, None, None) => (read(path)?, false),
            (None, Some(pem), None, None) => (pem.as_bytes().to_vec(), false),
            (None, None, Some(path), None) => (read(path)?, true),
            (None, None, None, Some(pem)) => (pem.as_bytes().to_vec(), true),
            _ => {
                return Err(VssError::TrustAnchor(format!(
                    "{}: exactly one certificate or public key source is required",
                    config.name
                )))
            }
        };

        if bare_key {
            let subject = config
                .subject
                .as_deref()
                .ok_or_else(|| VssError::TrustAnchor(format!("{}: a public key anchor needs a subject", config.name)))?;
            let subject = Name::parse(subject).map_err(|e| VssError::TrustAnchor(format!("{}: {}", config.name, e)))?;
            let public_key =
                PublicKeyInfo::decode(&bytes).map_err(|e| VssError::TrustAnchor(format!("{}: {}", config.name, e)))?;
            return Ok(Self::from_public_key(config.name.clone(), subject, public_key, None));
        }

        let mut certificates = decode_pem_bundle(&bytes)
            .map_err(|e| VssError::TrustAnchor(format!("{}: {}", config.name, e)))?;

        if certificates.len() != 1 {
            return Err(VssError::TrustAnchor(format!(
                "{}: expected exactly one certificate, found {}",
                config.name,
                certificates.len()
            )));
        }

        let certificate = certificates.remove(0);
        Ok(Self::from_certificate(config.name.clone(), certificate))
    }
}

/// Trust requirements for one validation policy OID.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub oid: String,
    pub name: String,
    pub trust_anchors: Vec<Arc<TrustAnchor>>,
    /// Certificate policy OIDs, at least one of which must survive policy
    /// processing. Empty means any policy is acceptable.
    pub required_policies: Vec<String>,
    /// Maximum number of certificates in a path, trust anchor excluded.
    pub max_path_length: usize,
    pub require_explicit_policy: bool,
    pub inhibit_policy_mapping: bool,
    pub inhibit_any_policy: bool,
    pub trust_anchors_directly: bool,
    pub revocation: RevocationPolicy,
}

impl ValidationPolicy {
    pub fn policy_inputs(&self) -> PolicyInputs {
        PolicyInputs {
            initial_explicit_policy: self.require_explicit_policy,
            initial_policy_mapping_inhibit: self.inhibit_policy_mapping,
            initial_any_policy_inhibit: self.inhibit_any_policy,
        }
    }

    /// Anchors that issued `cert`.
    pub fn anchors_for<'a>(&'a self, cert: &'a Certificate) -> impl Iterator<Item = &'a Arc<TrustAnchor>> + 'a {
        self.trust_anchors.iter().filter(move |anchor| anchor.is_issuer_of(cert))
    }

    pub fn is_anchor_certificate(&self, fingerprint: &Fingerprint) -> bool {
        self.trust_anchors
            .iter()
            .any(|anchor| anchor.fingerprint().as_ref() == Some(fingerprint))
    }

    pub fn allows(&self, mechanism: RevocationMechanism) -> bool {
        self.revocation.mechanisms.contains(&mechanism)
    }

    fn from_config(config: &PolicyConfig, anchors: &HashMap<String, Arc<TrustAnchor>>) -> Result<Self> {
        let oid = parse_oid(&config.oid)
            .map_err(|_| VssError::InvalidConfig(format!("policies.oid '{}' is not an object identifier", config.oid)))?;

        let required_policies = config
            .required_policies
            .iter()
            .map(|p| {
                parse_oid(p).map_err(|_| {
                    VssError::InvalidConfig(format!(
                        "policies[{}].required_policies entry '{}' is not an object identifier",
                        config.oid, p
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let trust_anchors = config
            .trust_anchors
            .iter()
            .map(|name| {
                anchors.get(name).cloned().ok_or_else(|| {
                    VssError::TrustAnchor(format!("policy {} references unknown trust anchor '{}'", config.oid, name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if trust_anchors.is_empty() {
            return Err(VssError::TrustAnchor(format!("policy {} has no trust anchors", config.oid)));
        }

        Ok(Self {
            oid,
            name: config.name.clone(),
            trust_anchors,
            required_policies,
            max_path_length: config.max_path_length,
            require_explicit_policy: config.require_explicit_policy,
            inhibit_policy_mapping: config.inhibit_policy_mapping,
            inhibit_any_policy: config.inhibit_any_policy,
            trust_anchors_directly: config.trust_anchors_directly,
            revocation: config.revocation.clone(),
        })
    }
}

/// Parse and canonicalise a dotted object identifier.
pub fn parse_oid(value: &str) -> Result<String> {
    ObjectIdentifier::new(value)
        .map(|oid| oid.to_string())
        .map_err(|_| VssError::InvalidPolicyOid(value.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<ValidationPolicy>>,
}

impl PolicyRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut anchors: HashMap<String, Arc<TrustAnchor>> = HashMap::new();
        for anchor_config in &config.trust_anchors {
            let anchor = TrustAnchor::load(anchor_config)?;
            if anchors.insert(anchor_config.name.clone(), Arc::new(anchor)).is_some() {
                return Err(VssError::TrustAnchor(format!(
                    "trust anchor '{}' defined more than once",
                    anchor_config.name
                )));
            }
        }

        let mut registry = Self::default();
        for policy_config in &config.policies {
            policy_config.validate()?;
            registry.insert(ValidationPolicy::from_config(policy_config, &anchors)?)?;
        }

        info!(
            policies = registry.policies.len(),
            trust_anchors = anchors.len(),
            "Policy registry loaded"
        );

        Ok(registry)
    }

    fn insert(&mut self, policy: ValidationPolicy) -> Result<()> {
        if self.policies.contains_key(&policy.oid) {
            return Err(VssError::DuplicatePolicy(policy.oid));
        }
        self.policies.insert(policy.oid.clone(), Arc::new(policy));
        Ok(())
    }

    /// Look up a policy. Unknown OIDs are an error, never a fallback.
    pub fn lookup(&self, oid: &str) -> Result<Arc<ValidationPolicy>> {
        self.policies
            .get(oid)
            .cloned()
            .ok_or_else(|| VssError::PolicyNotFound(oid.to_string()))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
