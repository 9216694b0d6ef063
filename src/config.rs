use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub request_limits: RequestLimits,
    #[serde(default)]
    pub intermediate_cache: IntermediateCacheConfig,
    #[serde(default)]
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub trust_anchors: Vec<TrustAnchorConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on candidate paths evaluated for one request.
    pub max_candidate_paths: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_candidate_paths: 8,
        }
    }
}

/// Limits enforced at the request boundary before the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_oid_length: usize,
    pub max_certificate_length: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_oid_length: 50,
            max_certificate_length: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntermediateCacheConfig {
    /// Curated CA bundles (PEM or DER) loaded at startup and on every refresh.
    pub bundle_paths: Vec<PathBuf>,
    /// Follow AIA caIssuers pointers on a cache miss.
    pub aia_chasing_enabled: bool,
    pub max_entries: usize,
    pub entry_ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
    /// Entries this close to expiry are refreshed in the background.
    pub refresh_ahead_seconds: u64,
    pub fetch_timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for IntermediateCacheConfig {
    fn default() -> Self {
        Self {
            bundle_paths: Vec::new(),
            aia_chasing_enabled: true,
            max_entries: 10_000,
            entry_ttl_seconds: 86_400,      // 24 hours
            refresh_interval_seconds: 3600, // 1 hour
            refresh_ahead_seconds: 900,     // 15 minutes
            fetch_timeout_ms: 5000,
            max_response_bytes: 1_048_576, // 1MB
        }
    }
}

impl IntermediateCacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn refresh_ahead(&self) -> Duration {
        Duration::from_secs(self.refresh_ahead_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_entries == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "intermediate_cache.max_entries must be greater than 0".to_string(),
            ));
        }

        if self.entry_ttl_seconds == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "intermediate_cache.entry_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if self.refresh_interval_seconds == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "intermediate_cache.refresh_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.refresh_ahead_seconds >= self.entry_ttl_seconds {
            return Err(crate::error::VssError::InvalidConfig(
                "intermediate_cache.refresh_ahead_seconds must be less than entry_ttl_seconds".to_string(),
            ));
        }

        if self.fetch_timeout_ms == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "intermediate_cache.fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    pub ocsp_timeout_ms: u64,
    pub crl_timeout_ms: u64,
    pub cache_max_entries: usize,
    /// Downloaded CRLs kept in memory, by distribution point URL.
    pub crl_cache_max_entries: usize,
    /// Tolerated clock difference when judging thisUpdate.
    pub clock_skew_seconds: u64,
    /// Freshness window for evidence that carries no nextUpdate.
    pub default_freshness_seconds: u64,
    pub max_response_bytes: usize,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            ocsp_timeout_ms: 5000,
            crl_timeout_ms: 10_000,
            cache_max_entries: 50_000,
            crl_cache_max_entries: 256,
            clock_skew_seconds: 300,        // 5 minutes
            default_freshness_seconds: 3600, // 1 hour
            max_response_bytes: 10_485_760, // 10MB, CRLs can be large
        }
    }
}

impl RevocationConfig {
    pub fn ocsp_timeout(&self) -> Duration {
        Duration::from_millis(self.ocsp_timeout_ms)
    }

    pub fn crl_timeout(&self) -> Duration {
        Duration::from_millis(self.crl_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.ocsp_timeout_ms == 0 || self.crl_timeout_ms == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "revocation.ocsp_timeout_ms and revocation.crl_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.cache_max_entries == 0 || self.crl_cache_max_entries == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "revocation.cache_max_entries and revocation.crl_cache_max_entries must be greater than 0".to_string(),
            ));
        }

        if self.default_freshness_seconds == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "revocation.default_freshness_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// One trust anchor: a self-signed certificate, or a bare public key with
/// the distinguished name it signs as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    pub name: String,
    pub certificate_path: Option<PathBuf>,
    pub certificate_pem: Option<String>,
    pub public_key_path: Option<PathBuf>,
    pub public_key_pem: Option<String>,
    /// RFC 4514 name of a bare-key anchor.
    pub subject: Option<String>,
}

impl TrustAnchorConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::error::VssError::InvalidConfig(
                "trust_anchors.name cannot be empty".to_string(),
            ));
        }

        let sources = [
            self.certificate_path.is_some(),
            self.certificate_pem.is_some(),
            self.public_key_path.is_some(),
            self.public_key_pem.is_some(),
        ];
        if sources.iter().filter(|set| **set).count() != 1 {
            return Err(crate::error::VssError::InvalidConfig(format!(
                "trust_anchors[{}] must set exactly one of certificate_path, certificate_pem, public_key_path or public_key_pem",
                self.name
            )));
        }

        let bare_key = self.public_key_path.is_some() || self.public_key_pem.is_some();
        if bare_key != self.subject.is_some() {
            return Err(crate::error::VssError::InvalidConfig(format!(
                "trust_anchors[{}]: subject is required with a public key and not allowed with a certificate",
                self.name
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationMechanism {
    Ocsp,
    Crl,
}

/// Resolution of `unknown` / `check-failed` revocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationPolicy {
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<RevocationMechanism>,
    /// Required in every policy.
    pub fail_mode: FailMode,
    /// Try the CRL when the OCSP responder cannot produce a usable answer.
    #[serde(default = "default_true")]
    pub crl_fallback: bool,
}

fn default_mechanisms() -> Vec<RevocationMechanism> {
    vec![RevocationMechanism::Ocsp, RevocationMechanism::Crl]
}

fn default_true() -> bool {
    true
}

fn default_max_path_length() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub oid: String,
    pub name: String,
    pub trust_anchors: Vec<String>,
    #[serde(default)]
    pub required_policies: Vec<String>,
    /// Maximum number of certificates in a path, trust anchor excluded.
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default)]
    pub require_explicit_policy: bool,
    #[serde(default)]
    pub inhibit_policy_mapping: bool,
    #[serde(default)]
    pub inhibit_any_policy: bool,
    /// Anchor certificates are trusted even without a CA basic constraint.
    #[serde(default)]
    pub trust_anchors_directly: bool,
    pub revocation: RevocationPolicy,
}

impl PolicyConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.oid.is_empty() {
            return Err(crate::error::VssError::InvalidConfig(
                "policies.oid cannot be empty".to_string(),
            ));
        }

        if self.trust_anchors.is_empty() {
            return Err(crate::error::VssError::InvalidConfig(format!(
                "policies[{}].trust_anchors cannot be empty",
                self.oid
            )));
        }

        if self.max_path_length == 0 {
            return Err(crate::error::VssError::InvalidConfig(format!(
                "policies[{}].max_path_length must be greater than 0",
                self.oid
            )));
        }

        if self.revocation.mechanisms.is_empty() {
            return Err(crate::error::VssError::InvalidConfig(format!(
                "policies[{}].revocation.mechanisms cannot be empty",
                self.oid
            )));
        }

        Ok(())
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::error::VssError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.max_candidate_paths == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "engine.max_candidate_paths must be greater than 0".to_string(),
            ));
        }

        if self.request_limits.max_oid_length == 0 || self.request_limits.max_certificate_length == 0 {
            return Err(crate::error::VssError::InvalidConfig(
                "request_limits values must be greater than 0".to_string(),
            ));
        }

        self.intermediate_cache.validate()?;
        self.revocation.validate()?;

        for anchor in &self.trust_anchors {
            anchor.validate()?;
        }

        if self.policies.is_empty() {
            return Err(crate::error::VssError::InvalidConfig(
                "at least one validation policy must be configured".to_string(),
            ));
        }

        for policy in &self.policies {
            policy.validate()?;
        }

        Ok(())
    }
}
