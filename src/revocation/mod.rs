//! Revocation Checker
//!
//! Determines per-certificate revocation status via OCSP (preferred) or CRL,
//! validating the evidence's own signature and freshness before trusting
//! it. Conclusive answers are cached until the evidence expires; misses
//! share one fetch per (certificate, issuer) pair.

pub mod cache;
pub mod crl;
pub mod ocsp;

use crate::cache::SingleFlight;
use crate::config::{RevocationConfig, RevocationMechanism};
use crate::fetch::{CrlFetcher, OcspFetcher};
use crate::metrics::EngineMetrics;
use crate::pkix::codec::{Certificate, Fingerprint, KeyUsage, Name, PublicKeyInfo};
use crate::policy::{TrustAnchor, ValidationPolicy};

use self::cache::RevocationCache;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevocationState {
    Good,
    Revoked,
    Unknown,
    CheckFailed,
}

impl RevocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationState::Good => "good",
            RevocationState::Revoked => "revoked",
            RevocationState::Unknown => "unknown",
            RevocationState::CheckFailed => "check-failed",
        }
    }

    pub fn is_conclusive(&self) -> bool {
        matches!(self, RevocationState::Good | RevocationState::Revoked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Ocsp,
    Crl,
}

/// The signed object a status was derived from.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// Responder or distribution point URL.
    pub source: String,
    /// Raw OCSP response or CRL.
    pub der: Arc<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RevocationStatus {
    pub state: RevocationState,
    pub evidence: Option<Evidence>,
    pub this_update: Option<i64>,
    pub next_update: Option<i64>,
    pub revocation_time: Option<i64>,
    /// Why the status is not conclusive.
    pub detail: Option<String>,
}

impl RevocationStatus {
    pub fn new(state: RevocationState) -> Self {
        Self {
            state,
            evidence: None,
            this_update: None,
            next_update: None,
            revocation_time: None,
            detail: None,
        }
    }

    pub fn unknown(detail: String) -> Self {
        let mut status = Self::new(RevocationState::Unknown);
        status.detail = Some(detail);
        status
    }

    pub fn check_failed(detail: String) -> Self {
        let mut status = Self::new(RevocationState::CheckFailed);
        status.detail = Some(detail);
        status
    }
}

/// What the checker needs to know about the issuer of the certificate under
/// test. Built from an intermediate or from a trust anchor.
#[derive(Debug, Clone)]
pub struct Issuer {
    pub name: Name,
    pub public_key: PublicKeyInfo,
    pub key_usage: Option<KeyUsage>,
    pub fingerprint: Fingerprint,
}

impl Issuer {
    pub fn from_certificate(cert: &Certificate) -> Self {
        Self {
            name: cert.subject().clone(),
            public_key: cert.public_key().clone(),
            key_usage: cert.extensions().key_usage,
            fingerprint: cert.fingerprint(),
        }
    }

    pub fn from_anchor(anchor: &TrustAnchor) -> Self {
        match anchor.certificate() {
            Some(cert) => Self::from_certificate(cert),
            None => Self {
                name: anchor.subject().clone(),
                public_key: anchor.public_key().clone(),
                key_usage: None,
                fingerprint: Fingerprint::of(&anchor.public_key().key),
            },
        }
    }
}

/// thisUpdate must not be in the future beyond the skew, and the evidence
/// must not have passed nextUpdate (or the default window without one).
pub(crate) fn is_fresh(this_update: i64, next_update: Option<i64>, at: i64, config: &RevocationConfig) -> bool {
    if this_update > at.saturating_add(config.clock_skew_seconds as i64) {
        return false;
    }

    match next_update {
        Some(next_update) => at < next_update,
        None => at < this_update.saturating_add(config.default_freshness_seconds as i64),
    }
}

type FlightKey = (Fingerprint, Fingerprint, bool, bool, bool, i64);
type CrlFlight = SingleFlight<String, Result<Arc<Vec<u8>>, String>>;

#[derive(Debug, Clone)]
struct CachedCrl {
    der: Arc<Vec<u8>>,
    next_update: Option<i64>,
}

pub struct RevocationChecker {
    config: RevocationConfig,
    ocsp_fetcher: Arc<dyn OcspFetcher>,
    crl_fetcher: Arc<dyn CrlFetcher>,
    cache: RevocationCache,
    in_flight: SingleFlight<FlightKey, RevocationStatus>,
    crl_flight: CrlFlight,
    crls: Mutex<LruCache<String, CachedCrl>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl RevocationChecker {
    pub fn new(config: RevocationConfig, ocsp_fetcher: Arc<dyn OcspFetcher>, crl_fetcher: Arc<dyn CrlFetcher>) -> Self {
        let cache = RevocationCache::new(config.cache_max_entries, config.clock_skew_seconds);
        let crl_capacity = NonZeroUsize::new(config.crl_cache_max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            ocsp_fetcher,
            crl_fetcher,
            cache,
            in_flight: SingleFlight::new(),
            crl_flight: SingleFlight::new(),
            crls: Mutex::new(LruCache::new(crl_capacity)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Revocation status of `cert` as issued by `issuer`, at time `at`.
    /// Cache hits never touch the network.
    pub async fn status(
        self: &Arc<Self>,
        cert: &Arc<Certificate>,
        issuer: &Issuer,
        policy: &ValidationPolicy,
        at: i64,
    ) -> RevocationStatus {
        let use_ocsp = policy.allows(RevocationMechanism::Ocsp);
        let use_crl = policy.allows(RevocationMechanism::Crl);
        let key = (cert.fingerprint(), issuer.fingerprint, use_ocsp, use_crl);

        if let Some(status) = self.cache.get(&key, at) {
            if let Some(metrics) = &self.metrics {
                metrics.revocation_cache_hits.inc();
            }
            debug!(fingerprint = %cert.fingerprint(), state = status.state.as_str(), "Revocation cache hit");
            return status;
        }

        if let Some(metrics) = &self.metrics {
            metrics.revocation_cache_misses.inc();
        }

        let crl_fallback = policy.revocation.crl_fallback;
        let flight_key: FlightKey = (key.0, key.1, use_ocsp, use_crl, crl_fallback, at);

        let checker = Arc::clone(self);
        let cert = Arc::clone(cert);
        let issuer = issuer.clone();

        self.in_flight
            .run(flight_key, move || async move {
                let status = checker.resolve(&cert, &issuer, use_ocsp, use_crl, crl_fallback, at).await;
                if status.state.is_conclusive() {
                    let valid_until = status.next_update.unwrap_or_else(|| {
                        status.this_update.unwrap_or(at) + checker.config.default_freshness_seconds as i64
                    });
                    checker.cache.put(key, status.clone(), valid_until);
                }
                status
            })
            .await
            .unwrap_or_else(|| RevocationStatus::check_failed("revocation check aborted".to_string()))
    }

    async fn resolve(
        &self,
        cert: &Certificate,
        issuer: &Issuer,
        use_ocsp: bool,
        use_crl: bool,
        crl_fallback: bool,
        at: i64,
    ) -> RevocationStatus {
        let ext = cert.extensions();
        let mut ocsp_status = None;

        if use_ocsp && !ext.ocsp_urls.is_empty() {
            let status = self.check_ocsp(cert, issuer, at).await;
            self.record("ocsp", &status);

            if status.state.is_conclusive() || !(use_crl && crl_fallback) || ext.crl_urls.is_empty() {
                return status;
            }

            warn!(
                fingerprint = %cert.fingerprint(),
                detail = status.detail.as_deref().unwrap_or(""),
                "OCSP inconclusive, falling back to CRL"
            );
            ocsp_status = Some(status);
        }

        if use_crl && !ext.crl_urls.is_empty() {
            let status = self.check_crl(cert, issuer, at).await;
            self.record("crl", &status);
            return status;
        }

        ocsp_status.unwrap_or_else(|| {
            RevocationStatus::unknown("certificate names no locator for a permitted revocation mechanism".to_string())
        })
    }

    fn record(&self, mechanism: &str, status: &RevocationStatus) {
        if let Some(metrics) = &self.metrics {
            metrics
                .revocation_checks
                .with_label_values(&[mechanism, status.state.as_str()])
                .inc();
        }
    }

    async fn check_ocsp(&self, cert: &Certificate, issuer: &Issuer, at: i64) -> RevocationStatus {
        let request = match ocsp::build_request(cert, issuer) {
            Ok(request) => request,
            Err(e) => return RevocationStatus::check_failed(format!("cannot build OCSP request: {}", e)),
        };

        let mut last = RevocationStatus::check_failed("no OCSP responder answered".to_string());

        for url in &cert.extensions().ocsp_urls {
            let fetched = tokio::time::timeout(self.config.ocsp_timeout(), self.ocsp_fetcher.fetch_ocsp(url, &request)).await;

            let status = match fetched {
                Ok(Ok(bytes)) => ocsp::evaluate_response(bytes, url, cert, issuer, at, &self.config),
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "OCSP responder unreachable");
                    RevocationStatus::check_failed(format!("OCSP {}: {}", url, e))
                }
                Err(_) => {
                    warn!(url = %url, timeout_ms = self.config.ocsp_timeout_ms, "OCSP request timed out");
                    RevocationStatus::check_failed(format!("OCSP {}: timed out", url))
                }
            };

            if status.state.is_conclusive() {
                return status;
            }
            last = status;
        }

        last
    }

    /// CRL bytes for `url`: the cached copy while it is still current,
    /// otherwise one shared download per URL.
    async fn fetch_crl(&self, url: &str, at: i64) -> Result<Arc<Vec<u8>>, String> {
        {
            let mut crls = self.crls.lock();
            let current = crls
                .get(url)
                .map(|cached| (cached.next_update.map(|n| at < n).unwrap_or(false), Arc::clone(&cached.der)));
            match current {
                Some((true, der)) => return Ok(der),
                Some((false, _)) => {
                    crls.pop(url);
                }
                None => {}
            }
        }

        let fetcher = Arc::clone(&self.crl_fetcher);
        let timeout = self.config.crl_timeout();
        let timeout_ms = self.config.crl_timeout_ms;
        let owned_url = url.to_string();

        let fetched = self
            .crl_flight
            .run(url.to_string(), move || async move {
                match tokio::time::timeout(timeout, fetcher.fetch_crl(&owned_url)).await {
                    Ok(Ok(bytes)) => Ok(Arc::new(bytes)),
                    Ok(Err(e)) => {
                        warn!(url = %owned_url, error = %e, "CRL distribution point unreachable");
                        Err(e.to_string())
                    }
                    Err(_) => {
                        warn!(url = %owned_url, timeout_ms, "CRL fetch timed out");
                        Err("timed out".to_string())
                    }
                }
            })
            .await
            .unwrap_or_else(|| Err("CRL fetch aborted".to_string()))?;

        self.crls.lock().put(
            url.to_string(),
            CachedCrl {
                der: Arc::clone(&fetched),
                next_update: crl::next_update_of(&fetched),
            },
        );

        Ok(fetched)
    }

    async fn check_crl(&self, cert: &Certificate, issuer: &Issuer, at: i64) -> RevocationStatus {
        let mut last = RevocationStatus::check_failed("no CRL distribution point answered".to_string());

        for url in &cert.extensions().crl_urls {
            let status = match self.fetch_crl(url, at).await {
                Ok(bytes) => crl::evaluate_crl(bytes, url, cert, issuer, at, &self.config),
                Err(e) => RevocationStatus::check_failed(format!("CRL {}: {}", url, e)),
            };

            if status.state.is_conclusive() {
                return status;
            }
            last = status;
        }

        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_window() {
        let config = RevocationConfig {
            clock_skew_seconds: 60,
            default_freshness_seconds: 3600,
            ..Default::default()
        };

        // Within [thisUpdate, nextUpdate)
        assert!(is_fresh(1000, Some(2000), 1500, &config));
        assert!(!is_fresh(1000, Some(2000), 2000, &config));
        // thisUpdate slightly in the future is tolerated up to the skew
        assert!(is_fresh(1050, Some(2000), 1000, &config));
        assert!(!is_fresh(1100, Some(2000), 1000, &config));
        // No nextUpdate: default window
        assert!(is_fresh(1000, None, 4599, &config));
        assert!(!is_fresh(1000, None, 4600, &config));
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&RevocationState::CheckFailed).unwrap(), "\"check-failed\"");
        assert!(RevocationState::Revoked.is_conclusive());
        assert!(!RevocationState::Unknown.is_conclusive());
    }
}
