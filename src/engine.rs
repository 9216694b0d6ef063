//! Validation Engine - entry point tying the trust components together
//!
//! The engine owns no global state: the policy registry, intermediate cache,
//! revocation checker and metrics are constructed once (normally through
//! `EngineBuilder`) and passed in explicitly. Each `validate` call is
//! independent; only the two caches are shared between concurrent requests.

use crate::cache::{IntermediateCache, RefreshHandle};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{BundleFileSource, CertificateSource, CrlFetcher, HttpFetcher, IssuerFetcher, OcspFetcher};
use crate::metrics::EngineMetrics;
use crate::pkix::builder::PathBuilder;
use crate::pkix::codec::{decode_transport, Certificate, Fingerprint};
use crate::pkix::validator::{PathFailure, PathOutcome, PathValidator};
use crate::policy::{parse_oid, PolicyRegistry, ValidationPolicy};
use crate::request::ValidationRequest;
use crate::response::{assemble, ValidationResponse, ValidationResult};
use crate::revocation::RevocationChecker;
use crate::types::{ReasonCode, Verdict};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub struct ValidationEngine {
    config: Config,
    registry: Arc<PolicyRegistry>,
    cache: Arc<IntermediateCache>,
    validator: PathValidator,
    metrics: Arc<EngineMetrics>,
    _refresh: Option<RefreshHandle>,
}

impl ValidationEngine {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        cache: Arc<IntermediateCache>,
        revocation: Arc<RevocationChecker>,
        metrics: Arc<EngineMetrics>,
        config: Config,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            validator: PathValidator::new(revocation),
            metrics,
            _refresh: None,
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<IntermediateCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Validate the request's certificate under its policy at `at` (seconds
    /// since the epoch). Input errors are returned as `Err`; every validation
    /// failure is an `invalid` response.
    pub async fn validate(&self, request: &ValidationRequest, at: i64) -> Result<ValidationResponse> {
        let result = self.validate_inner(request, at).await;

        if let Err(e) = &result {
            if e.is_input_error() {
                self.metrics.input_errors.inc();
                warn!(error = %e, policy = request.policy_oid(), "Rejected validation request");
            }
        }

        result
    }

    async fn validate_inner(&self, request: &ValidationRequest, at: i64) -> Result<ValidationResponse> {
        request.pre_validate(&self.config.request_limits)?;

        let oid = parse_oid(request.policy_oid())?;
        let policy = self.registry.lookup(&oid)?;
        let certificate = Arc::new(decode_transport(request.certificate())?);
        let fingerprint = certificate.fingerprint();

        let span = info_span!(
            "validate",
            request_id = %Uuid::new_v4(),
            x5t = %fingerprint,
            policy = %policy.oid
        );

        async move {
            let started = Instant::now();
            let result = self.evaluate(certificate, &policy, at).await;
            let response = assemble(&result, request.want_back(), &fingerprint);

            self.metrics
                .record_verdict(result.verdict, result.reason.as_ref().map(ReasonCode::as_str));
            self.metrics.validation_latency.observe(started.elapsed().as_secs_f64());

            match result.verdict {
                Verdict::Valid => info!(verdict = "valid", "Certificate validated"),
                Verdict::Invalid => info!(
                    verdict = "invalid",
                    reason = %result.reason.unwrap_or(ReasonCode::NoPathFound),
                    detail = result.detail.as_deref().unwrap_or(""),
                    "Certificate rejected"
                ),
            }

            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Try candidate paths in builder order until one validates. When none
    /// does, report the failure of the most complete candidate.
    async fn evaluate(&self, certificate: Arc<Certificate>, policy: &Arc<ValidationPolicy>, at: i64) -> ValidationResult {
        let mut builder = PathBuilder::new(certificate, Arc::clone(policy), Arc::clone(&self.cache));
        let mut revoked: HashSet<Fingerprint> = HashSet::new();
        let mut best: Option<PathFailure> = None;
        let mut evaluated = 0;

        while evaluated < self.config.engine.max_candidate_paths {
            let Some(path) = builder.next_candidate().await else {
                break;
            };

            if let Some(cert) = path.certificates().iter().find(|c| revoked.contains(&c.fingerprint())) {
                debug!(revoked = %cert.fingerprint(), "Skipping candidate through revoked certificate");
                continue;
            }

            evaluated += 1;
            debug!(length = path.len(), anchor = path.anchor().name(), "Evaluating candidate path");

            match self.validator.validate(&path, policy, at).await {
                PathOutcome::Valid(validated) => return ValidationResult::valid(validated, at),
                PathOutcome::Invalid(failure) => {
                    debug!(reason = %failure.reason, detail = %failure.detail, "Candidate path rejected");

                    if let Some(fingerprint) = failure.revoked {
                        revoked.insert(fingerprint);
                    }

                    if best.as_ref().map_or(true, |b| failure.progress > b.progress) {
                        best = Some(failure);
                    }
                }
            }
        }

        match best {
            Some(failure) => ValidationResult::invalid(failure.reason, failure.detail, at),
            None => ValidationResult::invalid(
                ReasonCode::NoPathFound,
                format!("no certification path to a trust anchor of policy {}", policy.oid),
                at,
            ),
        }
    }
}

/// Wires an engine from configuration. Collaborators not supplied explicitly
/// get their production implementations.
pub struct EngineBuilder {
    config: Config,
    sources: Option<Vec<Arc<dyn CertificateSource>>>,
    issuer_fetcher: Option<Arc<dyn IssuerFetcher>>,
    ocsp_fetcher: Option<Arc<dyn OcspFetcher>>,
    crl_fetcher: Option<Arc<dyn CrlFetcher>>,
    metrics: Option<Arc<EngineMetrics>>,
    background_refresh: bool,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sources: None,
            issuer_fetcher: None,
            ocsp_fetcher: None,
            crl_fetcher: None,
            metrics: None,
            background_refresh: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.clone())
    }

    pub fn with_sources(mut self, sources: Vec<Arc<dyn CertificateSource>>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_issuer_fetcher(mut self, fetcher: Arc<dyn IssuerFetcher>) -> Self {
        self.issuer_fetcher = Some(fetcher);
        self
    }

    pub fn with_ocsp_fetcher(mut self, fetcher: Arc<dyn OcspFetcher>) -> Self {
        self.ocsp_fetcher = Some(fetcher);
        self
    }

    pub fn with_crl_fetcher(mut self, fetcher: Arc<dyn CrlFetcher>) -> Self {
        self.crl_fetcher = Some(fetcher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = enabled;
        self
    }

    /// Load policies and trust anchors, warm the intermediate cache and
    /// start its refresh task. Any failure here is a startup failure.
    pub async fn build(self) -> Result<ValidationEngine> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(PolicyRegistry::from_config(&config)?);
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => EngineMetrics::new()?,
        };

        let sources = self.sources.unwrap_or_else(|| {
            let paths = config.intermediate_cache.bundle_paths.clone();
            if paths.is_empty() {
                Vec::new()
            } else {
                vec![Arc::new(BundleFileSource::new(paths)) as Arc<dyn CertificateSource>]
            }
        });

        let issuer_fetcher = if config.intermediate_cache.aia_chasing_enabled {
            Some(self.issuer_fetcher.unwrap_or_else(|| {
                Arc::new(HttpFetcher::new(config.intermediate_cache.max_response_bytes)) as Arc<dyn IssuerFetcher>
            }))
        } else {
            None
        };

        let cache = Arc::new(
            IntermediateCache::new(config.intermediate_cache.clone(), sources, issuer_fetcher)
                .with_metrics(Arc::clone(&metrics)),
        );
        cache.refresh_now().await?;

        let revocation_http = Arc::new(HttpFetcher::new(config.revocation.max_response_bytes));
        let ocsp_fetcher = self
            .ocsp_fetcher
            .unwrap_or_else(|| Arc::clone(&revocation_http) as Arc<dyn OcspFetcher>);
        let crl_fetcher = self
            .crl_fetcher
            .unwrap_or_else(|| revocation_http as Arc<dyn CrlFetcher>);

        let revocation = Arc::new(
            RevocationChecker::new(config.revocation.clone(), ocsp_fetcher, crl_fetcher)
                .with_metrics(Arc::clone(&metrics)),
        );

        let refresh = self.background_refresh.then(|| cache.spawn_refresh());

        info!(
            policies = registry.len(),
            bundle_certificates = cache.bundle_size(),
            aia_chasing = config.intermediate_cache.aia_chasing_enabled,
            "Validation engine ready"
        );

        let mut engine = ValidationEngine::new(registry, cache, revocation, metrics, config);
        engine._refresh = refresh;
        Ok(engine)
    }
}
