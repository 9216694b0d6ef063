use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

use crate::types::Verdict;

pub struct EngineMetrics {
    pub verdicts: IntCounterVec,
    pub input_errors: IntCounter,
    pub intermediate_cache_hits: IntCounter,
    pub intermediate_cache_misses: IntCounter,
    pub intermediate_fetches: IntCounterVec,
    pub revocation_cache_hits: IntCounter,
    pub revocation_cache_misses: IntCounter,
    pub revocation_checks: IntCounterVec,
    pub validation_latency: Histogram,
    pub registry: Registry,
}

impl EngineMetrics {
    pub fn new() -> crate::Result<Arc<Self>> {
        let registry = Registry::new();

        let verdicts = IntCounterVec::new(
            Opts::new("vss_validations_total", "Validation verdicts by result"),
            &["result", "reason"],
        )?;

        let input_errors = IntCounter::new(
            "vss_input_errors_total",
            "Requests rejected before validation",
        )?;

        let intermediate_cache_hits = IntCounter::new(
            "vss_intermediate_cache_hits_total",
            "Issuer lookups answered from the intermediate cache",
        )?;

        let intermediate_cache_misses = IntCounter::new(
            "vss_intermediate_cache_misses_total",
            "Issuer lookups not answered from the intermediate cache",
        )?;

        let intermediate_fetches = IntCounterVec::new(
            Opts::new("vss_intermediate_fetches_total", "AIA issuer fetches by outcome"),
            &["outcome"],
        )?;

        let revocation_cache_hits = IntCounter::new(
            "vss_revocation_cache_hits_total",
            "Revocation status served from cache",
        )?;

        let revocation_cache_misses = IntCounter::new(
            "vss_revocation_cache_misses_total",
            "Revocation status requiring a fetch",
        )?;

        let revocation_checks = IntCounterVec::new(
            Opts::new("vss_revocation_checks_total", "Revocation checks by mechanism and status"),
            &["mechanism", "status"],
        )?;

        let validation_latency = Histogram::with_opts(HistogramOpts::new(
            "vss_validation_latency_seconds",
            "End-to-end validation latency",
        ))?;

        registry.register(Box::new(verdicts.clone()))?;
        registry.register(Box::new(input_errors.clone()))?;
        registry.register(Box::new(intermediate_cache_hits.clone()))?;
        registry.register(Box::new(intermediate_cache_misses.clone()))?;
        registry.register(Box::new(intermediate_fetches.clone()))?;
        registry.register(Box::new(revocation_cache_hits.clone()))?;
        registry.register(Box::new(revocation_cache_misses.clone()))?;
        registry.register(Box::new(revocation_checks.clone()))?;
        registry.register(Box::new(validation_latency.clone()))?;

        Ok(Arc::new(Self {
            verdicts,
            input_errors,
            intermediate_cache_hits,
            intermediate_cache_misses,
            intermediate_fetches,
            revocation_cache_hits,
            revocation_cache_misses,
            revocation_checks,
            validation_latency,
            registry,
        }))
    }

    pub fn record_verdict(&self, verdict: Verdict, reason: Option<&str>) {
        let result = match verdict {
            Verdict::Valid => "valid",
            Verdict::Invalid => "invalid",
        };
        self.verdicts.with_label_values(&[result, reason.unwrap_or("")]).inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather_text(&self) -> crate::Result<String> {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_counter_labels() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_verdict(Verdict::Invalid, Some("revoked"));
        metrics.record_verdict(Verdict::Valid, None);

        assert_eq!(metrics.verdicts.with_label_values(&["invalid", "revoked"]).get(), 1);
        assert_eq!(metrics.verdicts.with_label_values(&["valid", ""]).get(), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("vss_validations_total"));
    }
}
