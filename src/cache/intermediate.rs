use crate::cache::single_flight::SingleFlight;
use crate::config::IntermediateCacheConfig;
use crate::error::{Result, VssError};
use crate::fetch::{CertificateSource, IssuerFetcher};
use crate::metrics::EngineMetrics;
use crate::pkix::codec::{decode_pem_bundle, Certificate, Name};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lookup key for issuer candidates: subject name DER plus the key
/// identifier the child expects, when it names one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssuerKey {
    subject: Vec<u8>,
    key_id: Option<Vec<u8>>,
}

impl IssuerKey {
    pub fn new(subject: &Name, key_id: Option<&[u8]>) -> Self {
        Self {
            subject: subject.as_der().to_vec(),
            key_id: key_id.map(<[u8]>::to_vec),
        }
    }

    fn matches(&self, cert: &Certificate) -> bool {
        if cert.subject().as_der() != self.subject.as_slice() {
            return false;
        }
        match (&self.key_id, &cert.extensions().subject_key_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }
}

/// Certificates fetched on demand for one issuer key.
#[derive(Debug, Clone)]
struct CacheEntry {
    certificates: Vec<Arc<Certificate>>,
    urls: Vec<String>,
    expires_at: Instant,
}

/// Snapshot of the curated bundle, indexed by subject DER. Replaced wholesale
/// on every refresh.
#[derive(Debug, Default)]
struct BundleIndex {
    by_subject: HashMap<Vec<u8>, Vec<Arc<Certificate>>>,
    total: usize,
}

impl BundleIndex {
    fn build(ders: Vec<Vec<u8>>) -> Self {
        let mut index = Self::default();
        let mut seen = HashSet::new();

        for der in ders {
            match Certificate::from_der(&der) {
                Ok(cert) => {
                    if !seen.insert(cert.fingerprint()) {
                        continue;
                    }
                    index
                        .by_subject
                        .entry(cert.subject().as_der().to_vec())
                        .or_default()
                        .push(Arc::new(cert));
                    index.total += 1;
                }
                Err(e) => warn!(error = %e, "Skipping undecodable bundle certificate"),
            }
        }

        index
    }
}

/// Supplies candidate issuer certificates to the path builder.
///
/// Reads go to a lock-free bundle snapshot and a concurrent map of AIA
/// entries. Misses chase AIA caIssuers pointers with at most one fetch in
/// flight per key.
pub struct IntermediateCache {
    config: IntermediateCacheConfig,
    sources: Vec<Arc<dyn CertificateSource>>,
    fetcher: Option<Arc<dyn IssuerFetcher>>,
    bundle: ArcSwap<BundleIndex>,
    entries: DashMap<IssuerKey, CacheEntry>,
    in_flight: SingleFlight<IssuerKey, Vec<Arc<Certificate>>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl IntermediateCache {
    pub fn new(
        config: IntermediateCacheConfig,
        sources: Vec<Arc<dyn CertificateSource>>,
        fetcher: Option<Arc<dyn IssuerFetcher>>,
    ) -> Self {
        Self {
            config,
            sources,
            fetcher,
            bundle: ArcSwap::from_pointee(BundleIndex::default()),
            entries: DashMap::new(),
            in_flight: SingleFlight::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Candidate issuers for `subject`, optionally narrowed by the child's
    /// authority key identifier. `aia_urls` are the child's caIssuers
    /// locators, chased only when nothing is held in memory.
    pub async fn candidate_issuers(
        self: &Arc<Self>,
        subject: &Name,
        key_id: Option<&[u8]>,
        aia_urls: &[String],
    ) -> Vec<Arc<Certificate>> {
        let local = self.local_issuers(subject, key_id);
        if !local.is_empty() {
            return local;
        }
        self.fetched_issuers(subject, key_id, aia_urls).await
    }

    /// The bundle plus unexpired AIA entries. Never touches the network.
    fn local_issuers(self: &Arc<Self>, subject: &Name, key_id: Option<&[u8]>) -> Vec<Arc<Certificate>> {
        let key = IssuerKey::new(subject, key_id);

        let mut candidates: Vec<Arc<Certificate>> = self
            .bundle
            .load()
            .by_subject
            .get(subject.as_der())
            .map(|certs| certs.iter().filter(|c| key.matches(c)).cloned().collect())
            .unwrap_or_default();

        if let Some(entry) = self.fresh_entry(&key) {
            candidates.extend(entry.certificates);
        }

        if !candidates.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.intermediate_cache_hits.inc();
            }
            debug!(subject = %subject, candidates = candidates.len(), "Intermediate cache hit");
        }

        dedup(candidates)
    }

    /// Issuers reachable through the child's caIssuers locators `aia_urls`.
    /// A fresh entry from an earlier fetch is reused.
    pub async fn fetched_issuers(
        self: &Arc<Self>,
        subject: &Name,
        key_id: Option<&[u8]>,
        aia_urls: &[String],
    ) -> Vec<Arc<Certificate>> {
        let key = IssuerKey::new(subject, key_id);

        if let Some(entry) = self.fresh_entry(&key) {
            return entry.certificates;
        }

        if let Some(metrics) = &self.metrics {
            metrics.intermediate_cache_misses.inc();
        }

        if !self.config.aia_chasing_enabled || aia_urls.is_empty() || self.fetcher.is_none() {
            debug!(subject = %subject, "No AIA locator to chase");
            return Vec::new();
        }

        self.fetch_shared(key, aia_urls.to_vec()).await
    }

    /// Unexpired entry for `key`; schedules a refresh when it is close to
    /// expiry and drops it once expired.
    fn fresh_entry(self: &Arc<Self>, key: &IssuerKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let cached = self.entries.get(key).map(|entry| entry.value().clone());

        match cached {
            Some(entry) if entry.expires_at > now => {
                if entry.expires_at <= now + self.config.refresh_ahead() {
                    self.spawn_entry_refresh(key.clone(), entry.urls.clone());
                }
                Some(entry)
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn fetch_shared(self: &Arc<Self>, key: IssuerKey, urls: Vec<String>) -> Vec<Arc<Certificate>> {
        let cache = Arc::clone(self);
        let work_key = key.clone();
        self.in_flight
            .run(key, move || async move { cache.fetch_and_store(work_key, urls).await })
            .await
            .unwrap_or_default()
    }

    fn spawn_entry_refresh(self: &Arc<Self>, key: IssuerKey, urls: Vec<String>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            debug!(urls = ?urls, "Refreshing intermediate entry ahead of expiry");
            cache.fetch_shared(key, urls).await;
        });
    }

    /// Fetch every locator in order and keep the first set of matching
    /// certificates. Failures produce no candidates and are not cached.
    async fn fetch_and_store(&self, key: IssuerKey, urls: Vec<String>) -> Vec<Arc<Certificate>> {
        let Some(fetcher) = &self.fetcher else {
            return Vec::new();
        };

        for url in &urls {
            let result = tokio::time::timeout(self.config.fetch_timeout(), fetcher.fetch_issuers(url))
                .await
                .map_err(|_| VssError::Timeout(format!("AIA fetch from {}", url)))
                .and_then(|r| r);

            let certificates = match result.and_then(|bytes| decode_pem_bundle(&bytes)) {
                Ok(certs) => certs,
                Err(e) => {
                    warn!(url = %url, error = %e, "AIA issuer fetch failed");
                    self.record_fetch("failure");
                    continue;
                }
            };

            let matching: Vec<Arc<Certificate>> = certificates
                .into_iter()
                .filter(|c| key.matches(c))
                .map(Arc::new)
                .collect();

            if matching.is_empty() {
                warn!(url = %url, "AIA response held no certificate for the requested issuer");
                self.record_fetch("no_match");
                continue;
            }

            self.record_fetch("success");
            self.store(key, matching.clone(), urls.clone());
            return matching;
        }

        Vec::new()
    }

    fn record_fetch(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.intermediate_fetches.with_label_values(&[outcome]).inc();
        }
    }

    fn store(&self, key: IssuerKey, certificates: Vec<Arc<Certificate>>, urls: Vec<String>) {
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                certificates,
                urls,
                expires_at: now + self.config.entry_ttl(),
            },
        );
        self.enforce_capacity();
    }

    /// Evict the earliest-expiring entries until within `max_entries`.
    fn enforce_capacity(&self) {
        while self.entries.len() > self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Reload bundle sources into a new snapshot, re-fetch AIA entries near
    /// expiry, and drop expired ones. No lock is held across a fetch.
    pub async fn refresh_now(self: &Arc<Self>) -> Result<()> {
        let mut ders = Vec::new();
        for source in &self.sources {
            let loaded = source.load().await?;
            debug!(source = source.name(), certificates = loaded.len(), "Loaded certificate source");
            ders.extend(loaded);
        }

        let index = BundleIndex::build(ders);
        let total = index.total;
        self.bundle.store(Arc::new(index));

        let now = Instant::now();
        let horizon = now + self.config.refresh_ahead();

        let (expired, due): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .filter(|entry| entry.value().expires_at <= horizon)
            .map(|entry| (entry.key().clone(), entry.value().urls.clone(), entry.value().expires_at <= now))
            .partition(|(_, _, expired)| *expired);

        for (key, _, _) in &expired {
            self.entries.remove(key);
        }

        for (key, urls, _) in due {
            self.fetch_shared(key, urls).await;
        }

        info!(
            bundle_certificates = total,
            aia_entries = self.entries.len(),
            evicted = expired.len(),
            "Intermediate cache refreshed"
        );

        Ok(())
    }

    /// Run `refresh_now` every `refresh_interval_seconds` until the returned
    /// handle is dropped.
    pub fn spawn_refresh(self: &Arc<Self>) -> RefreshHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.refresh_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; the cache is already warm.
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(cache) = cache.upgrade() else {
                    break;
                };

                if let Err(e) = cache.refresh_now().await {
                    error!(error = %e, "Intermediate cache refresh failed; keeping previous snapshot");
                }
            }
        });

        RefreshHandle { task }
    }

    /// Number of on-demand entries currently held.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn bundle_size(&self) -> usize {
        self.bundle.load().total
    }

}

fn dedup(certificates: Vec<Arc<Certificate>>) -> Vec<Arc<Certificate>> {
    let mut seen = HashSet::new();
    certificates
        .into_iter()
        .filter(|c| seen.insert(c.fingerprint()))
        .collect()
}

/// Owns the background refresh task and aborts it on drop.
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
