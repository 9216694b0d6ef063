use crate::cache::IntermediateCache;
use crate::pkix::codec::{Certificate, Fingerprint};
use crate::policy::{TrustAnchor, ValidationPolicy};

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Certificates from the end entity (index 0) to the certificate issued by
/// the trust anchor (last index), plus that anchor.
#[derive(Debug, Clone)]
pub struct CertificationPath {
    certificates: Vec<Arc<Certificate>>,
    anchor: Arc<TrustAnchor>,
}

impl CertificationPath {
    pub fn new(certificates: Vec<Arc<Certificate>>, anchor: Arc<TrustAnchor>) -> Self {
        Self { certificates, anchor }
    }

    pub fn leaf(&self) -> &Arc<Certificate> {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[Arc<Certificate>] {
        &self.certificates
    }

    pub fn anchor(&self) -> &Arc<TrustAnchor> {
        &self.anchor
    }

    /// Number of certificates, anchor excluded.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.certificates.iter().any(|c| &c.fingerprint() == fingerprint)
    }
}

/// A partial path whose tail names caIssuers locators, with the issuers
/// already offered for it.
struct Deferred {
    partial: Vec<Arc<Certificate>>,
    offered: Vec<Fingerprint>,
}

/// Lazy breadth-first enumeration of certification paths for one leaf.
///
/// Each call to `next_candidate` expands partial paths until a complete one
/// is available, so shorter paths come out first and expansion stops as soon
/// as the caller has what it needs. Issuers held in memory are tried first;
/// AIA locators of tails that had them are chased again only once every
/// branch built so far has been handed out.
pub struct PathBuilder {
    policy: Arc<ValidationPolicy>,
    cache: Arc<IntermediateCache>,
    pending: VecDeque<Vec<Arc<Certificate>>>,
    ready: VecDeque<CertificationPath>,
    deferred: VecDeque<Deferred>,
}

impl PathBuilder {
    pub fn new(leaf: Arc<Certificate>, policy: Arc<ValidationPolicy>, cache: Arc<IntermediateCache>) -> Self {
        Self {
            policy,
            cache,
            pending: VecDeque::from([vec![leaf]]),
            ready: VecDeque::new(),
            deferred: VecDeque::new(),
        }
    }

    pub async fn next_candidate(&mut self) -> Option<CertificationPath> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Some(path);
            }

            if let Some(partial) = self.pending.pop_front() {
                self.extend(partial).await;
                continue;
            }

            let deferred = self.deferred.pop_front()?;
            self.extend_from_network(deferred).await;
        }
    }

    async fn extend(&mut self, partial: Vec<Arc<Certificate>>) {
        let tail = match partial.last() {
            Some(tail) => Arc::clone(tail),
            None => return,
        };

        let anchors: Vec<Arc<TrustAnchor>> = self.policy.anchors_for(&tail).cloned().collect();
        if !anchors.is_empty() {
            for anchor in anchors {
                debug!(
                    length = partial.len(),
                    anchor = anchor.name(),
                    leaf = %partial[0].fingerprint(),
                    "Candidate path reaches trust anchor"
                );
                self.ready.push_back(CertificationPath::new(partial.clone(), anchor));
            }
            return;
        }

        if partial.len() >= self.policy.max_path_length {
            debug!(length = partial.len(), "Discarding branch at maximum path length");
            return;
        }

        let ext = tail.extensions();
        let issuers = self
            .cache
            .candidate_issuers(tail.issuer(), ext.authority_key_id.as_deref(), &ext.ca_issuers_urls)
            .await;

        if !issuers.is_empty() && !ext.ca_issuers_urls.is_empty() {
            self.deferred.push_back(Deferred {
                partial: partial.clone(),
                offered: issuers.iter().map(|c| c.fingerprint()).collect(),
            });
        }
        self.push_issuers(&partial, issuers, &[]);
    }

    async fn extend_from_network(&mut self, deferred: Deferred) {
        let Some(tail) = deferred.partial.last() else {
            return;
        };

        let ext = tail.extensions();
        let fetched = self
            .cache
            .fetched_issuers(tail.issuer(), ext.authority_key_id.as_deref(), &ext.ca_issuers_urls)
            .await;

        if !fetched.is_empty() {
            debug!(
                length = deferred.partial.len(),
                candidates = fetched.len(),
                "Cached issuers exhausted, trying AIA issuers"
            );
        }
        self.push_issuers(&deferred.partial, fetched, &deferred.offered);
    }

    fn push_issuers(&mut self, partial: &[Arc<Certificate>], issuers: Vec<Arc<Certificate>>, skip: &[Fingerprint]) {
        for issuer in issuers {
            let fingerprint = issuer.fingerprint();
            if skip.contains(&fingerprint) || partial.iter().any(|c| c.fingerprint() == fingerprint) {
                continue;
            }
            if self.policy.is_anchor_certificate(&fingerprint) {
                continue;
            }

            let mut next = partial.to_vec();
            next.push(issuer);
            self.pending.push_back(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailMode, IntermediateCacheConfig, RevocationPolicy};
    use crate::error::Result;
    use crate::fetch::CertificateSource;
    use async_trait::async_trait;
    use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa};

    struct Bundle(Vec<Vec<u8>>);

    #[async_trait]
    impl CertificateSource for Bundle {
        fn name(&self) -> &str {
            "bundle"
        }

        async fn load(&self) -> Result<Vec<Vec<u8>>> {
            Ok(self.0.clone())
        }
    }

    fn params(cn: &str, ca: bool) -> CertificateParams {
        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = if ca { IsCa::Ca(rcgen::BasicConstraints::Unconstrained) } else { IsCa::NoCa };
        params
    }

    fn policy(anchor: &rcgen::Certificate, max_path_length: usize) -> Arc<ValidationPolicy> {
        let anchor = Certificate::from_der(&anchor.serialize_der().unwrap()).unwrap();
        Arc::new(ValidationPolicy {
            oid: "1.2.3.4".to_string(),
            name: "test".to_string(),
            trust_anchors: vec![Arc::new(TrustAnchor::from_certificate("root", anchor))],
            required_policies: vec![],
            max_path_length,
            require_explicit_policy: false,
            inhibit_policy_mapping: false,
            inhibit_any_policy: false,
            trust_anchors_directly: false,
            revocation: RevocationPolicy {
                mechanisms: vec![],
                fail_mode: FailMode::Open,
                crl_fallback: false,
            },
        })
    }

    async fn cache_with(bundle: Vec<Vec<u8>>) -> Arc<IntermediateCache> {
        let cache = Arc::new(IntermediateCache::new(
            IntermediateCacheConfig::default(),
            vec![Arc::new(Bundle(bundle))],
            None,
        ));
        cache.refresh_now().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_builds_leaf_intermediate_anchor() {
        let root = rcgen::Certificate::from_params(params("Root", true)).unwrap();
        let inter = rcgen::Certificate::from_params(params("Intermediate", true)).unwrap();
        let leaf = rcgen::Certificate::from_params(params("Leaf", false)).unwrap();

        let inter_der = inter.serialize_der_with_signer(&root).unwrap();
        let leaf_der = leaf.serialize_der_with_signer(&inter).unwrap();

        let cache = cache_with(vec![inter_der.clone()]).await;
        let leaf = Arc::new(Certificate::from_der(&leaf_der).unwrap());
        let mut builder = PathBuilder::new(Arc::clone(&leaf), policy(&root, 5), cache);

        let path = builder.next_candidate().await.unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path.leaf().fingerprint(), leaf.fingerprint());
        assert_eq!(path.certificates()[1].fingerprint(), Fingerprint::of(&inter_der));
        assert_eq!(path.anchor().name(), "root");
        assert!(builder.next_candidate().await.is_none());
    }

    #[tokio::test]
    async fn test_branch_longer_than_limit_is_discarded() {
        let root = rcgen::Certificate::from_params(params("Root", true)).unwrap();
        let inter = rcgen::Certificate::from_params(params("Intermediate", true)).unwrap();
        let leaf = rcgen::Certificate::from_params(params("Leaf", false)).unwrap();

        let inter_der = inter.serialize_der_with_signer(&root).unwrap();
        let leaf_der = leaf.serialize_der_with_signer(&inter).unwrap();

        let cache = cache_with(vec![inter_der]).await;
        let leaf = Arc::new(Certificate::from_der(&leaf_der).unwrap());
        let mut builder = PathBuilder::new(leaf, policy(&root, 1), cache);

        assert!(builder.next_candidate().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_issuer_yields_no_candidates() {
        let root = rcgen::Certificate::from_params(params("Root", true)).unwrap();
        let inter = rcgen::Certificate::from_params(params("Intermediate", true)).unwrap();
        let leaf = rcgen::Certificate::from_params(params("Leaf", false)).unwrap();
        let leaf_der = leaf.serialize_der_with_signer(&inter).unwrap();

        let cache = cache_with(vec![]).await;
        let leaf = Arc::new(Certificate::from_der(&leaf_der).unwrap());
        let mut builder = PathBuilder::new(leaf, policy(&root, 5), cache);

        assert!(builder.next_candidate().await.is_none());
    }
}
