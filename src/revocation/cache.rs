use crate::pkix::codec::Fingerprint;
use crate::revocation::{RevocationState, RevocationStatus};

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Certificate and issuer fingerprints, then whether OCSP and CRL evidence
/// were permitted when the answer was produced.
pub type StatusKey = (Fingerprint, Fingerprint, bool, bool);

#[derive(Debug, Clone)]
struct CachedStatus {
    status: RevocationStatus,
    valid_until: i64,
}

/// Conclusive revocation answers keyed by (certificate, issuer) fingerprint
/// and the permitted mechanisms.
/// Entries live until the evidence's own expiry, judged against the
/// validation time of the request reading them.
pub struct RevocationCache {
    entries: Mutex<LruCache<StatusKey, CachedStatus>>,
    clock_skew: i64,
}

impl RevocationCache {
    pub fn new(capacity: usize, clock_skew_seconds: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock_skew: clock_skew_seconds as i64,
        }
    }

    pub fn get(&self, key: &StatusKey, at: i64) -> Option<RevocationStatus> {
        let mut entries = self.entries.lock();

        let (usable, expired) = match entries.get(key) {
            Some(cached) => {
                let not_before = cached.status.this_update.unwrap_or(i64::MIN).saturating_sub(self.clock_skew);
                (at >= not_before && at < cached.valid_until, at >= cached.valid_until)
            }
            None => return None,
        };

        if expired {
            entries.pop(key);
            return None;
        }

        if usable {
            entries.get(key).map(|cached| cached.status.clone())
        } else {
            None
        }
    }

    /// Store a status until `valid_until`. Only `good` and `revoked` answers
    /// are kept.
    pub fn put(&self, key: StatusKey, status: RevocationStatus, valid_until: i64) {
        if !matches!(status.state, RevocationState::Good | RevocationState::Revoked) {
            return;
        }
        self.entries.lock().put(key, CachedStatus { status, valid_until });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
