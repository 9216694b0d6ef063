use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::oneshot;

type Waiters<K, V> = Arc<Mutex<HashMap<K, Vec<oneshot::Sender<V>>>>>;

/// Per-key in-flight request table.
///
/// The first caller for a key spawns the work on the runtime; later callers
/// for the same key wait for that one outcome. The spawned task is detached
/// from every caller, so a cancelled request does not cancel a shared fetch.
pub struct SingleFlight<K, V> {
    waiters: Waiters<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a run is already in flight, then wait for
    /// the shared outcome. Returns `None` if the work panicked or the runtime
    /// dropped it.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut waiters = self.waiters.lock();
            match waiters.get_mut(&key) {
                Some(pending) => {
                    pending.push(tx);
                    false
                }
                None => {
                    waiters.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            let future = work();
            let mut completion = Completion {
                key,
                waiters: Arc::clone(&self.waiters),
                value: None,
            };
            tokio::spawn(async move {
                completion.value = Some(future.await);
            });
        }

        rx.await.ok()
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Removes the table entry when the spawned task ends, normally or not.
/// Waiters receive the value if one was produced; otherwise their senders
/// are dropped and they observe `None`.
struct Completion<K: Eq + Hash, V: Clone> {
    key: K,
    waiters: Waiters<K, V>,
    value: Option<V>,
}

impl<K: Eq + Hash, V: Clone> Drop for Completion<K, V> {
    fn drop(&mut self) {
        let pending = self.waiters.lock().remove(&self.key).unwrap_or_default();
        if let Some(value) = self.value.take() {
            for tx in pending {
                let _ = tx.send(value.clone());
            }
        }
    }
}
