use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use tokio::time;

/// Per-object requeue delays after failed reconciles, doubling with each
/// consecutive failure.
#[derive(Debug)]
pub(crate) struct Backoff {
    min: time::Duration,
    max: time::Duration,
    failures: Mutex<HashMap<(String, String), u32>>,
}

// === impl Backoff ===

impl Backoff {
    pub(crate) fn new(min: time::Duration, max: time::Duration) -> Self {
        Self {
            min,
            max,
            failures: Default::default(),
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub(crate) fn failed(&self, namespace: &str, name: &str) -> time::Duration {
        let mut failures = self.failures.lock();
        let n = failures
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        let delay = self.min.saturating_mul(1 << (*n).min(16)).min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&self, namespace: &str, name: &str) {
        self.failures
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}
