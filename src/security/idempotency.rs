use std::sync::Arc;
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate,
}

type SeenMap = Arc<Mutex<HashMap<String, Instant>>>;

/// Time-bounded set of delivery ids already accepted.
///
/// Construct inside a tokio runtime: `new` starts the sweep task, which runs
/// every `ttl / 5` and is stopped by `close` or on drop.
#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    inner: SeenMap,
    shutdown: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        let sweep_every = (ttl / 5).max(Duration::from_millis(10));
        Self::with_sweep_interval(ttl, sweep_every)
    }

    pub fn new_ttl(ttl_secs: u64) -> Self {
        Self::new(Duration::from_secs(ttl_secs))
    }

    pub fn with_sweep_interval(ttl: Duration, sweep_every: Duration) -> Self {
        let inner: SeenMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let handle = spawn_sweep(inner.clone(), ttl, sweep_every, shutdown.clone());
        Self {
            ttl,
            inner,
            shutdown,
            sweeper: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Atomic check-and-set. An empty id cannot be deduplicated and is always
    /// `Claimed` without touching the map.
    pub async fn try_claim(&self, delivery_id: &str) -> ClaimOutcome {
        if delivery_id.is_empty() {
            return ClaimOutcome::Claimed;
        }
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        if let Some(seen) = map.get(delivery_id) {
            if now.duration_since(*seen) < self.ttl {
                return ClaimOutcome::Duplicate;
            }
        }
        map.insert(delivery_id.to_string(), now);
        ClaimOutcome::Claimed
    }

    /// Forget a claim so the provider's retry is processed as new.
    pub async fn rollback(&self, delivery_id: &str) {
        if delivery_id.is_empty() {
            return;
        }
        self.inner.lock().await.remove(delivery_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One sweep pass, same as the background task performs.
    pub async fn sweep(&self) -> usize {
        sweep_once(&self.inner, self.ttl).await
    }

    /// Stop the sweep task. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Block every claim and rollback until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn hold_lock(
        &self,
    ) -> tokio::sync::OwnedMutexGuard<HashMap<String, Instant>> {
        self.inner.clone().lock_owned().await
    }
}

impl Drop for IdempotencyStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_once(inner: &SeenMap, ttl: Duration) -> usize {
    let now = Instant::now();
    let mut map = inner.lock().await;
    let before = map.len();
    map.retain(|_, seen| now.duration_since(*seen) < ttl);
    before - map.len()
}

fn spawn_sweep(
    inner: SeenMap,
    ttl: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("idempotency sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = sweep_once(&inner, ttl).await;
                    if removed > 0 {
                        debug!(removed, "idempotency sweep evicted expired deliveries");
                    }
                }
            }
        }
    })
}
