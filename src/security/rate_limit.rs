use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which key dimension a gate counts on. Surfaces in 429 bodies and audit logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateScope {
    Identity,
    Source,
    Auth,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Identity => "identity",
            RateScope::Source => "source",
            RateScope::Auth => "auth",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window counter keyed by an arbitrary string.
///
/// Approximates a sliding window: a caller can land up to 2x `max_events`
/// across a window boundary. Check and increment happen under one lock, so
/// concurrent callers can never both observe the last free slot.
#[derive(Debug, Clone)]
pub struct RateGate {
    scope: RateScope,
    window: Duration,
    max_events: u32,
    inner: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateGate {
    pub fn new(scope: RateScope, window: Duration, max_events: u32) -> Self {
        Self {
            scope,
            window,
            max_events,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn new_per_minute(scope: RateScope, max_events: u32) -> Self {
        Self::new(scope, Duration::from_secs(60), max_events)
    }

    pub fn scope(&self) -> RateScope {
        self.scope
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        let entry = map.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }
        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_events
    }

    /// Drop windows that have fully elapsed. Counters are rebuilt on demand,
    /// so this only bounds memory.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, w| now.duration_since(w.started) < window);
        before - map.len()
    }

    #[cfg(test)]
    pub(crate) async fn tracked_keys(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Rejection from a [`GateSet`]: which gate said no and how long to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDenied {
    pub scope: RateScope,
    pub retry_after: Duration,
}

/// Gates composed over one request. Admitted only if every gate admits.
///
/// Each entry pairs a gate with the key it should count for this request.
/// Gates are consulted in order and stop at the first refusal.
#[derive(Debug, Clone, Default)]
pub struct GateSet {
    gates: Vec<RateGate>,
}

impl GateSet {
    pub fn new(gates: Vec<RateGate>) -> Self {
        Self { gates }
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// A new set with `gate` appended. Gates are shared, not copied.
    pub fn with(&self, gate: RateGate) -> Self {
        let mut gates = self.gates.clone();
        gates.push(gate);
        Self { gates }
    }

    pub async fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for gate in &self.gates {
            purged += gate.purge_expired().await;
        }
        purged
    }

    pub async fn check<F>(&self, key_for: F) -> Result<(), RateDenied>
    where
        F: Fn(RateScope) -> String,
    {
        for gate in &self.gates {
            let key = key_for(gate.scope());
            if !gate.allow(&key).await {
                return Err(RateDenied {
                    scope: gate.scope(),
                    retry_after: gate.window(),
                });
            }
        }
        Ok(())
    }
}

/// Purge elapsed windows every `every` until `shutdown` fires.
pub fn spawn_purge(gates: GateSet, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = gates.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "rate windows purged");
                    }
                }
            }
        }
    })
}
