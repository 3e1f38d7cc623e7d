//! Per-request trust pipeline for provider webhooks.
//!
//! Every delivery walks `Received → SignatureChecked → RateChecked →
//! DedupChecked` and ends `Accepted`, `Rejected` or `Duplicate`. The order is
//! fixed: unauthenticated garbage must not spend rate budget or occupy
//! idempotency slots under a spoofed identity, and dedup runs last so a
//! rejected request never claims a delivery id. Each check can be switched
//! off, but none can be reordered.

use anyhow::anyhow;
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::security::audit_log::AuditLogger;
use crate::security::idempotency::{ClaimOutcome, IdempotencyStore};
use crate::security::rate_limit::{GateSet, RateDenied, RateGate, RateScope};
use crate::security::signature;
use crate::webhook::extract::{ExtractionPlan, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Missing or invalid signatures are rejected.
    Enforcing,
    /// Signature failures are logged and the delivery continues. Meant for
    /// pre-production and for setups where the secret is not configured yet.
    Permissive,
}

impl std::str::FromStr for GuardMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforcing" | "enforce" | "strict" => Ok(GuardMode::Enforcing),
            "permissive" | "log" | "off" => Ok(GuardMode::Permissive),
            other => Err(anyhow!("unknown guard mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStage {
    Received,
    SignatureChecked,
    RateChecked,
    DedupChecked,
}

/// Which checks run. Disabling one skips it; it never changes the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardChecks {
    pub signature: bool,
    pub rate_limit: bool,
    pub dedup: bool,
}

impl Default for GuardChecks {
    fn default() -> Self {
        Self {
            signature: true,
            rate_limit: true,
            dedup: true,
        }
    }
}

/// One inbound webhook, captured before any structured parsing.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub path: String,
    pub source: String,
    pub body: Bytes,
    pub payload: Payload,
    pub signature: Option<String>,
    pub caller: Option<String>,
    pub delivery_id: Option<String>,
}

impl WebhookDelivery {
    pub fn capture(
        plan: &ExtractionPlan,
        path: impl Into<String>,
        source: impl Into<String>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let payload = Payload::parse(&body);
        Self {
            path: path.into(),
            source: source.into(),
            signature: plan.signature(headers, &payload),
            caller: plan.caller(headers, &payload),
            delivery_id: plan.delivery_id(headers, &payload),
            payload,
            body,
        }
    }

    /// Key for the per-identity gate. Falls back to the source address so an
    /// unidentifiable caller is still counted.
    pub fn identity_key(&self) -> &str {
        self.caller.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingSignature,
    InvalidSignature,
    RateLimited(RateDenied),
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingSignature => "MISSING_SIGNATURE",
            Rejection::InvalidSignature => "INVALID_SIGNATURE",
            Rejection::RateLimited(_) => "RATE_LIMITED",
        }
    }
}

/// Proof that a delivery passed the guard. Holds the claimed delivery id,
/// if any, so the claim can be rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    claimed_id: Option<String>,
}

impl Admission {
    pub fn claimed_id(&self) -> Option<&str> {
        self.claimed_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Accepted(Admission),
    Rejected(Rejection),
    Duplicate { delivery_id: String },
}

/// Outcome of running a handler behind the guard.
#[derive(Debug)]
pub enum Dispatch<T> {
    Handled(T),
    Rejected(Rejection),
    Duplicate,
    /// Handler failed; the claim has been rolled back.
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub struct WebhookGuard {
    mode: GuardMode,
    checks: GuardChecks,
    secret: Option<String>,
    gates: GateSet,
    idempotency: Arc<IdempotencyStore>,
    audit: AuditLogger,
}

impl WebhookGuard {
    pub fn new(
        mode: GuardMode,
        secret: Option<String>,
        checks: GuardChecks,
        gates: GateSet,
        idempotency: Arc<IdempotencyStore>,
    ) -> Self {
        Self {
            mode,
            checks,
            secret,
            gates,
            idempotency,
            audit: AuditLogger::new(),
        }
    }

    /// Per-identity then per-source gates, sized from configuration.
    pub fn gates_from_config(cfg: &Config) -> GateSet {
        let wh = &cfg.webhook;
        GateSet::new(vec![
            RateGate::new(
                RateScope::Identity,
                Duration::from_secs(wh.identity_window_secs),
                wh.identity_max,
            ),
            RateGate::new(
                RateScope::Source,
                Duration::from_secs(wh.source_window_secs),
                wh.source_max,
            ),
        ])
    }

    pub fn from_config(cfg: &Config, gates: GateSet, idempotency: Arc<IdempotencyStore>) -> Self {
        let checks = GuardChecks {
            signature: cfg.webhook.verify_signature,
            rate_limit: cfg.webhook.rate_limit,
            dedup: cfg.webhook.dedup,
        };
        Self::new(
            cfg.guard_mode(),
            cfg.webhook.secret.clone(),
            checks,
            gates,
            idempotency,
        )
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    fn enforcing(&self) -> bool {
        self.mode == GuardMode::Enforcing
    }

    fn check_signature(&self, delivery: &WebhookDelivery) -> Result<(), Rejection> {
        let enforced = self.enforcing();
        let presented = match delivery.signature.as_deref() {
            Some(sig) => sig,
            None => {
                self.audit
                    .signature_missing(&delivery.source, &delivery.path, enforced);
                return if enforced {
                    Err(Rejection::MissingSignature)
                } else {
                    Ok(())
                };
            }
        };
        let secret = self.secret.as_deref().unwrap_or("");
        if signature::verify(&delivery.body, presented, secret) {
            return Ok(());
        }
        self.audit
            .signature_invalid(&delivery.source, &delivery.path, enforced);
        if enforced {
            Err(Rejection::InvalidSignature)
        } else {
            Ok(())
        }
    }

    async fn check_rate(&self, delivery: &WebhookDelivery) -> Result<(), Rejection> {
        let identity = delivery.identity_key().to_string();
        let source = delivery.source.clone();
        let key_for = |scope: RateScope| match scope {
            RateScope::Source => source.clone(),
            _ => identity.clone(),
        };
        self.gates.check(key_for).await.map_err(|denied| {
            let key = match denied.scope {
                RateScope::Source => source.as_str(),
                _ => identity.as_str(),
            };
            self.audit
                .rate_limited(denied.scope.as_str(), key, &delivery.path);
            Rejection::RateLimited(denied)
        })
    }

    /// Run the checks in their fixed order.
    pub async fn admit(&self, delivery: &WebhookDelivery) -> GuardDecision {
        debug!(stage = ?GuardStage::Received, path = %delivery.path, "webhook received");

        if self.checks.signature {
            if let Err(rejection) = self.check_signature(delivery) {
                return GuardDecision::Rejected(rejection);
            }
        }
        debug!(stage = ?GuardStage::SignatureChecked, "signature stage passed");

        if self.checks.rate_limit {
            if let Err(rejection) = self.check_rate(delivery).await {
                return GuardDecision::Rejected(rejection);
            }
        }
        debug!(stage = ?GuardStage::RateChecked, "rate stage passed");

        let mut claimed_id = None;
        if self.checks.dedup {
            if let Some(id) = delivery.delivery_id.as_deref() {
                match self.idempotency.try_claim(id).await {
                    ClaimOutcome::Duplicate => {
                        self.audit.duplicate_delivery(id, &delivery.path);
                        return GuardDecision::Duplicate {
                            delivery_id: id.to_string(),
                        };
                    }
                    ClaimOutcome::Claimed => claimed_id = Some(id.to_string()),
                }
            }
        }
        debug!(stage = ?GuardStage::DedupChecked, "dedup stage passed");

        self.audit.delivery_accepted(
            delivery.delivery_id.as_deref(),
            delivery.caller.as_deref(),
            &delivery.path,
        );
        GuardDecision::Accepted(Admission { claimed_id })
    }

    /// Release a claim so the provider's retry is processed as new.
    pub async fn rollback(&self, admission: &Admission) {
        if let Some(id) = admission.claimed_id() {
            self.idempotency.rollback(id).await;
            debug!(delivery_id = id, "idempotency claim rolled back");
        }
    }

    /// Admit, then run `handler` only for accepted deliveries. A failing
    /// handler rolls the claim back before returning; so does a handler
    /// future that is dropped before completing.
    pub async fn dispatch<F, Fut, T>(&self, delivery: &WebhookDelivery, handler: F) -> Dispatch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let admission = match self.admit(delivery).await {
            GuardDecision::Accepted(admission) => admission,
            GuardDecision::Rejected(rejection) => return Dispatch::Rejected(rejection),
            GuardDecision::Duplicate { .. } => return Dispatch::Duplicate,
        };

        let mut pending = PendingClaim::new(self.idempotency.clone(), &admission);
        let result = handler().await;
        match result {
            Ok(value) => {
                pending.keep();
                Dispatch::Handled(value)
            }
            Err(err) => {
                // stays armed until the rollback lands, in case we are cancelled here
                self.rollback(&admission).await;
                pending.keep();
                self.audit.handler_failed(
                    delivery.delivery_id.as_deref(),
                    &delivery.path,
                    admission.claimed_id().is_some(),
                    &format!("{:#}", err),
                );
                Dispatch::Failed(err)
            }
        }
    }
}

/// Rolls a claim back if dropped while still armed, e.g. when the client
/// disconnects mid-handler and the request future is cancelled.
struct PendingClaim {
    store: Arc<IdempotencyStore>,
    id: Option<String>,
}

impl PendingClaim {
    fn new(store: Arc<IdempotencyStore>, admission: &Admission) -> Self {
        Self {
            store,
            id: admission.claimed_id.clone(),
        }
    }

    fn keep(&mut self) {
        self.id = None;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(delivery_id = %id, "webhook handler cancelled; claim rolled back");
                let store = self.store.clone();
                handle.spawn(async move {
                    store.rollback(&id).await;
                });
            }
            Err(_) => warn!(delivery_id = %id, "no runtime to roll back cancelled claim"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::signature::compute_signature_hex;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &str = "whsec_guard";

    struct Fixture {
        guard: WebhookGuard,
        identity: RateGate,
        store: Arc<IdempotencyStore>,
    }

    fn fixture(mode: GuardMode, checks: GuardChecks, identity_max: u32) -> Fixture {
        let identity = RateGate::new_per_minute(RateScope::Identity, identity_max);
        let source = RateGate::new_per_minute(RateScope::Source, 100);
        let store = Arc::new(IdempotencyStore::new(Duration::from_secs(600)));
        let guard = WebhookGuard::new(
            mode,
            Some(SECRET.to_string()),
            checks,
            GateSet::new(vec![identity.clone(), source]),
            store.clone(),
        );
        Fixture {
            guard,
            identity,
            store,
        }
    }

    fn delivery(body: &str, sig: Option<&str>, message_id: Option<&str>) -> WebhookDelivery {
        let mut headers = HeaderMap::new();
        if let Some(sig) = sig {
            headers.insert("x-telephony-signature", HeaderValue::from_str(sig).unwrap());
        }
        if let Some(id) = message_id {
            headers.insert("x-message-id", HeaderValue::from_str(id).unwrap());
        }
        WebhookDelivery::capture(
            &ExtractionPlan::default(),
            "/webhooks/sms",
            "10.1.1.1",
            &headers,
            Bytes::from(body.to_string()),
        )
    }

    fn signed(body: &str, message_id: Option<&str>) -> WebhookDelivery {
        let sig = compute_signature_hex(SECRET, body.as_bytes());
        delivery(body, Some(&sig), message_id)
    }

    const BODY: &str = r#"{"From":"+15551234567","Body":"Call me back"}"#;

    #[test]
    fn guard_mode_parses() {
        assert_eq!("Enforcing".parse::<GuardMode>().unwrap(), GuardMode::Enforcing);
        assert_eq!("permissive".parse::<GuardMode>().unwrap(), GuardMode::Permissive);
        assert!("sometimes".parse::<GuardMode>().is_err());
    }

    #[tokio::test]
    async fn signed_delivery_is_accepted_and_claimed() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = signed(BODY, Some("msg-1"));
        assert_eq!(d.caller.as_deref(), Some("+15551234567"));
        match f.guard.admit(&d).await {
            GuardDecision::Accepted(adm) => assert_eq!(adm.claimed_id(), Some("msg-1")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn bad_signature_consumes_no_rate_or_dedup_budget() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 1);
        let forged = delivery(BODY, Some("sha256=00"), Some("msg-2"));

        for _ in 0..5 {
            assert_eq!(
                f.guard.admit(&forged).await,
                GuardDecision::Rejected(Rejection::InvalidSignature)
            );
        }
        assert!(f.store.is_empty().await);
        // identity budget of one is still unspent
        assert!(f.identity.allow("+15551234567").await);
    }

    #[tokio::test]
    async fn missing_signature_rejected_when_enforcing() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = delivery(BODY, None, Some("msg-3"));
        let decision = f.guard.admit(&d).await;
        assert_eq!(decision, GuardDecision::Rejected(Rejection::MissingSignature));
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn permissive_mode_lets_unsigned_through() {
        let f = fixture(GuardMode::Permissive, GuardChecks::default(), 10);
        let unsigned = delivery(BODY, None, Some("msg-4"));
        assert!(matches!(f.guard.admit(&unsigned).await, GuardDecision::Accepted(_)));
        let forged = delivery(BODY, Some("sha256=00"), Some("msg-5"));
        assert!(matches!(f.guard.admit(&forged).await, GuardDecision::Accepted(_)));
    }

    #[tokio::test]
    async fn enforcing_without_secret_rejects_everything() {
        let store = Arc::new(IdempotencyStore::new(Duration::from_secs(600)));
        let guard = WebhookGuard::new(
            GuardMode::Enforcing,
            None,
            GuardChecks::default(),
            GateSet::default(),
            store,
        );
        let d = signed(BODY, None);
        assert_eq!(
            guard.admit(&d).await,
            GuardDecision::Rejected(Rejection::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn rate_limited_by_identity_then_source() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 2);
        assert!(matches!(
            f.guard.admit(&signed(BODY, None)).await,
            GuardDecision::Accepted(_)
        ));
        assert!(matches!(
            f.guard.admit(&signed(BODY, None)).await,
            GuardDecision::Accepted(_)
        ));
        match f.guard.admit(&signed(BODY, None)).await {
            GuardDecision::Rejected(Rejection::RateLimited(denied)) => {
                assert_eq!(denied.scope, RateScope::Identity);
                assert_eq!(denied.retry_after, Duration::from_secs(60));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unidentified_caller_is_gated_by_source_key() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 1);
        let anon = r#"{"Body":"no from field"}"#;
        let d = signed(anon, None);
        assert_eq!(d.identity_key(), "10.1.1.1");
        assert!(matches!(f.guard.admit(&d).await, GuardDecision::Accepted(_)));
        assert!(matches!(
            f.guard.admit(&d).await,
            GuardDecision::Rejected(Rejection::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_delivery_short_circuits() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = signed(BODY, Some("msg-42"));
        assert!(matches!(f.guard.admit(&d).await, GuardDecision::Accepted(_)));
        assert_eq!(
            f.guard.admit(&d).await,
            GuardDecision::Duplicate {
                delivery_id: "msg-42".to_string()
            }
        );
    }

    #[tokio::test]
    async fn disabled_checks_are_skipped() {
        let checks = GuardChecks {
            signature: false,
            rate_limit: false,
            dedup: false,
        };
        let f = fixture(GuardMode::Enforcing, checks, 1);
        let d = delivery(BODY, None, Some("msg-9"));
        for _ in 0..3 {
            match f.guard.admit(&d).await {
                GuardDecision::Accepted(adm) => assert_eq!(adm.claimed_id(), None),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn dispatch_runs_handler_once_per_delivery() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let calls = AtomicUsize::new(0);
        let d = signed(BODY, Some("msg-10"));

        let first = f
            .guard
            .dispatch(&d, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("stored")
            })
            .await;
        assert!(matches!(first, Dispatch::Handled("stored")));

        let second = f
            .guard
            .dispatch(&d, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("stored")
            })
            .await;
        assert!(matches!(second, Dispatch::Duplicate));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_claim() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = signed(BODY, Some("msg-11"));

        let failed: Dispatch<()> = f
            .guard
            .dispatch(&d, || async { Err(anyhow!("database unavailable")) })
            .await;
        assert!(matches!(failed, Dispatch::Failed(_)));
        assert!(f.store.is_empty().await);

        let retried = f.guard.dispatch(&d, || async { Ok(()) }).await;
        assert!(matches!(retried, Dispatch::Handled(())));
    }

    #[tokio::test]
    async fn cancelled_handler_releases_claim() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = signed(BODY, Some("msg-12"));

        let dispatch = f.guard.dispatch(&d, || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), dispatch).await;
        assert!(timed_out.is_err());

        // rollback runs on a spawned task
        for _ in 0..10 {
            if f.store.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn cancellation_during_failure_rollback_still_releases_claim() {
        let f = fixture(GuardMode::Enforcing, GuardChecks::default(), 10);
        let d = signed(BODY, Some("msg-13"));
        let held = std::sync::Mutex::new(None);

        // the handler fails while holding the store lock, so the rollback
        // that follows cannot finish before the timeout cancels dispatch
        let dispatch = f.guard.dispatch(&d, || async {
            let lock = f.store.hold_lock().await;
            *held.lock().unwrap() = Some(lock);
            Err::<(), _>(anyhow!("lead store unavailable"))
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), dispatch).await;
        assert!(timed_out.is_err());

        let lock = held.lock().unwrap().take();
        assert!(lock.is_some());
        drop(lock);

        for _ in 0..10 {
            if f.store.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.store.is_empty().await);
    }
}
