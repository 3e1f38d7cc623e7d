use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use ringback::comms::local_api::{create_router, AppState};
use ringback::config::{Config, Environment};
use ringback::security::credentials::StaticCredentials;
use ringback::security::refresh_store::InMemoryRefreshStore;
use ringback::security::signature::compute_signature_hex;
use ringback::webhook::{WebhookDelivery, WebhookHandler, WebhookKind};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "whsec_test_secret";
const CALLER: &str = "+15551234567";

#[derive(Default)]
struct RecordingHandler {
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

#[async_trait]
impl WebhookHandler for RecordingHandler {
    async fn handle(&self, kind: WebhookKind, delivery: &WebhookDelivery) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("lead store unavailable");
        }
        Ok(json!({
            "leadId": format!("lead-{}", n),
            "kind": kind.as_str(),
            "caller": delivery.caller,
        }))
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.webhook.secret = Some(SECRET.to_string());
    cfg.tokens.signing_secret = Some("jwt-test-secret".to_string());
    cfg
}

fn router_with(cfg: Config, handler: Arc<RecordingHandler>) -> Router {
    let state = AppState::with_collaborators(
        Arc::new(cfg),
        handler,
        Arc::new(InMemoryRefreshStore::new()),
        Arc::new(StaticCredentials::new("admin", "admin", "operator")),
    );
    create_router(Arc::new(state))
}

fn sms_body(message_id: &str) -> String {
    json!({"MessageSid": message_id, "From": CALLER, "Body": "Can you call me back?"}).to_string()
}

async fn post(app: &Router, path: &str, body: &str, signature: Option<&str>) -> Response {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(sig) = signature {
        req = req.header("x-telephony-signature", sig);
    }
    app.clone()
        .oneshot(req.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

async fn post_signed(app: &Router, path: &str, body: &str) -> Response {
    let sig = compute_signature_hex(SECRET, body.as_bytes());
    post(app, path, body, Some(&sig)).await
}

async fn json_body(resp: Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let app = router_with(test_config(), Arc::default());
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unsigned_delivery_is_forbidden() {
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(test_config(), handler.clone());

    let resp = post(&app, "/webhooks/sms", &sms_body("msg-1"), None).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = json_body(resp).await;
    assert_eq!(body["code"], "MISSING_SIGNATURE");

    let resp = post(&app, "/webhooks/sms", &sms_body("msg-1"), Some("sha256=deadbeef")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(resp).await["code"], "INVALID_SIGNATURE");

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn signed_delivery_runs_handler_and_merges_fields() {
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(test_config(), handler.clone());

    let resp = post_signed(&app, "/webhooks/voice", &sms_body("call-1")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["leadId"], "lead-1");
    assert_eq!(body["kind"], "voice");
    assert_eq!(body["caller"], CALLER);
}

#[tokio::test]
async fn provider_retry_is_acknowledged_without_reprocessing() {
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(test_config(), handler.clone());
    let body = sms_body("msg-42");

    let first = post_signed(&app, "/webhooks/sms", &body).await;
    assert_eq!(first.status(), StatusCode::OK);

    let retry = post_signed(&app, "/webhooks/sms", &body).await;
    assert_eq!(retry.status(), StatusCode::OK);
    let retry_body = json_body(retry).await;
    assert_eq!(retry_body["status"], "ok");
    assert_eq!(retry_body["action"], "duplicate_skipped");

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn form_encoded_deliveries_are_deduplicated() {
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(test_config(), handler.clone());
    let body = "MessageSid=SM123&From=%2B15551234567&Body=hello";
    let sig = compute_signature_hex(SECRET, body.as_bytes());

    for _ in 0..3 {
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/sms")
            .header("content-type", "application/x-www-form-urlencoded")
            .header("x-telephony-signature", sig.as_str())
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn flooding_caller_gets_429_with_retry_after() {
    let mut cfg = test_config();
    cfg.webhook.identity_max = 2;
    let app = router_with(cfg, Arc::default());

    for id in ["m-1", "m-2"] {
        let resp = post_signed(&app, "/webhooks/sms", &sms_body(id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = post_signed(&app, "/webhooks/sms", &sms_body("m-3")).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "60");
    let body = json_body(resp).await;
    assert_eq!(body["scope"], "identity");
    assert_eq!(body["retryAfter"], 60);
}

#[tokio::test]
async fn forged_requests_do_not_spend_rate_budget() {
    let mut cfg = test_config();
    cfg.webhook.identity_max = 1;
    cfg.webhook.source_max = 1;
    let app = router_with(cfg, Arc::default());

    for _ in 0..5 {
        let resp = post(&app, "/webhooks/sms", &sms_body("m-x"), Some("sha256=00ff")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    let resp = post_signed(&app, "/webhooks/sms", &sms_body("m-x")).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_handler_lets_provider_retry() {
    let handler = Arc::new(RecordingHandler::default());
    handler.fail_next.store(true, Ordering::SeqCst);
    let app = router_with(test_config(), handler.clone());
    let body = sms_body("msg-77");

    let resp = post_signed(&app, "/webhooks/sms", &body).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(resp).await["error"], "handler_failed");

    let retry = post_signed(&app, "/webhooks/sms", &body).await;
    assert_eq!(retry.status(), StatusCode::OK);
    let retry_body = json_body(retry).await;
    assert_eq!(retry_body["status"], "ok");
    assert!(retry_body.get("action").is_none());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn development_without_secret_is_permissive() {
    let mut cfg = test_config();
    cfg.webhook.secret = None;
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(cfg, handler.clone());

    let resp = post(&app, "/webhooks/sms", &sms_body("msg-dev"), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn production_without_secret_rejects_everything() {
    let mut cfg = test_config();
    cfg.webhook.secret = None;
    cfg.environment = Environment::Production;
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(cfg, handler.clone());

    let sig = compute_signature_hex("whatever", sms_body("msg-prod").as_bytes());
    let resp = post(&app, "/webhooks/sms", &sms_body("msg-prod"), Some(&sig)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rewritten_message_id_header_does_not_bypass_dedup() {
    let handler = Arc::new(RecordingHandler::default());
    let app = router_with(test_config(), handler.clone());
    let body = json!({"MessageSid": "SM-1", "From": CALLER}).to_string();
    let sig = compute_signature_hex(SECRET, body.as_bytes());

    let mut actions = Vec::new();
    for i in 0..3 {
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/sms")
            .header("content-type", "application/json")
            .header("x-telephony-signature", sig.as_str())
            .header("x-message-id", format!("resent-{}", i))
            .body(Body::from(body.clone()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        actions.push(json_body(resp).await["action"].clone());
    }

    assert_eq!(actions[0], Value::Null);
    assert_eq!(actions[1], "duplicate_skipped");
    assert_eq!(actions[2], "duplicate_skipped");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}
