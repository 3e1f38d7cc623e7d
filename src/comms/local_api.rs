use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::security::audit_log::AuditLogger;
use crate::security::credentials::{CredentialVerifier, StaticCredentials};
use crate::security::idempotency::IdempotencyStore;
use crate::security::rate_limit::{spawn_purge, GateSet, RateDenied, RateGate, RateScope};
use crate::security::refresh_store::{InMemoryRefreshStore, RefreshTokenStore};
use crate::security::tokens::{AccessClaims, TokenError, TokenIssuer};
use crate::webhook::extract::ExtractionPlan;
use crate::webhook::guard::{Dispatch, Rejection, WebhookDelivery, WebhookGuard};
use crate::webhook::handler::{LoggingHandler, WebhookHandler, WebhookKind};

pub type SharedState = Arc<AppState>;

// Extract client IP from ConnectInfo, proxy headers, or fall back to 127.0.0.1
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }

        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                // first hop is the original client
                let ip = s.split(',').next().unwrap_or(s).trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }
        if let Some(real_ip) = parts.headers.get("x-real-ip") {
            if let Ok(s) = real_ip.to_str() {
                let ip = s.trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }

        Ok(ClientIp("127.0.0.1".to_string()))
    }
}

pub struct AppState {
    pub config: Arc<Config>,
    pub guard: WebhookGuard,
    pub plan: ExtractionPlan,
    pub handler: Arc<dyn WebhookHandler>,
    pub issuer: TokenIssuer,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub auth_gate: RateGate,
    /// Every gate, for periodic purging.
    pub all_gates: GateSet,
    pub audit: AuditLogger,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("guard", &self.guard)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// In-memory refresh store, operator credentials from config, logging handler.
    /// Must be called inside a tokio runtime (starts the idempotency sweep).
    pub fn new(config: Arc<Config>) -> Self {
        let credentials = StaticCredentials::new(
            config.auth.username.clone(),
            config.auth.password.clone(),
            config.auth.principal_id.clone(),
        );
        Self::with_collaborators(
            config,
            Arc::new(LoggingHandler),
            Arc::new(InMemoryRefreshStore::new()),
            Arc::new(credentials),
        )
    }

    pub fn with_collaborators(
        config: Arc<Config>,
        handler: Arc<dyn WebhookHandler>,
        refresh_store: Arc<dyn RefreshTokenStore>,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let signing_secret = match &config.tokens.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                let mut key = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                key
            }
        };
        let issuer = TokenIssuer::new(
            &signing_secret,
            Duration::from_secs(config.tokens.access_ttl_secs),
            Duration::from_secs(config.tokens.refresh_ttl_secs),
            refresh_store,
        );

        let webhook_gates = WebhookGuard::gates_from_config(&config);
        let auth_gate = RateGate::new(
            RateScope::Auth,
            Duration::from_secs(config.auth.rate_window_secs),
            config.auth.rate_max,
        );
        let all_gates = webhook_gates.with(auth_gate.clone());

        let idempotency = Arc::new(IdempotencyStore::new(config.webhook.idempotency_ttl()));
        let guard = WebhookGuard::from_config(&config, webhook_gates, idempotency);

        Self {
            config,
            guard,
            plan: ExtractionPlan::default(),
            handler,
            issuer,
            credentials,
            auth_gate,
            all_gates,
            audit: AuditLogger::new(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn error_json(status: StatusCode, error: &str, code: Option<&str>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.map(str::to_string),
        }),
    )
        .into_response()
}

fn rate_limited(denied: RateDenied) -> Response {
    let secs = denied.retry_after.as_secs().max(1);
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(json!({
            "error": "too many requests",
            "scope": denied.scope,
            "retryAfter": secs,
        })),
    )
        .into_response()
}

fn rejection_response(rejection: Rejection) -> Response {
    match rejection {
        Rejection::MissingSignature => {
            error_json(StatusCode::FORBIDDEN, "missing signature", Some(rejection.reason()))
        }
        Rejection::InvalidSignature => {
            error_json(StatusCode::FORBIDDEN, "invalid signature", Some(rejection.reason()))
        }
        Rejection::RateLimited(denied) => rate_limited(denied),
    }
}

/// Bearer access token, verified. Rejects with 401 and a `code` that tells
/// clients whether refreshing can help.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AccessClaims);

pub struct AuthRejection {
    code: &'static str,
    message: String,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        error_json(StatusCode::UNAUTHORIZED, &self.message, Some(self.code))
    }
}

impl FromRequestParts<SharedState> for Authenticated {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            state.audit.access_denied("TOKEN_MISSING", &path);
            return Err(AuthRejection {
                code: "TOKEN_MISSING",
                message: "missing bearer token".to_string(),
            });
        };
        state.issuer.verify_access(token).map(Authenticated).map_err(|err: TokenError| {
            state.audit.access_denied(err.code(), &path);
            AuthRejection {
                code: err.code(),
                message: err.to_string(),
            }
        })
    }
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_webhook(
    state: &AppState,
    kind: WebhookKind,
    path: &str,
    source: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = WebhookDelivery::capture(&state.plan, path, source, &headers, body);
    let handler = state.handler.clone();

    match state
        .guard
        .dispatch(&delivery, || handler.handle(kind, &delivery))
        .await
    {
        Dispatch::Handled(extra) => {
            let mut body = json!({"status": "ok"});
            if let (Value::Object(extra), Some(out)) = (extra, body.as_object_mut()) {
                for (k, v) in extra {
                    if k != "status" {
                        out.insert(k, v);
                    }
                }
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Dispatch::Duplicate => (
            StatusCode::OK,
            Json(json!({"status": "ok", "action": "duplicate_skipped"})),
        )
            .into_response(),
        Dispatch::Rejected(rejection) => rejection_response(rejection),
        Dispatch::Failed(_) => {
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "handler_failed", None)
        }
    }
}

// Inbound SMS (patient replies)
async fn sms_webhook(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&state, WebhookKind::Sms, "/webhooks/sms", ip, headers, body).await
}

// Call status (missed calls)
async fn voice_webhook(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&state, WebhookKind::Voice, "/webhooks/voice", ip, headers, body).await
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

async fn login_handler(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> Response {
    if !state.auth_gate.allow(&ip).await {
        state.audit.rate_limited(RateScope::Auth.as_str(), &ip, "/auth/login");
        return rate_limited(RateDenied {
            scope: RateScope::Auth,
            retry_after: state.auth_gate.window(),
        });
    }

    let principal = match state.credentials.verify(&req.username, &req.password).await {
        Ok(Some(principal)) => principal,
        Ok(None) => {
            state.audit.login_failed(&req.username, &ip);
            return error_json(StatusCode::UNAUTHORIZED, "Invalid credentials", None);
        }
        Err(e) => {
            state.audit.internal_error("/auth/login", &format!("{:#}", e));
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error", None);
        }
    };

    match state.issuer.issue_pair(&principal).await {
        Ok(pair) => {
            state.audit.token_issued(&principal, &ip);
            (StatusCode::OK, Json(pair)).into_response()
        }
        Err(e) => {
            state.audit.internal_error("/auth/login", &format!("{:#}", e));
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error", None)
        }
    }
}

async fn refresh_handler(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<RefreshRequest>,
) -> Response {
    if !state.auth_gate.allow(&ip).await {
        state.audit.rate_limited(RateScope::Auth.as_str(), &ip, "/auth/refresh");
        return rate_limited(RateDenied {
            scope: RateScope::Auth,
            retry_after: state.auth_gate.window(),
        });
    }

    match state.issuer.rotate(&req.refresh_token).await {
        Ok(Some((principal, pair))) => {
            state.audit.token_refreshed(&principal, &ip);
            (StatusCode::OK, Json(pair)).into_response()
        }
        Ok(None) => {
            state.audit.refresh_rejected(&ip);
            error_json(
                StatusCode::UNAUTHORIZED,
                "refresh token invalid or expired",
                Some("REFRESH_INVALID"),
            )
        }
        Err(e) => {
            state.audit.internal_error("/auth/refresh", &format!("{:#}", e));
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error", None)
        }
    }
}

async fn logout_handler(
    State(state): State<SharedState>,
    Authenticated(claims): Authenticated,
) -> Response {
    match state.issuer.revoke(&claims.sub).await {
        Ok(_) => {
            state.audit.token_revoked(&claims.sub);
            Json(json!({"status": "logged out"})).into_response()
        }
        Err(e) => {
            state.audit.internal_error("/auth/logout", &format!("{:#}", e));
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error", None)
        }
    }
}

async fn session_handler(Authenticated(claims): Authenticated) -> impl IntoResponse {
    let expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .map(|t| t.to_rfc3339());
    Json(json!({
        "principalId": claims.sub,
        "expiresAt": expires_at,
    }))
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/sms", post(sms_webhook))
        .route("/webhooks/voice", post(voice_webhook))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/api/v1/session", get(session_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }
}

/// Serve on an already-bound listener until `cancel` fires or Ctrl+C.
pub async fn serve_on(
    config: Config,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    config.log_warnings();
    let state = Arc::new(AppState::new(Arc::new(config)));
    info!(mode = ?state.guard.mode(), "webhook guard configured");

    let purge_every = Duration::from_secs(state.config.webhook.source_window_secs.max(30));
    let purge = spawn_purge(state.all_gates.clone(), purge_every, cancel.clone());

    let app = create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let addr = listener.local_addr().context("reading listener address")?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("http server")?;

    cancel.cancel();
    let _ = purge.await;
    state.guard.idempotency().close().await;
    debug!("background tasks stopped");
    Ok(())
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    serve_on(config, listener, CancellationToken::new()).await
}
