use tracing::{error, info, warn};

/// Security-relevant decisions, emitted on the `audit` target.
///
/// Never pass secrets, presented signatures or token values here.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn signature_missing(&self, source_ip: &str, path: &str, enforced: bool) {
        warn!(target: "audit", event = "signature_missing", source_ip, path, enforced);
    }

    pub fn signature_invalid(&self, source_ip: &str, path: &str, enforced: bool) {
        warn!(target: "audit", event = "signature_invalid", source_ip, path, enforced);
    }

    pub fn rate_limited(&self, scope: &str, key: &str, path: &str) {
        warn!(target: "audit", event = "rate_limited", scope, key, path);
    }

    pub fn duplicate_delivery(&self, delivery_id: &str, path: &str) {
        info!(target: "audit", event = "duplicate_delivery", delivery_id, path);
    }

    pub fn delivery_accepted(&self, delivery_id: Option<&str>, caller: Option<&str>, path: &str) {
        info!(
            target: "audit",
            event = "delivery_accepted",
            delivery_id = delivery_id.unwrap_or(""),
            caller = caller.unwrap_or(""),
            path
        );
    }

    pub fn handler_failed(
        &self,
        delivery_id: Option<&str>,
        path: &str,
        rolled_back: bool,
        error_msg: &str,
    ) {
        error!(
            target: "audit",
            event = "handler_failed",
            delivery_id = delivery_id.unwrap_or(""),
            path,
            rolled_back,
            error = error_msg
        );
    }

    pub fn login_failed(&self, username: &str, source_ip: &str) {
        warn!(target: "audit", event = "login_failed", username, source_ip);
    }

    pub fn token_issued(&self, principal_id: &str, source_ip: &str) {
        info!(target: "audit", event = "token_issued", principal_id, source_ip);
    }

    pub fn token_refreshed(&self, principal_id: &str, source_ip: &str) {
        info!(target: "audit", event = "token_refreshed", principal_id, source_ip);
    }

    pub fn refresh_rejected(&self, source_ip: &str) {
        warn!(target: "audit", event = "refresh_rejected", source_ip);
    }

    pub fn token_revoked(&self, principal_id: &str) {
        info!(target: "audit", event = "token_revoked", principal_id);
    }

    pub fn access_denied(&self, code: &str, path: &str) {
        warn!(target: "audit", event = "access_denied", code, path);
    }

    pub fn internal_error(&self, path: &str, error_msg: &str) {
        error!(target: "audit", event = "internal_error", path, error = error_msg);
    }
}
