use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::webhook::guard::WebhookDelivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Sms,
    Voice,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Sms => "sms",
            WebhookKind::Voice => "voice",
        }
    }
}

/// Business processing behind the guard (lead creation, follow-up SMS).
///
/// Only called for accepted deliveries. Returned object fields are merged
/// into the `{"status":"ok"}` response. An `Err` rolls back the idempotency
/// claim and answers 500, so the provider retries.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, kind: WebhookKind, delivery: &WebhookDelivery) -> anyhow::Result<Value>;
}

/// Records deliveries and does nothing else.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

#[async_trait]
impl WebhookHandler for LoggingHandler {
    async fn handle(&self, kind: WebhookKind, delivery: &WebhookDelivery) -> anyhow::Result<Value> {
        info!(
            kind = kind.as_str(),
            caller = delivery.caller.as_deref().unwrap_or(""),
            delivery_id = delivery.delivery_id.as_deref().unwrap_or(""),
            bytes = delivery.body.len(),
            "webhook processed"
        );
        Ok(json!({}))
    }
}
