use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A persisted refresh token. At most one per principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRefreshToken {
    pub principal_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Persistence seam for refresh tokens. The relational store lives outside
/// this crate; implementations must make `upsert` replace any prior token for
/// the same principal.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn upsert(&self, record: StoredRefreshToken) -> anyhow::Result<()>;
    async fn find_by_token(&self, token: &str) -> anyhow::Result<Option<StoredRefreshToken>>;
    /// Returns whether a token was removed.
    async fn delete(&self, principal_id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
struct Tables {
    by_principal: HashMap<String, StoredRefreshToken>,
    // token value -> principal id
    by_token: HashMap<String, String>,
}

/// In-memory store (replace with the database-backed store in production).
#[derive(Debug, Clone, Default)]
pub struct InMemoryRefreshStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRefreshStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.by_principal.len()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshStore {
    async fn upsert(&self, record: StoredRefreshToken) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(previous) = tables.by_principal.remove(&record.principal_id) {
            tables.by_token.remove(&previous.token);
        }
        tables
            .by_token
            .insert(record.token.clone(), record.principal_id.clone());
        tables
            .by_principal
            .insert(record.principal_id.clone(), record);
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> anyhow::Result<Option<StoredRefreshToken>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_token
            .get(token)
            .and_then(|principal| tables.by_principal.get(principal))
            .cloned())
    }

    async fn delete(&self, principal_id: &str) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.by_principal.remove(principal_id) {
            Some(previous) => {
                tables.by_token.remove(&previous.token);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
