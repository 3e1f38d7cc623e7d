use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::security::tokens::TokenPair;

#[derive(Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionTokens { .. }")
    }
}

impl From<TokenPair> for SessionTokens {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }
}

/// Client-held credential pair with atomic swap and rotation tracking.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ClientSession {
    tokens: Arc<RwLock<Option<SessionTokens>>>,
    last_rotated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl ClientSession {
    pub fn new(tokens: SessionTokens) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(Some(tokens))),
            last_rotated: Arc::new(RwLock::new(Some(Utc::now()))),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.refresh_token.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.tokens.read().await.is_some()
    }

    /// Replace both tokens and record rotation time.
    pub async fn swap(&self, new_tokens: SessionTokens) {
        let mut tokens = self.tokens.write().await;
        *tokens = Some(new_tokens);
        drop(tokens);

        let mut last_rotated = self.last_rotated.write().await;
        *last_rotated = Some(Utc::now());
        debug!("session tokens rotated at {:?}", last_rotated);
    }

    /// Forget the session. Callers must log in again.
    pub async fn clear(&self) {
        let mut tokens = self.tokens.write().await;
        if tokens.take().is_some() {
            debug!("session cleared");
        }
    }

    pub async fn last_rotated(&self) -> Option<DateTime<Utc>> {
        *self.last_rotated.read().await
    }
}
