//! Client-side single-flight token refresh.
//!
//! When many in-flight requests see "access token expired" at once, exactly
//! one refresh call goes out. Callers arriving while it runs queue a oneshot
//! continuation and are all released with the same result. The refresh runs
//! on its own task, so a cancelled caller cannot leave the coordinator stuck
//! in `Refreshing`, and it is bounded by a timeout.
//!
//! The mutex only guards the idle/refreshing decision and the waiter list;
//! it is never held across the network call, so requests whose tokens are
//! still valid are unaffected.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::security::tokens::TokenPair;
use crate::transport::session::ClientSession;

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal outcomes for a client session. `Clone` so every queued caller
/// receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no active session")]
    NoSession,
    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),
    #[error("token refresh timed out after {0:?}")]
    RefreshTimeout(Duration),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("access token rejected: {0}")]
    AccessRejected(String),
}

/// What a refresh call reports back.
#[derive(Debug, Error)]
pub enum RefreshFailure {
    /// Refresh token invalid, expired or revoked.
    #[error("refresh token rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// How an authenticated API call failed. Only `TokenExpired` triggers a refresh.
#[derive(Debug, Error)]
pub enum ApiCallError {
    #[error("access token expired")]
    TokenExpired,
    #[error("access token rejected: {0}")]
    TokenRejected(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Call(ApiCallError),
}

impl ClientError {
    /// The session is gone and the user must authenticate again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ClientError::Session(e) if !matches!(e, SessionError::RefreshTimeout(_))
        )
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure>;
}

type Waiter = oneshot::Sender<Result<String, SessionError>>;

#[derive(Debug)]
enum FlightState {
    Idle,
    Refreshing(Vec<Waiter>),
}

#[derive(Debug)]
struct Flight {
    phase: FlightState,
    /// Last successful refresh as (replaced, issued) access tokens. Lets a
    /// caller that lost the race with a finished refresh reuse its result.
    last_rotation: Option<(String, String)>,
}

struct Inner<R> {
    refresher: R,
    session: ClientSession,
    state: Mutex<Flight>,
    timeout: Duration,
}

pub struct RefreshCoordinator<R: TokenRefresher> {
    inner: Arc<Inner<R>>,
}

impl<R: TokenRefresher> Clone for RefreshCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: TokenRefresher> std::fmt::Debug for RefreshCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl<R: TokenRefresher> Inner<R> {
    fn lock_state(&self) -> MutexGuard<'_, Flight> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run_refresh(&self) -> Result<String, SessionError> {
        let refresh_token = match self.session.refresh_token().await {
            Some(token) => token,
            None => return Err(SessionError::NoSession),
        };

        match tokio::time::timeout(self.timeout, self.refresher.refresh(&refresh_token)).await {
            Ok(Ok(pair)) => {
                let access = pair.access_token.clone();
                self.session.swap(pair.into()).await;
                info!("access token refreshed");
                Ok(access)
            }
            Ok(Err(RefreshFailure::Rejected(reason))) => {
                warn!(reason = %reason, "refresh token rejected; clearing session");
                self.session.clear().await;
                Err(SessionError::RefreshRejected(reason))
            }
            Ok(Err(RefreshFailure::Transport(err))) => {
                warn!(error = %err, "token refresh failed; clearing session");
                self.session.clear().await;
                Err(SessionError::RefreshFailed(format!("{:#}", err)))
            }
            Err(_) => {
                // Tokens are kept: the refresh token may still be good, and
                // each caller decides whether to send the user to login.
                warn!(timeout = ?self.timeout, "token refresh timed out");
                Err(SessionError::RefreshTimeout(self.timeout))
            }
        }
    }
}

impl<R: TokenRefresher> RefreshCoordinator<R> {
    pub fn new(refresher: R, session: ClientSession) -> Self {
        Self::with_timeout(refresher, session, DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn with_timeout(refresher: R, session: ClientSession, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                session,
                state: Mutex::new(Flight {
                    phase: FlightState::Idle,
                    last_rotation: None,
                }),
                timeout,
            }),
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.inner.session
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.lock_state().phase, FlightState::Refreshing(_))
    }

    /// A fresh access token after `stale` was reported expired.
    ///
    /// If the session already holds a different token, a refresh finished in
    /// the meantime and that token is returned. Otherwise the caller joins
    /// the in-flight refresh or starts one.
    pub async fn refreshed_token(&self, stale: &str) -> Result<String, SessionError> {
        match self.inner.session.access_token().await {
            None => return Err(SessionError::NoSession),
            Some(current) if current != stale => return Ok(current),
            Some(_) => {}
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock_state();
            let flight = &mut *guard;
            match &mut flight.phase {
                FlightState::Refreshing(waiters) => {
                    debug!(queued = waiters.len() + 1, "refresh in flight; queuing caller");
                    waiters.push(tx);
                }
                FlightState::Idle => {
                    if let Some((replaced, issued)) = &flight.last_rotation {
                        if replaced == stale {
                            return Ok(issued.clone());
                        }
                    }
                    flight.phase = FlightState::Refreshing(vec![tx]);
                    self.spawn_refresh(stale.to_string());
                }
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(SessionError::RefreshFailed(
                "refresh task aborted".to_string(),
            ))
        })
    }

    fn spawn_refresh(&self, stale: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.run_refresh().await;
            let waiters = {
                let mut guard = inner.lock_state();
                let flight = &mut *guard;
                if let Ok(token) = &outcome {
                    flight.last_rotation = Some((stale, token.clone()));
                }
                match std::mem::replace(&mut flight.phase, FlightState::Idle) {
                    FlightState::Refreshing(waiters) => waiters,
                    FlightState::Idle => Vec::new(),
                }
            };
            debug!(released = waiters.len(), ok = outcome.is_ok(), "refresh settled");
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        });
    }

    /// Run `op` with the current access token. On `TokenExpired` it waits for
    /// (or leads) a single refresh and replays `op` once with the new token.
    /// Any other authentication failure clears the session without refreshing.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiCallError>>,
    {
        let session = &self.inner.session;
        let token = session.access_token().await.ok_or(SessionError::NoSession)?;

        match op(token.clone()).await {
            Ok(value) => Ok(value),
            Err(ApiCallError::TokenExpired) => {
                let fresh = self.refreshed_token(&token).await?;
                match op(fresh).await {
                    Ok(value) => Ok(value),
                    Err(ApiCallError::TokenExpired) => {
                        session.clear().await;
                        Err(SessionError::AccessRejected(
                            "token expired again after refresh".to_string(),
                        )
                        .into())
                    }
                    Err(ApiCallError::TokenRejected(reason)) => {
                        session.clear().await;
                        Err(SessionError::AccessRejected(reason).into())
                    }
                    Err(other) => Err(ClientError::Call(other)),
                }
            }
            Err(ApiCallError::TokenRejected(reason)) => {
                session.clear().await;
                Err(SessionError::AccessRejected(reason).into())
            }
            Err(other) => Err(ClientError::Call(other)),
        }
    }
}
