use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

use crate::security::tokens::TokenPair;
use crate::transport::refresh::{
    ApiCallError, ClientError, RefreshCoordinator, RefreshFailure, SessionError, TokenRefresher,
};
use crate::transport::session::ClientSession;

const EXPIRED_CODE: &str = "TOKEN_EXPIRED";

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("building http client")
}

/// Calls `POST /auth/refresh` on the ringback API.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    base_url: String,
    http: Client,
}

impl HttpTokenRefresher {
    pub fn new(base_url: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        let url = format!("{}/auth/refresh", self.base_url);
        debug!(url = %url, "requesting token refresh");
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .context("refresh send")?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let reason = body["error"].as_str().unwrap_or("refresh rejected").to_string();
            return Err(RefreshFailure::Rejected(reason));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("refresh returned {}: {}", status, text).into());
        }
        let pair: TokenPair = resp.json().await.context("decoding token pair")?;
        Ok(pair)
    }
}

/// Turn a response into JSON or a classified failure. 401 bodies carry a
/// `code` telling an expired token apart from an unusable one.
async fn classify(resp: Response) -> Result<Value, ApiCallError> {
    let status = resp.status();
    trace!(status = status.as_u16(), "api response");
    if status == StatusCode::UNAUTHORIZED {
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        return if body["code"].as_str() == Some(EXPIRED_CODE) {
            Err(ApiCallError::TokenExpired)
        } else {
            let reason = body["error"].as_str().unwrap_or("unauthorized").to_string();
            Err(ApiCallError::TokenRejected(reason))
        };
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiCallError::Status {
            status: status.as_u16(),
            body,
        });
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    resp.json::<Value>()
        .await
        .map_err(|e| ApiCallError::Transport(anyhow!(e).context("decoding response body")))
}

/// Authenticated API client. Expired access tokens are refreshed once,
/// behind a single-flight coordinator, and the request replayed.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
    coordinator: RefreshCoordinator<HttpTokenRefresher>,
}

impl ApiClient {
    pub fn new(base_url: &str, session: ClientSession, refresh_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = http_client(Duration::from_secs(30))?;
        let refresher = HttpTokenRefresher::new(base_url.clone(), http.clone());
        Ok(Self {
            base_url,
            http,
            coordinator: RefreshCoordinator::with_timeout(refresher, session, refresh_timeout),
        })
    }

    pub fn session(&self) -> &ClientSession {
        self.coordinator.session()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange credentials for a token pair and start a session.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .context("login send")?;
        if !resp.status().is_success() {
            return Err(anyhow!("login failed with status {}", resp.status()));
        }
        let pair: TokenPair = resp.json().await.context("decoding token pair")?;
        self.session().swap(pair.clone().into()).await;
        Ok(pair)
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        let url = self.url(path);
        self.coordinator
            .execute(|token| {
                let req = self
                    .http
                    .get(&url)
                    .header(AUTHORIZATION, format!("Bearer {}", token));
                async move {
                    let resp = req.send().await.context("get send")?;
                    classify(resp).await
                }
            })
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Value, ClientError> {
        let url = self.url(path);
        let payload = serde_json::to_vec(body)
            .map_err(|e| ClientError::Call(ApiCallError::Transport(anyhow!(e))))?;
        self.coordinator
            .execute(|token| {
                let req = self
                    .http
                    .post(&url)
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.clone());
                async move {
                    let resp = req.send().await.context("post send")?;
                    classify(resp).await
                }
            })
            .await
    }

    /// Revoke the server-side refresh token and drop the local session.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let result = self.post_json("/auth/logout", &json!({})).await;
        self.session().clear().await;
        match result {
            Ok(_) | Err(ClientError::Session(SessionError::NoSession)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
