use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::{error, warn};

use crate::webhook::guard::GuardMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(anyhow!("unknown environment '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    /// Explicit mode. When unset it is derived from `secret` and the environment.
    pub mode: Option<GuardMode>,
    pub verify_signature: bool,
    pub rate_limit: bool,
    pub dedup: bool,
    pub identity_window_secs: u64,
    pub identity_max: u32,
    pub source_window_secs: u64,
    pub source_max: u32,
    pub idempotency_ttl_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            mode: None,
            verify_signature: true,
            rate_limit: true,
            dedup: true,
            identity_window_secs: 60,
            identity_max: 10,
            source_window_secs: 60,
            source_max: 300,
            idempotency_ttl_secs: 600,
        }
    }
}

impl WebhookConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub signing_secret: Option<String>,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub principal_id: String,
    pub rate_max: u32,
    pub rate_window_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
            principal_id: "operator".to_string(),
            rate_max: 20,
            rate_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub webhook: WebhookConfig,
    pub tokens: TokenConfig,
    pub auth: AuthConfig,
}

/// One day.
pub const MAX_ACCESS_TTL_SECS: u64 = 24 * 60 * 60;
/// One year.
pub const MAX_REFRESH_TTL_SECS: u64 = 365 * 24 * 60 * 60;

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw))
}

fn non_empty(raw: String) -> Option<String> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(raw)
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON config")?;
        Ok(cfg)
    }

    /// Optional JSON file, then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RINGBACK_ENV") {
            self.environment = v.parse()?;
        }

        let wh = &mut self.webhook;
        if let Some(v) = lookup("WEBHOOK_SECRET") {
            wh.secret = non_empty(v);
        }
        if let Some(v) = lookup("WEBHOOK_GUARD_MODE") {
            wh.mode = Some(v.parse()?);
        }
        if let Some(v) = lookup("WEBHOOK_VERIFY_SIGNATURE") {
            wh.verify_signature = parse_bool("WEBHOOK_VERIFY_SIGNATURE", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_RATE_LIMIT") {
            wh.rate_limit = parse_bool("WEBHOOK_RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_DEDUP") {
            wh.dedup = parse_bool("WEBHOOK_DEDUP", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_IDENTITY_WINDOW_SECS") {
            wh.identity_window_secs = parse_num("WEBHOOK_IDENTITY_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_IDENTITY_MAX") {
            wh.identity_max = parse_num("WEBHOOK_IDENTITY_MAX", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_SOURCE_WINDOW_SECS") {
            wh.source_window_secs = parse_num("WEBHOOK_SOURCE_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_SOURCE_MAX") {
            wh.source_max = parse_num("WEBHOOK_SOURCE_MAX", &v)?;
        }
        if let Some(v) = lookup("IDEMPOTENCY_TTL_SECS") {
            wh.idempotency_ttl_secs = parse_num("IDEMPOTENCY_TTL_SECS", &v)?;
        }

        let tk = &mut self.tokens;
        if let Some(v) = lookup("JWT_SECRET") {
            tk.signing_secret = non_empty(v);
        }
        if let Some(v) = lookup("ACCESS_TOKEN_TTL_SECS") {
            tk.access_ttl_secs = parse_num("ACCESS_TOKEN_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("REFRESH_TOKEN_TTL_SECS") {
            tk.refresh_ttl_secs = parse_num("REFRESH_TOKEN_TTL_SECS", &v)?;
        }

        let au = &mut self.auth;
        if let Some(v) = lookup("RINGBACK_USERNAME") {
            au.username = v;
        }
        if let Some(v) = lookup("RINGBACK_PASSWORD") {
            au.password = v;
        }
        if let Some(v) = lookup("AUTH_RATE_MAX") {
            au.rate_max = parse_num("AUTH_RATE_MAX", &v)?;
        }
        if let Some(v) = lookup("AUTH_RATE_WINDOW_SECS") {
            au.rate_window_secs = parse_num("AUTH_RATE_WINDOW_SECS", &v)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let wh = &self.webhook;
        if wh.identity_window_secs == 0 || wh.source_window_secs == 0 {
            return Err(anyhow!("rate windows must be at least one second"));
        }
        if wh.idempotency_ttl_secs == 0 {
            return Err(anyhow!("IDEMPOTENCY_TTL_SECS must be positive"));
        }
        let tk = &self.tokens;
        if tk.access_ttl_secs == 0 || tk.refresh_ttl_secs == 0 {
            return Err(anyhow!("token TTLs must be positive"));
        }
        if tk.access_ttl_secs > MAX_ACCESS_TTL_SECS {
            return Err(anyhow!(
                "ACCESS_TOKEN_TTL_SECS must be at most {}",
                MAX_ACCESS_TTL_SECS
            ));
        }
        if tk.refresh_ttl_secs > MAX_REFRESH_TTL_SECS {
            return Err(anyhow!(
                "REFRESH_TOKEN_TTL_SECS must be at most {}",
                MAX_REFRESH_TTL_SECS
            ));
        }
        if self.auth.rate_window_secs == 0 {
            return Err(anyhow!("AUTH_RATE_WINDOW_SECS must be positive"));
        }
        Ok(())
    }

    /// Mode the webhook guard runs in, decided once at startup.
    ///
    /// An explicit mode wins. Otherwise a configured secret means enforcing;
    /// no secret is permissive outside production and enforcing in production,
    /// where every delivery then fails verification.
    pub fn guard_mode(&self) -> GuardMode {
        if let Some(mode) = self.webhook.mode {
            return mode;
        }
        match (&self.webhook.secret, self.environment) {
            (Some(_), _) => GuardMode::Enforcing,
            (None, Environment::Production) => GuardMode::Enforcing,
            (None, Environment::Development) => GuardMode::Permissive,
        }
    }

    /// Loud startup diagnostics for risky settings.
    pub fn log_warnings(&self) {
        let prod = self.environment == Environment::Production;
        if self.webhook.secret.is_none() {
            if prod {
                error!(
                    "WEBHOOK_SECRET missing in production: all webhook deliveries will be rejected"
                );
            } else {
                warn!("WEBHOOK_SECRET not set: webhook signatures are not enforced");
            }
        }
        if self.guard_mode() == GuardMode::Permissive && prod {
            error!("webhook guard running in permissive mode in production");
        }
        if self.tokens.signing_secret.is_none() {
            warn!("JWT_SECRET not set: using a per-process random key lost on restart");
        }
        if self.auth.password == AuthConfig::default().password {
            warn!("operator password is the default; set RINGBACK_PASSWORD");
        }
    }
}
