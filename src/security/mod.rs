pub mod audit_log;
pub mod credentials;
pub mod idempotency;
pub mod rate_limit;
pub mod refresh_store;
pub mod signature;
pub mod tokens;
