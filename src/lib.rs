pub mod comms;
pub mod config;
pub mod security;
pub mod transport;
pub mod utils;
pub mod webhook;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
