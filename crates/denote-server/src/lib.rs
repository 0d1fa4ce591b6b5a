pub mod capability;
pub mod crypto;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod limiter;
pub mod security;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

/// Request-independent settings fixed at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute base URL capability links are rendered under. Ends in `/`.
    pub public_url: String,
    pub policy: store::SecretPolicy,
    pub key_scheme: crypto::KeyScheme,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when identifying callers.
    pub trust_proxy: bool,
    pub handler_timeout: Duration,
    /// Request body cap. Zero disables it.
    pub max_body_bytes: usize,
}

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    /// Gates the write path.
    pub create_limiter: Arc<limiter::IpLimiter>,
    /// Gates deletion-key redemption.
    pub delete_limiter: Arc<limiter::IpLimiter>,
    pub settings: Arc<Settings>,
}

pub use error::{Error, Result};
pub use server::{build_state, resolve_data_dir, router, run, ServerConfig};
