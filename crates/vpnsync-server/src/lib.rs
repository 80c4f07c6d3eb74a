use std::sync::Arc;
use std::time::Duration;

pub mod allocator;
pub mod auth;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod render;
pub mod server;
pub mod store;
pub mod sync;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub tokens: keys::TokenService,
    /// Expected `X-Admin-Key`. When unset, every admin route is refused.
    pub admin_key: Option<String>,
    pub settings: Arc<Settings>,
}

/// Request-path tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on any single store call made on behalf of a request.
    pub store_timeout: Duration,
    pub allocation_retries: u32,
    pub peer_defaults: PeerDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            allocation_retries: allocator::DEFAULT_ALLOCATION_RETRIES,
            peer_defaults: PeerDefaults::default(),
        }
    }
}

/// Client-side values used when `configs/create` leaves them out.
#[derive(Debug, Clone)]
pub struct PeerDefaults {
    pub allowed_ips: Vec<String>,
    pub dns_servers: Vec<String>,
    pub persistent_keepalive: u16,
    pub mtu: u16,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            allowed_ips: vec!["0.0.0.0/0".into(), "::/0".into()],
            dns_servers: vec!["1.1.1.1".into()],
            persistent_keepalive: 25,
            mtu: 1420,
        }
    }
}

pub use error::{Error, Result};
pub use server::{open_state, resolve_data_dir, router, run, ServerConfig};
