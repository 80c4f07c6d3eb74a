use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, patch, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    allocator::DEFAULT_ALLOCATION_RETRIES,
    auth::require_admin_key,
    handlers::{admin, client, gateway, health},
    keys::{load_or_create_salt, TokenService},
    store::Store,
    AppState, PeerDefaults, Settings,
};

const DB_FILE: &str = "vpnsync.db";
const SALT_FILE: &str = "vpnsync.salt";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub admin_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub store_timeout: Duration,
    pub allocation_retries: u32,
    pub audit_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("VPNSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("VPNSYNC_PORT").unwrap_or(8080),
            admin_key: std::env::var("VPNSYNC_ADMIN_KEY").ok().filter(|k| !k.is_empty()),
            data_dir: std::env::var("VPNSYNC_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(300),
            cors_origins: std::env::var("VPNSYNC_CORS_ORIGINS").ok(),
            store_timeout: Duration::from_millis(env_parse("VPNSYNC_STORE_TIMEOUT_MS").unwrap_or(5000)),
            allocation_retries: env_parse("VPNSYNC_ALLOCATION_RETRIES")
                .unwrap_or(DEFAULT_ALLOCATION_RETRIES),
            audit_retention: Duration::from_secs(
                env_parse::<u64>("VPNSYNC_AUDIT_RETENTION_DAYS").unwrap_or(90) * 86_400,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Explicit directory if given (created if missing), else the platform default.
pub fn resolve_data_dir(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Open the store and token salt under `data_dir` and assemble handler state.
pub fn open_state(data_dir: &Path, admin_key: Option<String>, settings: Settings) -> Result<AppState> {
    let salt = load_or_create_salt(&data_dir.join(SALT_FILE))?;
    let store = Store::open(&data_dir.join(DB_FILE)).context("open store")?;
    Ok(AppState {
        store,
        tokens: TokenService::new(salt),
        admin_key,
        settings: Arc::new(settings),
    })
}

pub fn router(state: AppState) -> Router {
    // Gateway and client routes authenticate per request with their own tokens.
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/gateway/register", post(gateway::register))
        .route("/api/v1/gateway/peers", get(gateway::peers))
        .route("/api/v1/gateway/sync", put(gateway::sync))
        .route("/api/v1/gateway/status", put(gateway::status))
        .route("/api/v1/client/config", get(client::config))
        .route("/api/v1/client/servers", get(client::servers))
        .route("/api/v1/client/switch-server", post(client::switch_server));

    let admin = Router::new()
        .route("/api/v1/configs/create", post(admin::create_config))
        .route(
            "/api/v1/configs/{peer_id}",
            get(admin::get_config).delete(admin::delete_config),
        )
        .route("/api/v1/configs/{peer_id}/disable", patch(admin::disable_config))
        .route("/api/v1/configs/{peer_id}/enable", patch(admin::enable_config))
        .route(
            "/api/v1/admin/servers",
            get(admin::list_servers).post(admin::create_server),
        )
        .route(
            "/api/v1/admin/servers/{gateway_id}/provisioning-secret",
            post(admin::reissue_provisioning),
        )
        .route("/api/v1/admin/servers/{gateway_id}/retire", post(admin::retire_server))
        .route("/api/v1/admin/stats", get(admin::stats))
        .route("/api/v1/admin/audit", get(admin::audit))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new().merge(public).merge(admin).with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    if cfg.admin_key.is_none() {
        tracing::warn!("VPNSYNC_ADMIN_KEY is not set; admin endpoints will refuse every request");
    }

    let settings = Settings {
        store_timeout: cfg.store_timeout,
        allocation_retries: cfg.allocation_retries,
        peer_defaults: PeerDefaults::default(),
    };
    let state = open_state(&data_dir, cfg.admin_key, settings)?;

    state
        .store
        .clone()
        .spawn_sweep(cfg.sweep_interval, cfg.audit_retention);

    let app = router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "vpnsync server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::PATCH,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
