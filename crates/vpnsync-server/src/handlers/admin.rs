//! Administrator endpoints. Every route here sits behind `require_admin_key`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::blocking;
use crate::error::{ApiError, Error};
use crate::keys::generate_keypair;
use crate::render::{client_config, qr_png_base64};
use crate::store::{
    unix_now, Actor, AuditEvent, AuditQuery, NewGateway, NewPeer, PeerRecord, Placement, Protocol,
};
use crate::AppState;

type AdminResult<T> = Result<T, ApiError>;

const SECONDS_PER_DAY: i64 = 86_400;
const DEFAULT_LISTEN_PORT: u16 = 51820;

// ── Create config ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub name: String,
    pub email: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub notes: Option<String>,
    /// Explicit gateway; otherwise the least-loaded active one is chosen.
    pub server_id: Option<String>,
    pub region: Option<String>,
    pub allowed_ips: Option<Vec<String>>,
    pub dns_servers: Option<Vec<String>>,
    pub persistent_keepalive: Option<u16>,
    pub mtu: Option<u16>,
    pub expires_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateConfigResponse {
    pub peer_id: String,
    pub gateway_id: String,
    pub config: String,
    pub private_key: String,
    pub public_key: String,
    pub assigned_ip: String,
    pub server_endpoint: String,
    pub server_public_key: String,
    pub qr_code_png_base64: String,
    pub client_token: String,
}

/// The only endpoint that ever returns a private key or a client token.
/// Neither is stored, so neither can be fetched again.
pub async fn create_config(
    State(state): State<AppState>,
    Json(body): Json<CreateConfigRequest>,
) -> AdminResult<Response> {
    let defaults = &state.settings.peer_defaults;
    let keypair = generate_keypair().map_err(ApiError::admin)?;
    let peer_id = uuid::Uuid::new_v4().to_string();
    let token = state.tokens.issue_client_token(&peer_id).map_err(ApiError::admin)?;

    let expires_at = match body.expires_days {
        Some(0) => {
            return Err(ApiError::admin(Error::Validation(
                "expires_days must be at least 1".into(),
            )))
        }
        Some(days) => Some(unix_now() + i64::from(days) * SECONDS_PER_DAY),
        None => None,
    };
    let new = NewPeer {
        id: peer_id,
        name: body.name,
        email: body.email,
        device_name: body.device_name,
        device_type: body.device_type,
        notes: body.notes,
        public_key: keypair.public_key.clone(),
        allowed_ips: body.allowed_ips.unwrap_or_else(|| defaults.allowed_ips.clone()),
        dns_servers: body.dns_servers.unwrap_or_else(|| defaults.dns_servers.clone()),
        persistent_keepalive: body
            .persistent_keepalive
            .unwrap_or(defaults.persistent_keepalive),
        mtu: body.mtu.unwrap_or(defaults.mtu),
        expires_at,
        token_hash: token.hash.clone(),
    };
    let placement = match body.server_id {
        Some(id) => Placement::Gateway(id),
        None => Placement::LeastLoaded {
            region: body.region,
        },
    };
    let retries = state.settings.allocation_retries;

    let (peer, gateway) = blocking(&state, move |store| {
        store.create_peer(&placement, new, &Actor::Admin, retries)
    })
    .await
    .map_err(ApiError::admin)?;

    let config = client_config(&keypair.private_key, &peer, &gateway).map_err(ApiError::admin)?;
    let qr = qr_png_base64(&config).map_err(ApiError::admin)?;

    let response = CreateConfigResponse {
        peer_id: peer.id,
        gateway_id: gateway.id.clone(),
        private_key: keypair.private_key.to_string(),
        public_key: keypair.public_key,
        assigned_ip: peer.address.to_string(),
        server_endpoint: gateway.endpoint().unwrap_or_default(),
        server_public_key: gateway.public_key.clone().unwrap_or_default(),
        qr_code_png_base64: qr,
        client_token: token.token.to_string(),
        config,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

// ── Peer detail / enable / disable / delete ───────────────────────────────────

/// Admin view of a peer: everything but the token hash.
#[derive(Debug, Serialize)]
pub struct PeerView {
    pub id: String,
    pub gateway_id: String,
    pub name: String,
    pub email: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub notes: Option<String>,
    pub public_key: String,
    pub address: String,
    pub allowed_ips: Vec<String>,
    pub dns_servers: Vec<String>,
    pub persistent_keepalive: u16,
    pub mtu: u16,
    pub enabled: bool,
    pub expired: bool,
    pub created_at: i64,
    pub disabled_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl From<PeerRecord> for PeerView {
    fn from(p: PeerRecord) -> Self {
        Self {
            expired: p.is_expired(unix_now()),
            address: p.address.to_string(),
            id: p.id,
            gateway_id: p.gateway_id,
            name: p.name,
            email: p.email,
            device_name: p.device_name,
            device_type: p.device_type,
            notes: p.notes,
            public_key: p.public_key,
            allowed_ips: p.allowed_ips,
            dns_servers: p.dns_servers,
            persistent_keepalive: p.persistent_keepalive,
            mtu: p.mtu,
            enabled: p.enabled,
            created_at: p.created_at,
            disabled_at: p.disabled_at,
            expires_at: p.expires_at,
            last_handshake: p.last_handshake,
            rx_bytes: p.rx_bytes,
            tx_bytes: p.tx_bytes,
        }
    }
}

pub async fn get_config(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> AdminResult<Json<PeerView>> {
    let peer = blocking(&state, move |store| store.get_peer(&peer_id))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(peer.into()))
}

pub async fn disable_config(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> AdminResult<Json<PeerView>> {
    set_enabled(state, peer_id, false).await
}

pub async fn enable_config(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> AdminResult<Json<PeerView>> {
    set_enabled(state, peer_id, true).await
}

async fn set_enabled(state: AppState, peer_id: String, enabled: bool) -> AdminResult<Json<PeerView>> {
    let peer = blocking(&state, move |store| {
        store.set_peer_enabled(&peer_id, enabled, &Actor::Admin)
    })
    .await
    .map_err(ApiError::admin)?;
    Ok(Json(peer.into()))
}

pub async fn delete_config(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> AdminResult<Json<serde_json::Value>> {
    let peer = blocking(&state, move |store| store.delete_peer(&peer_id, &Actor::Admin))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(json!({"deleted": true, "peer_id": peer.id})))
}

// ── Servers ───────────────────────────────────────────────────────────────────

pub async fn list_servers(State(state): State<AppState>) -> AdminResult<Json<serde_json::Value>> {
    let servers = blocking(&state, |store| store.overview(unix_now()))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(json!({ "servers": servers })))
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub hostname: String,
    pub region: String,
    pub country_code: String,
    pub city: Option<String>,
    pub protocol: Protocol,
    pub listen_port: Option<u16>,
    pub max_peers: Option<u32>,
    pub pool_cidr: String,
}

#[derive(Debug, Serialize)]
pub struct ProvisioningResponse {
    pub gateway_id: String,
    pub hostname: String,
    /// Shown once; the gateway agent exchanges it for its token.
    pub provisioning_secret: String,
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServerRequest>,
) -> AdminResult<Response> {
    let secret = state.tokens.issue_provisioning_secret().map_err(ApiError::admin)?;
    let hash = secret.hash.clone();
    let new = NewGateway {
        hostname: body.hostname,
        region: body.region,
        country_code: body.country_code,
        city: body.city,
        protocol: body.protocol,
        listen_port: body.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
        max_peers: body.max_peers,
        pool_cidr: body.pool_cidr,
    };
    let gateway = blocking(&state, move |store| store.create_gateway(new, &hash, &Actor::Admin))
        .await
        .map_err(ApiError::admin)?;

    let response = ProvisioningResponse {
        gateway_id: gateway.id,
        hostname: gateway.hostname,
        provisioning_secret: secret.token.to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

pub async fn reissue_provisioning(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
) -> AdminResult<Json<ProvisioningResponse>> {
    let secret = state.tokens.issue_provisioning_secret().map_err(ApiError::admin)?;
    let hash = secret.hash.clone();
    let gateway = blocking(&state, move |store| {
        store.reissue_provisioning(&gateway_id, &hash, &Actor::Admin)
    })
    .await
    .map_err(ApiError::admin)?;

    info!(gateway_id = %gateway.id, "reissued provisioning secret");
    Ok(Json(ProvisioningResponse {
        gateway_id: gateway.id,
        hostname: gateway.hostname,
        provisioning_secret: secret.token.to_string(),
    }))
}

pub async fn retire_server(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
) -> AdminResult<Json<serde_json::Value>> {
    let gateway = blocking(&state, move |store| store.retire_gateway(&gateway_id, &Actor::Admin))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(json!({
        "gateway_id": gateway.id,
        "retired": gateway.retired,
        "retired_at": gateway.retired_at,
    })))
}

// ── Stats / audit ─────────────────────────────────────────────────────────────

pub async fn stats(State(state): State<AppState>) -> AdminResult<Json<crate::store::Stats>> {
    let stats = blocking(&state, |store| store.stats(unix_now()))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub limit: Option<usize>,
    pub before_id: Option<u64>,
    pub action: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub entries: Vec<AuditEvent>,
}

pub async fn audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> AdminResult<Json<AuditResponse>> {
    let query = AuditQuery {
        limit: params.limit.unwrap_or(0),
        before_id: params.before_id,
        action: params.action,
    };
    let entries = blocking(&state, move |store| store.audit(&query))
        .await
        .map_err(ApiError::admin)?;
    Ok(Json(AuditResponse { entries }))
}
