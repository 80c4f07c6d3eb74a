//! Endpoints called by VPN client devices, authenticated by their client token.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::blocking;
use crate::error::{ApiError, Error, Result};
use crate::store::{unix_now, GatewayRecord, Obfuscation, PeerRecord, Protocol};
use crate::AppState;

/// Connection details for a device. Never contains the private key.
#[derive(Debug, Serialize)]
pub struct ConfigBlock {
    pub peer_id: String,
    pub gateway_id: String,
    pub server_public_key: String,
    pub endpoint: String,
    pub address: String,
    pub allowed_ips: Vec<String>,
    pub dns_servers: Vec<String>,
    pub mtu: u16,
    pub persistent_keepalive: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<Obfuscation>,
}

impl ConfigBlock {
    pub fn new(peer: &PeerRecord, gateway: &GatewayRecord) -> Result<Self> {
        Ok(Self {
            peer_id: peer.id.clone(),
            gateway_id: gateway.id.clone(),
            server_public_key: gateway
                .public_key
                .clone()
                .ok_or_else(|| Error::Internal(format!("gateway {} has no public key", gateway.id)))?,
            endpoint: gateway
                .endpoint()
                .ok_or_else(|| Error::Internal(format!("gateway {} has no endpoint", gateway.id)))?,
            address: format!("{}/32", peer.address),
            allowed_ips: peer.allowed_ips.clone(),
            dns_servers: peer.dns_servers.clone(),
            mtu: peer.mtu,
            persistent_keepalive: peer.persistent_keepalive,
            obfuscation: gateway.effective_obfuscation(),
        })
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// Current config for the token's peer. Unknown tokens, disabled peers and
/// expired peers all look the same: 404.
pub async fn config(
    State(state): State<AppState>,
    Query(q): Query<TokenQuery>,
) -> std::result::Result<Json<ConfigBlock>, ApiError> {
    let hash = state.tokens.hash(&q.token).map_err(ApiError::public)?;
    let block = blocking(&state, move |store| {
        let peer = match store.peer_by_token(&hash) {
            Ok(peer) => peer,
            Err(Error::Auth(_)) => return Err(Error::NotFound("unknown client token".into())),
            Err(e) => return Err(e),
        };
        if !peer.is_live(unix_now()) {
            return Err(Error::NotFound(format!("peer {} is disabled or expired", peer.id)));
        }
        let gateway = store.get_gateway(&peer.gateway_id)?;
        ConfigBlock::new(&peer, &gateway)
    })
    .await
    .map_err(ApiError::public)?;
    Ok(Json(block))
}

// ── Servers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServersQuery {
    pub token: String,
    pub region: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerEntry {
    pub gateway_id: String,
    pub hostname: String,
    pub region: String,
    pub country_code: String,
    pub city: Option<String>,
    pub protocol: Protocol,
    pub endpoint: Option<String>,
    /// Whether the calling peer is currently on this gateway.
    pub current: bool,
}

/// Gateways a device may switch to: registered, not retired, optionally
/// narrowed by region and protocol.
pub async fn servers(
    State(state): State<AppState>,
    Query(q): Query<ServersQuery>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let protocol = q
        .protocol
        .as_deref()
        .map(str::parse::<Protocol>)
        .transpose()
        .map_err(|e| ApiError::public(Error::Validation(e)))?;
    let region = q.region.as_deref().map(str::to_ascii_lowercase);
    let hash = state.tokens.hash(&q.token).map_err(ApiError::public)?;

    let (peer, gateways) = blocking(&state, move |store| {
        let peer = store.peer_by_token(&hash)?;
        Ok((peer, store.list_gateways()?))
    })
    .await
    .map_err(ApiError::public)?;

    let servers: Vec<ServerEntry> = gateways
        .into_iter()
        .filter(|g| g.is_active())
        .filter(|g| region.as_deref().map_or(true, |r| g.region == r))
        .filter(|g| protocol.map_or(true, |p| g.protocol == p))
        .map(|g| ServerEntry {
            current: g.id == peer.gateway_id,
            endpoint: g.endpoint(),
            gateway_id: g.id,
            hostname: g.hostname,
            region: g.region,
            country_code: g.country_code,
            city: g.city,
            protocol: g.protocol,
        })
        .collect();
    Ok(Json(serde_json::json!({ "servers": servers })))
}

// ── Switch server ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub token: String,
    pub target_gateway_id: String,
}

/// Move the device to another gateway, keeping its key pair. Returns the new
/// config block.
pub async fn switch_server(
    State(state): State<AppState>,
    Json(body): Json<SwitchRequest>,
) -> std::result::Result<Json<ConfigBlock>, ApiError> {
    let hash = state.tokens.hash(&body.token).map_err(ApiError::public)?;
    let retries = state.settings.allocation_retries;
    let target = body.target_gateway_id;
    let block = blocking(&state, move |store| {
        let (peer, gateway) = store.switch_peer(&hash, &target, retries)?;
        ConfigBlock::new(&peer, &gateway)
    })
    .await
    .map_err(ApiError::public)?;
    Ok(Json(block))
}
