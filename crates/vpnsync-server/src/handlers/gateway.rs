//! Endpoints called by gateway agents.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::blocking;
use crate::auth::AuthedGateway;
use crate::error::ApiError;
use crate::store::{unix_now, Obfuscation, PeerRecord, PeerStatus, Registration};
use crate::sync::AckOutcome;
use crate::AppState;

// ── Register ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub provisioning_secret: String,
    pub public_key: String,
    pub public_ip: String,
    pub listen_port: Option<u16>,
    pub obfuscation: Option<Obfuscation>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub gateway_id: String,
    pub gateway_token: String,
    pub generation: u64,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let provisioning_hash = state
        .tokens
        .hash(&body.provisioning_secret)
        .map_err(ApiError::public)?;
    let issued = state.tokens.issue_gateway_token().map_err(ApiError::public)?;
    let token_hash = issued.hash.clone();
    let registration = Registration {
        public_key: body.public_key.trim().to_owned(),
        public_ip: body.public_ip.trim().to_owned(),
        listen_port: body.listen_port,
        obfuscation: body.obfuscation,
    };

    let (gateway, sync) = blocking(&state, move |store| {
        store.register_gateway(&provisioning_hash, &token_hash, registration)
    })
    .await
    .map_err(ApiError::public)?;

    info!(gateway_id = %gateway.id, hostname = %gateway.hostname, "issued gateway token");
    Ok(Json(RegisterResponse {
        gateway_id: gateway.id,
        gateway_token: issued.token.to_string(),
        generation: sync.generation,
    }))
}

// ── Pull ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct GatewayPeer {
    pub public_key: String,
    pub address: String,
    /// Gateway-side allowed IPs: the peer's tunnel address as a host route.
    pub allowed_ips: Vec<String>,
    pub enabled: bool,
}

impl GatewayPeer {
    fn from_record(peer: &PeerRecord) -> Self {
        Self {
            public_key: peer.public_key.clone(),
            address: peer.address.to_string(),
            allowed_ips: vec![format!("{}/32", peer.address)],
            enabled: peer.enabled,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub generation: u64,
    pub peers: Vec<GatewayPeer>,
}

pub async fn peers(
    State(state): State<AppState>,
    AuthedGateway(gateway): AuthedGateway,
) -> Result<Json<PeersResponse>, ApiError> {
    let id = gateway.id.clone();
    let (generation, records) =
        blocking(&state, move |store| store.gateway_peers(&id, unix_now()))
            .await
            .map_err(ApiError::public)?;

    let peers: Vec<GatewayPeer> = records.iter().map(GatewayPeer::from_record).collect();
    debug!(gateway_id = %gateway.id, generation, count = peers.len(), "gateway pulled peers");
    Ok(Json(PeersResponse { generation, peers }))
}

// ── Sync report ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub generation: u64,
}

pub async fn sync(
    State(state): State<AppState>,
    AuthedGateway(gateway): AuthedGateway,
    Json(body): Json<SyncRequest>,
) -> Result<StatusCode, ApiError> {
    let id = gateway.id.clone();
    let ack = blocking(&state, move |store| store.acknowledge_sync(&id, body.generation))
        .await
        .map_err(ApiError::public)?;

    if ack.outcome == AckOutcome::Stale {
        debug!(
            gateway_id = %gateway.id,
            reported = body.generation,
            acked = ack.acked_generation,
            "ignored stale sync report"
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Status report ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub peers: Vec<PeerStatus>,
}

pub async fn status(
    State(state): State<AppState>,
    AuthedGateway(gateway): AuthedGateway,
    Json(body): Json<StatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = gateway.id;
    let updated = blocking(&state, move |store| store.update_peer_status(&id, &body.peers))
        .await
        .map_err(ApiError::public)?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}
