use redb::ReadableTable;
use serde::Serialize;

use super::db::{decode, load, scope_bounds, Store, GATEWAYS, PEERS, PEER_ADDRESSES, POOLS};
use super::model::{GatewayRecord, PeerRecord, Protocol};
use crate::allocator::AddressPool;
use crate::error::{Error, Result};
use crate::sync::{self, state_of, GatewayState};

/// A peer counts as connected if its last handshake is at most this old.
pub const CONNECTED_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct PoolUsage {
    pub cidr: String,
    pub capacity: u32,
    pub used: u32,
    pub pending_release: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayOverview {
    pub id: String,
    pub hostname: String,
    pub region: String,
    pub country_code: String,
    pub city: Option<String>,
    pub protocol: Protocol,
    pub endpoint: Option<String>,
    pub public_key: Option<String>,
    pub max_peers: Option<u32>,
    pub state: GatewayState,
    pub generation: u64,
    pub acked_generation: u64,
    pub last_synced_at: Option<i64>,
    /// Age of the last accepted sync report, in seconds.
    pub staleness_secs: Option<i64>,
    pub peers: usize,
    pub peers_enabled: usize,
    pub peers_connected: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub pool: PoolUsage,
    pub created_at: i64,
    pub registered_at: Option<i64>,
    pub retired_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub servers_total: usize,
    pub servers_active: usize,
    pub servers_pending: usize,
    pub servers_unregistered: usize,
    pub servers_retired: usize,
    pub peers_total: usize,
    pub peers_enabled: usize,
    pub peers_connected: usize,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub gateways: Vec<GatewayOverview>,
}

impl Store {
    /// Per-gateway sync state, load and pool usage from one snapshot.
    pub fn overview(&self, now: i64) -> Result<Vec<GatewayOverview>> {
        let txn = self.db.begin_read()?;
        let gateways = txn.open_table(GATEWAYS)?;
        let pools = txn.open_table(POOLS)?;
        let addresses = txn.open_table(PEER_ADDRESSES)?;
        let peers = txn.open_table(PEERS)?;

        let mut out = Vec::new();
        for item in gateways.iter()? {
            let (_, v) = item?;
            let gateway: GatewayRecord = decode(v.value())?;
            let sync = sync::read(&txn, &gateway.id)?;
            let pool: AddressPool = load(&pools, &gateway.id)?.ok_or_else(|| {
                Error::Internal(format!("gateway {} has no address pool", gateway.id))
            })?;

            let (lo, hi) = scope_bounds(&gateway.id);
            let mut total = 0;
            let mut enabled = 0;
            let mut connected = 0;
            let mut rx_bytes = 0u64;
            let mut tx_bytes = 0u64;
            for entry in addresses.range(lo.as_str()..hi.as_str())? {
                let (_, peer_id) = entry?;
                let Some(peer) = load::<PeerRecord, _>(&peers, peer_id.value())? else {
                    continue;
                };
                total += 1;
                if peer.is_live(now) {
                    enabled += 1;
                }
                if peer
                    .last_handshake
                    .is_some_and(|t| now - t <= CONNECTED_WINDOW_SECS)
                {
                    connected += 1;
                }
                rx_bytes = rx_bytes.saturating_add(peer.rx_bytes);
                tx_bytes = tx_bytes.saturating_add(peer.tx_bytes);
            }

            out.push(GatewayOverview {
                state: state_of(&gateway, &sync),
                endpoint: gateway.endpoint(),
                generation: sync.generation,
                acked_generation: sync.acked_generation,
                last_synced_at: sync.last_synced_at,
                staleness_secs: sync.staleness(now),
                peers: total,
                peers_enabled: enabled,
                peers_connected: connected,
                rx_bytes,
                tx_bytes,
                pool: PoolUsage {
                    cidr: pool.cidr.clone(),
                    capacity: pool.capacity(),
                    used: pool.used_count(),
                    pending_release: pool.pending_count(),
                },
                id: gateway.id,
                hostname: gateway.hostname,
                region: gateway.region,
                country_code: gateway.country_code,
                city: gateway.city,
                protocol: gateway.protocol,
                public_key: gateway.public_key,
                max_peers: gateway.max_peers,
                created_at: gateway.created_at,
                registered_at: gateway.registered_at,
                retired_at: gateway.retired_at,
            });
        }
        out.sort_by(|a, b| (&a.region, &a.hostname).cmp(&(&b.region, &b.hostname)));
        Ok(out)
    }

    pub fn stats(&self, now: i64) -> Result<Stats> {
        let gateways = self.overview(now)?;
        let count = |s: GatewayState| gateways.iter().filter(|g| g.state == s).count();
        let retired = count(GatewayState::Retired);
        let unregistered = count(GatewayState::Unregistered);

        Ok(Stats {
            servers_total: gateways.len(),
            servers_active: gateways.len() - retired - unregistered,
            servers_pending: count(GatewayState::Pending),
            servers_unregistered: unregistered,
            servers_retired: retired,
            peers_total: gateways.iter().map(|g| g.peers).sum(),
            peers_enabled: gateways.iter().map(|g| g.peers_enabled).sum(),
            peers_connected: gateways.iter().map(|g| g.peers_connected).sum(),
            rx_bytes_total: gateways.iter().fold(0u64, |acc, g| acc.saturating_add(g.rx_bytes)),
            tx_bytes_total: gateways.iter().fold(0u64, |acc, g| acc.saturating_add(g.tx_bytes)),
            gateways,
        })
    }
}
