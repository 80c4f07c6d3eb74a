use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use redb::{ReadableTable, WriteTransaction};
use tracing::{debug, info};

use super::audit;
use super::db::{
    decode, load, save, scope_bounds, scoped_key, unix_now, Store, GATEWAYS, PEERS,
    PEER_ADDRESSES, PEER_KEYS, POOLS, TOKENS,
};
use super::model::{Actor, GatewayRecord, NewPeer, PeerRecord, Placement, TokenEntry};
use crate::allocator::{with_retries, AddressPool};
use crate::error::{Error, Result};
use crate::keys::{validate_public_key, TokenKind};
use crate::sync;

const MAX_NAME_LEN: usize = 128;

impl Store {
    /// Create a peer on the placed gateway: reserve an address, write the peer
    /// and its index rows, register its client token, bump the gateway's
    /// generation and audit, all in one transaction. Address races are retried
    /// up to `max_attempts` times.
    pub fn create_peer(
        &self,
        placement: &Placement,
        new: NewPeer,
        actor: &Actor,
        max_attempts: u32,
    ) -> Result<(PeerRecord, GatewayRecord)> {
        validate_new_peer(&new)?;
        with_retries(max_attempts, |attempt| {
            debug!(attempt, peer_id = %new.id, "allocating peer address");
            self.try_create_peer(placement, &new, actor)
        })
    }

    fn try_create_peer(
        &self,
        placement: &Placement,
        new: &NewPeer,
        actor: &Actor,
    ) -> Result<(PeerRecord, GatewayRecord)> {
        let now = unix_now();
        let txn = self.db.begin_write()?;
        let gateway = resolve_placement(&txn, placement)?;

        let address = match reserve_address(&txn, &gateway, &new.public_key)? {
            Reservation::Reserved(addr) => addr,
            Reservation::Collided(addr) => {
                self.commit(txn)?;
                return Err(Error::Conflict(format!(
                    "{addr} on gateway {} is already indexed",
                    gateway.id
                )));
            }
        };

        let peer = PeerRecord {
            id: new.id.clone(),
            gateway_id: gateway.id.clone(),
            name: new.name.trim().to_owned(),
            email: new.email.clone(),
            device_name: new.device_name.clone(),
            device_type: new.device_type.clone(),
            notes: new.notes.clone(),
            public_key: new.public_key.clone(),
            address,
            allowed_ips: new.allowed_ips.clone(),
            dns_servers: new.dns_servers.clone(),
            persistent_keepalive: new.persistent_keepalive,
            mtu: new.mtu,
            enabled: true,
            token_hash: new.token_hash.clone(),
            created_at: now,
            disabled_at: None,
            expires_at: new.expires_at,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        };

        {
            let mut peers = txn.open_table(PEERS)?;
            if peers.get(peer.id.as_str())?.is_some() {
                return Err(Error::Duplicate(format!("peer id {} already exists", peer.id)));
            }
            save(&mut peers, &peer.id, &peer)?;
            index_peer(&txn, &peer)?;

            let mut tokens = txn.open_table(TOKENS)?;
            save(
                &mut tokens,
                &peer.token_hash,
                &TokenEntry {
                    kind: TokenKind::Client,
                    subject_id: peer.id.clone(),
                    issued_at: now,
                    used_at: None,
                },
            )?;
        }
        let generation = sync::bump(&txn, &gateway.id)?;
        audit::append(&txn, actor, "peer.create", &peer.id, None, Some(peer.summary()))?;
        self.commit(txn)?;
        info!(peer_id = %peer.id, gateway_id = %gateway.id, %address, generation, "peer created");
        Ok((peer, gateway))
    }

    pub fn get_peer(&self, peer_id: &str) -> Result<PeerRecord> {
        let txn = self.db.begin_read()?;
        let peers = txn.open_table(PEERS)?;
        load(&peers, peer_id)?.ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))
    }

    /// Resolve a client token to its peer. Disabled and expired peers are
    /// still returned; callers decide what that means for them.
    pub fn peer_by_token(&self, token_hash: &str) -> Result<PeerRecord> {
        let txn = self.db.begin_read()?;
        let tokens = txn.open_table(TOKENS)?;
        let entry: TokenEntry = load(&tokens, token_hash)?
            .filter(|e: &TokenEntry| e.kind == TokenKind::Client)
            .ok_or_else(|| Error::Auth("invalid client token".into()))?;
        let peers = txn.open_table(PEERS)?;
        load(&peers, &entry.subject_id)?.ok_or_else(|| Error::Auth("invalid client token".into()))
    }

    /// Enable or disable a peer. Repeating the current state is a no-op and
    /// does not bump the generation. The address stays reserved either way.
    pub fn set_peer_enabled(&self, peer_id: &str, enabled: bool, actor: &Actor) -> Result<PeerRecord> {
        let now = unix_now();
        let txn = self.db.begin_write()?;
        let peer = {
            let mut peers = txn.open_table(PEERS)?;
            let mut peer: PeerRecord = load(&peers, peer_id)?
                .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))?;
            if peer.enabled == enabled {
                return Ok(peer);
            }
            if enabled && peer.is_expired(now) {
                return Err(Error::Validation(format!(
                    "peer {peer_id} expired; extend expires_at before enabling"
                )));
            }
            peer.enabled = enabled;
            peer.disabled_at = if enabled { None } else { Some(now) };
            save(&mut peers, peer_id, &peer)?;
            peer
        };
        sync::bump(&txn, &peer.gateway_id)?;
        let action = if enabled { "peer.enable" } else { "peer.disable" };
        audit::append(
            &txn,
            actor,
            action,
            peer_id,
            Some(format!("enabled={}", !enabled)),
            Some(format!("enabled={enabled}")),
        )?;
        self.commit(txn)?;
        Ok(peer)
    }

    /// Remove a peer. Its address is released once the gateway acknowledges
    /// the generation that dropped it.
    pub fn delete_peer(&self, peer_id: &str, actor: &Actor) -> Result<PeerRecord> {
        let txn = self.db.begin_write()?;
        let peer = {
            let mut peers = txn.open_table(PEERS)?;
            let peer: PeerRecord = load(&peers, peer_id)?
                .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))?;
            peers.remove(peer_id)?;
            unindex_peer(&txn, &peer)?;
            let mut tokens = txn.open_table(TOKENS)?;
            tokens.remove(peer.token_hash.as_str())?;
            peer
        };
        let generation = sync::bump(&txn, &peer.gateway_id)?;
        release_address(&txn, &peer.gateway_id, peer.address, generation)?;
        audit::append(&txn, actor, "peer.delete", peer_id, Some(peer.summary()), None)?;
        self.commit(txn)?;
        Ok(peer)
    }

    /// Move the peer holding `token_hash` onto `target_gateway_id`, keeping its
    /// key pair. Either the whole move commits or nothing changes.
    pub fn switch_peer(
        &self,
        token_hash: &str,
        target_gateway_id: &str,
        max_attempts: u32,
    ) -> Result<(PeerRecord, GatewayRecord)> {
        with_retries(max_attempts, |_| self.try_switch_peer(token_hash, target_gateway_id))
    }

    fn try_switch_peer(
        &self,
        token_hash: &str,
        target_gateway_id: &str,
    ) -> Result<(PeerRecord, GatewayRecord)> {
        let now = unix_now();
        let txn = self.db.begin_write()?;

        let mut peer: PeerRecord = {
            let tokens = txn.open_table(TOKENS)?;
            let entry: TokenEntry = load(&tokens, token_hash)?
                .filter(|e: &TokenEntry| e.kind == TokenKind::Client)
                .ok_or_else(|| Error::Auth("invalid client token".into()))?;
            let peers = txn.open_table(PEERS)?;
            load(&peers, &entry.subject_id)?
                .ok_or_else(|| Error::Auth("invalid client token".into()))?
        };
        if !peer.is_live(now) {
            return Err(Error::NotFound(format!("peer {} is disabled or expired", peer.id)));
        }
        if peer.gateway_id == target_gateway_id {
            return Err(Error::Validation(format!(
                "peer {} is already on gateway {target_gateway_id}",
                peer.id
            )));
        }

        let target = resolve_placement(&txn, &Placement::Gateway(target_gateway_id.to_owned()))?;
        let address = match reserve_address(&txn, &target, &peer.public_key)? {
            Reservation::Reserved(addr) => addr,
            Reservation::Collided(addr) => {
                self.commit(txn)?;
                return Err(Error::Conflict(format!(
                    "{addr} on gateway {} is already indexed",
                    target.id
                )));
            }
        };

        let actor = Actor::Client(peer.id.clone());
        let old_gateway = peer.gateway_id.clone();
        let old_address = peer.address;
        let before = format!("gateway={old_gateway} address={old_address}");

        unindex_peer(&txn, &peer)?;
        peer.gateway_id = target.id.clone();
        peer.address = address;
        peer.last_handshake = None;
        peer.rx_bytes = 0;
        peer.tx_bytes = 0;
        {
            let mut peers = txn.open_table(PEERS)?;
            save(&mut peers, &peer.id, &peer)?;
        }
        index_peer(&txn, &peer)?;

        let old_generation = sync::bump(&txn, &old_gateway)?;
        release_address(&txn, &old_gateway, old_address, old_generation)?;
        sync::bump(&txn, &target.id)?;

        audit::append(
            &txn,
            &actor,
            "peer.switch",
            &peer.id,
            Some(before),
            Some(format!("gateway={} address={address}", target.id)),
        )?;
        self.commit(txn)?;
        Ok((peer, target))
    }

    /// Disable every enabled peer whose `expires_at` has passed. Each affected
    /// gateway is bumped once. Returns how many peers were disabled.
    pub fn disable_expired(&self, now: i64) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let mut expired = {
            let peers = txn.open_table(PEERS)?;
            let mut expired = Vec::new();
            for item in peers.iter()? {
                let (_, v) = item?;
                let peer: PeerRecord = decode(v.value())?;
                if peer.enabled && peer.is_expired(now) {
                    expired.push(peer);
                }
            }
            expired
        };
        if expired.is_empty() {
            return Ok(0);
        }
        expire_peers(&txn, &mut expired, now)?;
        self.commit(txn)?;
        Ok(expired.len())
    }
}

/// Disable `expired` peers, bump each affected gateway once and audit every
/// peer as a system action.
pub(crate) fn expire_peers(txn: &WriteTransaction, expired: &mut [PeerRecord], now: i64) -> Result<()> {
    if expired.is_empty() {
        return Ok(());
    }
    {
        let mut peers = txn.open_table(PEERS)?;
        for peer in expired.iter_mut() {
            peer.enabled = false;
            peer.disabled_at = Some(now);
            save(&mut peers, &peer.id, &*peer)?;
        }
    }
    let gateways: BTreeSet<&str> = expired.iter().map(|p| p.gateway_id.as_str()).collect();
    for gateway_id in gateways {
        sync::bump(txn, gateway_id)?;
    }
    for peer in expired.iter() {
        audit::append(
            txn,
            &Actor::System,
            "peer.expire",
            &peer.id,
            Some("enabled=true".into()),
            Some("enabled=false".into()),
        )?;
    }
    Ok(())
}

// ── Transaction helpers ───────────────────────────────────────────────────────

enum Reservation {
    Reserved(Ipv4Addr),
    /// The pool handed out an address the index already holds. The pool has
    /// been saved with that address marked used; the caller commits the repair
    /// and retries.
    Collided(Ipv4Addr),
}

/// Pick the gateway a new peer lands on. Explicit targets must be registered
/// and not retired; otherwise the active gateway with the fewest peers that
/// still has room wins, ties broken by hostname.
fn resolve_placement(txn: &WriteTransaction, placement: &Placement) -> Result<GatewayRecord> {
    let gateways = txn.open_table(GATEWAYS)?;
    let addresses = txn.open_table(PEER_ADDRESSES)?;
    let pools = txn.open_table(POOLS)?;

    match placement {
        Placement::Gateway(id) => {
            let gateway: GatewayRecord = load(&gateways, id)?
                .ok_or_else(|| Error::NotFound(format!("gateway {id}")))?;
            if gateway.retired {
                return Err(Error::Validation(format!("gateway {id} is retired")));
            }
            if !gateway.is_registered() {
                return Err(Error::Validation(format!("gateway {id} has not registered yet")));
            }
            Ok(gateway)
        }
        Placement::LeastLoaded { region } => {
            let region = region.as_deref().map(str::to_ascii_lowercase);
            let mut candidates = 0usize;
            let mut best: Option<(usize, GatewayRecord)> = None;
            for item in gateways.iter()? {
                let (_, v) = item?;
                let gateway: GatewayRecord = decode(v.value())?;
                if !gateway.is_active() {
                    continue;
                }
                if region.as_deref().is_some_and(|r| r != gateway.region) {
                    continue;
                }
                candidates += 1;

                let count = count_scoped(&addresses, &gateway.id)?;
                if gateway.max_peers.is_some_and(|max| count >= max as usize) {
                    continue;
                }
                let pool: AddressPool = load_pool(&pools, &gateway.id)?;
                if pool.used_count() >= pool.capacity() {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((n, b)) => (count, &gateway.hostname) < (*n, &b.hostname),
                };
                if better {
                    best = Some((count, gateway));
                }
            }
            match best {
                Some((_, gateway)) => Ok(gateway),
                None if candidates > 0 => Err(Error::ResourceExhausted(
                    "every eligible gateway is at capacity".into(),
                )),
                None => Err(Error::NotFound(match region {
                    Some(r) => format!("no active gateway in region {r}"),
                    None => "no active gateway".into(),
                })),
            }
        }
    }
}

/// Reserve an address on `gateway` for `public_key`, enforcing the per-gateway
/// key uniqueness and peer cap. The pool is written back in both outcomes.
fn reserve_address(
    txn: &WriteTransaction,
    gateway: &GatewayRecord,
    public_key: &str,
) -> Result<Reservation> {
    let keys = txn.open_table(PEER_KEYS)?;
    if keys.get(scoped_key(&gateway.id, public_key).as_str())?.is_some() {
        return Err(Error::Duplicate(format!(
            "public key is already in use on gateway {}",
            gateway.id
        )));
    }
    let addresses = txn.open_table(PEER_ADDRESSES)?;
    if let Some(max) = gateway.max_peers {
        if count_scoped(&addresses, &gateway.id)? >= max as usize {
            return Err(Error::ResourceExhausted(format!(
                "gateway {} is at its cap of {max} peers",
                gateway.id
            )));
        }
    }

    let mut pools = txn.open_table(POOLS)?;
    let mut pool = load_pool(&pools, &gateway.id)?;
    let address = pool.allocate()?;
    save(&mut pools, &gateway.id, &pool)?;

    let taken = addresses
        .get(scoped_key(&gateway.id, &address.to_string()).as_str())?
        .is_some();
    Ok(if taken {
        Reservation::Collided(address)
    } else {
        Reservation::Reserved(address)
    })
}

fn release_address(
    txn: &WriteTransaction,
    gateway_id: &str,
    address: Ipv4Addr,
    generation: u64,
) -> Result<()> {
    let mut pools = txn.open_table(POOLS)?;
    let mut pool = load_pool(&pools, gateway_id)?;
    pool.release_after(address, generation);
    save(&mut pools, gateway_id, &pool)
}

fn index_peer(txn: &WriteTransaction, peer: &PeerRecord) -> Result<()> {
    let mut addresses = txn.open_table(PEER_ADDRESSES)?;
    let addr_key = scoped_key(&peer.gateway_id, &peer.address.to_string());
    addresses.insert(addr_key.as_str(), peer.id.as_str())?;
    let mut keys = txn.open_table(PEER_KEYS)?;
    let key_key = scoped_key(&peer.gateway_id, &peer.public_key);
    keys.insert(key_key.as_str(), peer.id.as_str())?;
    Ok(())
}

fn unindex_peer(txn: &WriteTransaction, peer: &PeerRecord) -> Result<()> {
    let mut addresses = txn.open_table(PEER_ADDRESSES)?;
    addresses.remove(scoped_key(&peer.gateway_id, &peer.address.to_string()).as_str())?;
    let mut keys = txn.open_table(PEER_KEYS)?;
    keys.remove(scoped_key(&peer.gateway_id, &peer.public_key).as_str())?;
    Ok(())
}

fn load_pool<T>(pools: &T, gateway_id: &str) -> Result<AddressPool>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    load(pools, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no address pool")))
}

/// Number of index rows scoped to `gateway_id`.
pub(crate) fn count_scoped<T>(table: &T, gateway_id: &str) -> Result<usize>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let (lo, hi) = scope_bounds(gateway_id);
    let mut n = 0;
    for item in table.range(lo.as_str()..hi.as_str())? {
        item?;
        n += 1;
    }
    Ok(n)
}

fn validate_new_peer(new: &NewPeer) -> Result<()> {
    let name = new.name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "name must be 1–{MAX_NAME_LEN} characters"
        )));
    }
    validate_public_key(&new.public_key)?;
    for cidr in &new.allowed_ips {
        cidr.parse::<IpNet>()
            .map_err(|_| Error::Validation(format!("allowed_ips entry {cidr:?} is not a CIDR")))?;
    }
    for dns in &new.dns_servers {
        dns.parse::<IpAddr>()
            .map_err(|_| Error::Validation(format!("dns server {dns:?} is not an IP address")))?;
    }
    if !(576..=9000).contains(&new.mtu) {
        return Err(Error::Validation(format!("mtu {} is out of range", new.mtu)));
    }
    if let Some(exp) = new.expires_at {
        if exp <= unix_now() {
            return Err(Error::Validation("expires_at must be in the future".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{NewGateway, Protocol, Registration};
    use crate::sync::SyncRecord;

    fn sync_state(store: &Store, gateway_id: &str) -> SyncRecord {
        store.sync_record(gateway_id).unwrap()
    }

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("vpnsync.db")).unwrap();
        (dir, store)
    }

    fn key(n: u8) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([n; 32])
    }

    fn gateway(store: &Store, hostname: &str, cidr: &str) -> GatewayRecord {
        let new = NewGateway {
            hostname: hostname.into(),
            region: "europe".into(),
            country_code: "nl".into(),
            city: None,
            protocol: Protocol::WireGuard,
            listen_port: 51820,
            max_peers: None,
            pool_cidr: cidr.into(),
        };
        let prov = format!("prov-{hostname}");
        let gw = store.create_gateway(new, &prov, &Actor::Admin).unwrap();
        store
            .register_gateway(
                &prov,
                &format!("gwt-{hostname}"),
                Registration {
                    public_key: key(200),
                    public_ip: "203.0.113.10".into(),
                    listen_port: None,
                    obfuscation: None,
                },
            )
            .unwrap();
        store.get_gateway(&gw.id).unwrap()
    }

    fn new_peer(n: u8) -> NewPeer {
        NewPeer {
            id: format!("peer-{n}"),
            name: format!("device {n}"),
            email: None,
            device_name: None,
            device_type: None,
            notes: None,
            public_key: key(n),
            allowed_ips: vec!["0.0.0.0/0".into(), "::/0".into()],
            dns_servers: vec!["1.1.1.1".into()],
            persistent_keepalive: 25,
            mtu: 1420,
            expires_at: None,
            token_hash: format!("client-{n}"),
        }
    }

    #[test]
    fn create_assigns_lowest_address_and_bumps() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.10.0.0/24");
        let placement = Placement::Gateway(gw.id.clone());

        let (p1, _) = store.create_peer(&placement, new_peer(1), &Actor::Admin, 3).unwrap();
        let (p2, _) = store.create_peer(&placement, new_peer(2), &Actor::Admin, 3).unwrap();
        assert_eq!(p1.address, Ipv4Addr::new(10, 10, 0, 1));
        assert_eq!(p2.address, Ipv4Addr::new(10, 10, 0, 2));
        assert_eq!(sync_state(&store, &gw.id).generation, 2);
    }

    #[test]
    fn stale_pool_bitmap_is_repaired_and_retried() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.10.0.0/24");
        let placement = Placement::Gateway(gw.id.clone());
        let (p1, _) = store.create_peer(&placement, new_peer(1), &Actor::Admin, 3).unwrap();

        // Pool forgets .1 while the address index still holds it.
        let txn = store.db.begin_write().unwrap();
        {
            let mut pools = txn.open_table(POOLS).unwrap();
            let fresh = AddressPool::new(&gw.id, "10.10.0.0/24").unwrap();
            save(&mut pools, &gw.id, &fresh).unwrap();
        }
        txn.commit().unwrap();

        let (p2, _) = store.create_peer(&placement, new_peer(2), &Actor::Admin, 3).unwrap();
        assert_eq!(p1.address, Ipv4Addr::new(10, 10, 0, 1));
        assert_eq!(p2.address, Ipv4Addr::new(10, 10, 0, 2));
        assert_eq!(sync_state(&store, &gw.id).generation, 2);

        let txn = store.db.begin_read().unwrap();
        let pools = txn.open_table(POOLS).unwrap();
        let pool = load_pool(&pools, &gw.id).unwrap();
        assert_eq!(pool.used_count(), 2);
    }

    #[test]
    fn stale_pool_with_one_attempt_reports_exhaustion() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.10.0.0/24");
        let placement = Placement::Gateway(gw.id.clone());
        store.create_peer(&placement, new_peer(1), &Actor::Admin, 3).unwrap();

        let txn = store.db.begin_write().unwrap();
        {
            let mut pools = txn.open_table(POOLS).unwrap();
            let fresh = AddressPool::new(&gw.id, "10.10.0.0/24").unwrap();
            save(&mut pools, &gw.id, &fresh).unwrap();
        }
        txn.commit().unwrap();

        let err = store.create_peer(&placement, new_peer(2), &Actor::Admin, 1).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // The repair itself was kept, so the next call succeeds first time.
        let (p2, _) = store.create_peer(&placement, new_peer(2), &Actor::Admin, 1).unwrap();
        assert_eq!(p2.address, Ipv4Addr::new(10, 10, 0, 2));
    }

    #[test]
    fn duplicate_public_key_on_same_gateway_is_rejected() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.10.0.0/24");
        let placement = Placement::Gateway(gw.id.clone());
        store.create_peer(&placement, new_peer(1), &Actor::Admin, 3).unwrap();

        let mut again = new_peer(1);
        again.id = "other".into();
        again.token_hash = "other-hash".into();
        let err = store.create_peer(&placement, again, &Actor::Admin, 3).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
        assert_eq!(sync_state(&store, &gw.id).generation, 1);
    }

    #[test]
    fn unregistered_target_is_rejected_before_allocation() {
        let (_dir, store) = store();
        let new = NewGateway {
            hostname: "gw-new".into(),
            region: "europe".into(),
            country_code: "DE".into(),
            city: None,
            protocol: Protocol::WireGuard,
            listen_port: 51820,
            max_peers: None,
            pool_cidr: "10.20.0.0/30".into(),
        };
        let gw = store.create_gateway(new, "prov", &Actor::Admin).unwrap();
        let err = store
            .create_peer(&Placement::Gateway(gw.id), new_peer(1), &Actor::Admin, 3)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn least_loaded_prefers_emptier_gateway_then_hostname() {
        let (_dir, store) = store();
        let a = gateway(&store, "gw-b", "10.1.0.0/24");
        let b = gateway(&store, "gw-a", "10.2.0.0/24");
        let auto = Placement::LeastLoaded { region: None };

        let (_, first) = store.create_peer(&auto, new_peer(1), &Actor::Admin, 3).unwrap();
        assert_eq!(first.id, b.id);
        let (_, second) = store.create_peer(&auto, new_peer(2), &Actor::Admin, 3).unwrap();
        assert_eq!(second.id, a.id);

        let elsewhere = Placement::LeastLoaded {
            region: Some("asia".into()),
        };
        assert!(matches!(
            store.create_peer(&elsewhere, new_peer(3), &Actor::Admin, 3),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn deleted_address_is_reused_only_after_acknowledgement() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.0.0.0/30");
        let placement = Placement::Gateway(gw.id.clone());
        let (p1, _) = store.create_peer(&placement, new_peer(1), &Actor::Admin, 3).unwrap();
        store.create_peer(&placement, new_peer(2), &Actor::Admin, 3).unwrap();

        store.delete_peer(&p1.id, &Actor::Admin).unwrap();
        assert!(matches!(
            store.create_peer(&placement, new_peer(3), &Actor::Admin, 3),
            Err(Error::ResourceExhausted(_))
        ));

        let generation = sync_state(&store, &gw.id).generation;
        store.acknowledge_sync(&gw.id, generation).unwrap();
        let (p3, _) = store.create_peer(&placement, new_peer(3), &Actor::Admin, 3).unwrap();
        assert_eq!(p3.address, p1.address);
    }

    #[test]
    fn disable_keeps_address_and_is_idempotent() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.0.0.0/24");
        let (p, _) = store
            .create_peer(&Placement::Gateway(gw.id.clone()), new_peer(1), &Actor::Admin, 3)
            .unwrap();

        let disabled = store.set_peer_enabled(&p.id, false, &Actor::Admin).unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.disabled_at.is_some());
        assert_eq!(disabled.address, p.address);
        let generation = sync_state(&store, &gw.id).generation;

        store.set_peer_enabled(&p.id, false, &Actor::Admin).unwrap();
        assert_eq!(sync_state(&store, &gw.id).generation, generation);

        let enabled = store.set_peer_enabled(&p.id, true, &Actor::Admin).unwrap();
        assert!(enabled.enabled && enabled.disabled_at.is_none());
    }

    #[test]
    fn switch_moves_peer_and_bumps_both_gateways() {
        let (_dir, store) = store();
        let a = gateway(&store, "gw-a", "10.1.0.0/24");
        let b = gateway(&store, "gw-b", "10.2.0.0/24");
        let (p, _) = store
            .create_peer(&Placement::Gateway(a.id.clone()), new_peer(1), &Actor::Admin, 3)
            .unwrap();

        let (moved, target) = store.switch_peer(&p.token_hash, &b.id, 3).unwrap();
        assert_eq!(target.id, b.id);
        assert_eq!(moved.gateway_id, b.id);
        assert_eq!(moved.public_key, p.public_key);
        assert_eq!(moved.address, Ipv4Addr::new(10, 2, 0, 1));
        assert_eq!(sync_state(&store, &a.id).generation, 2);
        assert_eq!(sync_state(&store, &b.id).generation, 1);

        assert!(store.gateway_peers(&a.id, unix_now()).unwrap().1.is_empty());
        assert_eq!(store.gateway_peers(&b.id, unix_now()).unwrap().1.len(), 1);
    }

    #[test]
    fn switch_to_full_gateway_changes_nothing() {
        let (_dir, store) = store();
        let a = gateway(&store, "gw-a", "10.1.0.0/24");
        let b = gateway(&store, "gw-b", "10.2.0.0/30");
        let (p, _) = store
            .create_peer(&Placement::Gateway(a.id.clone()), new_peer(1), &Actor::Admin, 3)
            .unwrap();
        for n in 2..4 {
            store
                .create_peer(&Placement::Gateway(b.id.clone()), new_peer(n), &Actor::Admin, 3)
                .unwrap();
        }
        let before_a = sync_state(&store, &a.id);
        let before_b = sync_state(&store, &b.id);

        let err = store.switch_peer(&p.token_hash, &b.id, 3).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(store.get_peer(&p.id).unwrap().gateway_id, a.id);
        assert_eq!(sync_state(&store, &a.id), before_a);
        assert_eq!(sync_state(&store, &b.id), before_b);
    }

    #[test]
    fn switch_rejects_same_gateway_and_bad_tokens() {
        let (_dir, store) = store();
        let a = gateway(&store, "gw-a", "10.1.0.0/24");
        let (p, _) = store
            .create_peer(&Placement::Gateway(a.id.clone()), new_peer(1), &Actor::Admin, 3)
            .unwrap();
        assert!(matches!(
            store.switch_peer(&p.token_hash, &a.id, 3),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.switch_peer("nope", &a.id, 3),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn sweep_disables_expired_peers() {
        let (_dir, store) = store();
        let gw = gateway(&store, "gw-a", "10.0.0.0/24");
        let mut soon = new_peer(1);
        soon.expires_at = Some(unix_now() + 60);
        let (p, _) = store
            .create_peer(&Placement::Gateway(gw.id.clone()), soon, &Actor::Admin, 3)
            .unwrap();
        store
            .create_peer(&Placement::Gateway(gw.id.clone()), new_peer(2), &Actor::Admin, 3)
            .unwrap();

        assert_eq!(store.disable_expired(unix_now()).unwrap(), 0);
        assert_eq!(store.disable_expired(unix_now() + 120).unwrap(), 1);
        assert!(!store.get_peer(&p.id).unwrap().enabled);
        assert_eq!(sync_state(&store, &gw.id).generation, 3);
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let mut bad = new_peer(1);
        bad.public_key = "not-a-key".into();
        assert!(matches!(validate_new_peer(&bad), Err(Error::Validation(_))));

        let mut bad = new_peer(1);
        bad.allowed_ips = vec!["10.0.0.0/33".into()];
        assert!(matches!(validate_new_peer(&bad), Err(Error::Validation(_))));

        let mut bad = new_peer(1);
        bad.name = "  ".into();
        assert!(matches!(validate_new_peer(&bad), Err(Error::Validation(_))));
    }
}
