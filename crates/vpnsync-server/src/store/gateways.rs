use redb::{ReadableTable, WriteTransaction};
use tracing::info;

use super::audit;
use super::peers::expire_peers;
use super::db::{
    load, save, scope_bounds, scoped_key, unix_now, Store, GATEWAYS, HOSTNAMES, PEERS,
    PEER_ADDRESSES, PEER_KEYS, POOLS, TOKENS,
};
use super::model::{
    Actor, GatewayRecord, NewGateway, PeerRecord, PeerStatus, Protocol, Registration, TokenEntry,
};
use crate::allocator::AddressPool;
use crate::error::{Error, Result};
use crate::keys::TokenKind;
use crate::sync::{self, Ack, AckOutcome, SyncRecord};

impl Store {
    /// Provision a gateway and its address pool. The gateway stays
    /// unregistered until it presents the provisioning secret hashed here.
    pub fn create_gateway(
        &self,
        new: NewGateway,
        provisioning_hash: &str,
        actor: &Actor,
    ) -> Result<GatewayRecord> {
        let hostname = new.hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() || hostname.len() > 253 {
            return Err(Error::Validation("hostname must be 1–253 characters".into()));
        }
        if new.region.trim().is_empty() {
            return Err(Error::Validation("region is required".into()));
        }
        if new.listen_port == 0 {
            return Err(Error::Validation("listen_port must be non-zero".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let pool = AddressPool::new(&id, &new.pool_cidr)?;
        let now = unix_now();
        let gateway = GatewayRecord {
            id: id.clone(),
            hostname: hostname.clone(),
            region: new.region.trim().to_ascii_lowercase(),
            country_code: new.country_code.trim().to_ascii_uppercase(),
            city: new.city,
            protocol: new.protocol,
            public_ip: None,
            listen_port: new.listen_port,
            public_key: None,
            obfuscation: None,
            max_peers: new.max_peers,
            provisioning_hash: Some(provisioning_hash.to_owned()),
            token_hash: None,
            retired: false,
            created_at: now,
            registered_at: None,
            retired_at: None,
        };

        let txn = self.db.begin_write()?;
        {
            let mut hostnames = txn.open_table(HOSTNAMES)?;
            if hostnames.get(hostname.as_str())?.is_some() {
                return Err(Error::Duplicate(format!("hostname {hostname} is already provisioned")));
            }
            hostnames.insert(hostname.as_str(), id.as_str())?;

            let mut gateways = txn.open_table(GATEWAYS)?;
            save(&mut gateways, &id, &gateway)?;

            let mut pools = txn.open_table(POOLS)?;
            save(&mut pools, &id, &pool)?;

            let mut tokens = txn.open_table(TOKENS)?;
            save(
                &mut tokens,
                provisioning_hash,
                &TokenEntry {
                    kind: TokenKind::Provisioning,
                    subject_id: id.clone(),
                    issued_at: now,
                    used_at: None,
                },
            )?;
        }
        sync::init(&txn, &id)?;
        audit::append(
            &txn,
            actor,
            "gateway.create",
            &id,
            None,
            Some(format!("hostname={hostname} pool={}", pool.cidr)),
        )?;
        self.commit(txn)?;
        Ok(gateway)
    }

    /// Replace the gateway's provisioning secret, e.g. after the host was
    /// rebuilt. Any earlier unused secret stops working.
    pub fn reissue_provisioning(
        &self,
        gateway_id: &str,
        provisioning_hash: &str,
        actor: &Actor,
    ) -> Result<GatewayRecord> {
        let txn = self.db.begin_write()?;
        let gateway = {
            let mut gateways = txn.open_table(GATEWAYS)?;
            let mut gateway: GatewayRecord = load(&gateways, gateway_id)?
                .ok_or_else(|| Error::NotFound(format!("gateway {gateway_id}")))?;
            if gateway.retired {
                return Err(Error::Validation(format!("gateway {gateway_id} is retired")));
            }

            let mut tokens = txn.open_table(TOKENS)?;
            if let Some(old) = gateway.provisioning_hash.take() {
                tokens.remove(old.as_str())?;
            }
            save(
                &mut tokens,
                provisioning_hash,
                &TokenEntry {
                    kind: TokenKind::Provisioning,
                    subject_id: gateway_id.to_owned(),
                    issued_at: unix_now(),
                    used_at: None,
                },
            )?;
            gateway.provisioning_hash = Some(provisioning_hash.to_owned());
            save(&mut gateways, gateway_id, &gateway)?;
            gateway
        };
        audit::append(&txn, actor, "gateway.reprovision", gateway_id, None, None)?;
        self.commit(txn)?;
        Ok(gateway)
    }

    /// Exchange a provisioning secret for a gateway token. The secret is
    /// tombstoned, any previous gateway token is revoked, and the gateway's
    /// acknowledged generation restarts at zero.
    pub fn register_gateway(
        &self,
        provisioning_hash: &str,
        gateway_token_hash: &str,
        reg: Registration,
    ) -> Result<(GatewayRecord, SyncRecord)> {
        crate::keys::validate_public_key(&reg.public_key)?;
        if reg.public_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::Validation(format!("public_ip {:?} is not an IP address", reg.public_ip)));
        }
        let now = unix_now();
        let txn = self.db.begin_write()?;
        let (gateway, before) = {
            let mut tokens = txn.open_table(TOKENS)?;
            let mut entry: TokenEntry = load(&tokens, provisioning_hash)?
                .filter(|e: &TokenEntry| e.kind == TokenKind::Provisioning)
                .ok_or_else(|| Error::Auth("unknown provisioning secret".into()))?;
            if entry.used_at.is_some() {
                return Err(Error::Auth("provisioning secret already used".into()));
            }

            let mut gateways = txn.open_table(GATEWAYS)?;
            let mut gateway: GatewayRecord = load(&gateways, &entry.subject_id)?
                .ok_or_else(|| Error::Auth("unknown provisioning secret".into()))?;
            if gateway.retired {
                return Err(Error::Auth("gateway is retired".into()));
            }
            if gateway.provisioning_hash.as_deref() != Some(provisioning_hash) {
                return Err(Error::Auth("provisioning secret was superseded".into()));
            }
            if gateway.protocol == Protocol::AmneziaWg
                && reg.obfuscation.is_none()
                && gateway.obfuscation.is_none()
            {
                return Err(Error::Validation(
                    "amneziawg gateways must report obfuscation parameters".into(),
                ));
            }
            if gateway.protocol != Protocol::AmneziaWg && reg.obfuscation.is_some() {
                return Err(Error::Validation(format!(
                    "obfuscation parameters are only valid on amneziawg gateways, not {}",
                    gateway.protocol.as_str()
                )));
            }

            let before = format!(
                "registered={} public_key={}",
                gateway.is_registered(),
                gateway.public_key.as_deref().unwrap_or("-")
            );

            entry.used_at = Some(now);
            save(&mut tokens, provisioning_hash, &entry)?;
            if let Some(old) = gateway.token_hash.take() {
                tokens.remove(old.as_str())?;
            }
            save(
                &mut tokens,
                gateway_token_hash,
                &TokenEntry {
                    kind: TokenKind::Gateway,
                    subject_id: gateway.id.clone(),
                    issued_at: now,
                    used_at: None,
                },
            )?;

            gateway.provisioning_hash = None;
            gateway.token_hash = Some(gateway_token_hash.to_owned());
            gateway.public_key = Some(reg.public_key);
            gateway.public_ip = Some(reg.public_ip);
            if let Some(port) = reg.listen_port {
                gateway.listen_port = port;
            }
            if reg.obfuscation.is_some() {
                gateway.obfuscation = reg.obfuscation;
            }
            gateway.registered_at = Some(now);
            save(&mut gateways, &gateway.id.clone(), &gateway)?;
            (gateway, before)
        };
        let sync = sync::reset_for_registration(&txn, &gateway.id)?;
        audit::append(
            &txn,
            &Actor::Gateway(gateway.id.clone()),
            "gateway.register",
            &gateway.id,
            Some(before),
            Some(format!(
                "public_ip={} port={}",
                gateway.public_ip.as_deref().unwrap_or("-"),
                gateway.listen_port
            )),
        )?;
        self.commit(txn)?;
        info!(gateway_id = %gateway.id, hostname = %gateway.hostname, "gateway registered");
        Ok((gateway, sync))
    }

    /// Resolve a gateway bearer token. Retired gateways are refused.
    pub fn gateway_by_token(&self, token_hash: &str) -> Result<GatewayRecord> {
        let txn = self.db.begin_read()?;
        let tokens = txn.open_table(TOKENS)?;
        let entry: TokenEntry = load(&tokens, token_hash)?
            .filter(|e: &TokenEntry| e.kind == TokenKind::Gateway)
            .ok_or_else(|| Error::Auth("invalid gateway token".into()))?;
        let gateways = txn.open_table(GATEWAYS)?;
        let gateway: GatewayRecord = load(&gateways, &entry.subject_id)?
            .ok_or_else(|| Error::Auth("invalid gateway token".into()))?;
        if gateway.retired {
            return Err(Error::Auth("gateway is retired".into()));
        }
        Ok(gateway)
    }

    pub fn get_gateway(&self, gateway_id: &str) -> Result<GatewayRecord> {
        let txn = self.db.begin_read()?;
        let gateways = txn.open_table(GATEWAYS)?;
        load(&gateways, gateway_id)?.ok_or_else(|| Error::NotFound(format!("gateway {gateway_id}")))
    }

    pub fn sync_record(&self, gateway_id: &str) -> Result<SyncRecord> {
        let txn = self.db.begin_read()?;
        sync::read(&txn, gateway_id)
    }

    pub fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        let txn = self.db.begin_read()?;
        let gateways = txn.open_table(GATEWAYS)?;
        let mut out = Vec::new();
        for item in gateways.iter()? {
            let (_, v) = item?;
            out.push(super::db::decode::<GatewayRecord>(v.value())?);
        }
        out.sort_by(|a, b| (&a.region, &a.hostname).cmp(&(&b.region, &b.hostname)));
        Ok(out)
    }

    /// Decommission a gateway. Its peers stay on record for auditing, its
    /// token stops working, and it is never offered as a target again.
    pub fn retire_gateway(&self, gateway_id: &str, actor: &Actor) -> Result<GatewayRecord> {
        let txn = self.db.begin_write()?;
        let gateway = {
            let mut gateways = txn.open_table(GATEWAYS)?;
            let mut gateway: GatewayRecord = load(&gateways, gateway_id)?
                .ok_or_else(|| Error::NotFound(format!("gateway {gateway_id}")))?;
            if gateway.retired {
                return Ok(gateway);
            }
            gateway.retired = true;
            gateway.retired_at = Some(unix_now());
            if let Some(hash) = gateway.provisioning_hash.take() {
                let mut tokens = txn.open_table(TOKENS)?;
                tokens.remove(hash.as_str())?;
            }
            save(&mut gateways, gateway_id, &gateway)?;
            gateway
        };
        audit::append(
            &txn,
            actor,
            "gateway.retire",
            gateway_id,
            Some("retired=false".into()),
            Some("retired=true".into()),
        )?;
        self.commit(txn)?;
        Ok(gateway)
    }

    /// The full desired peer list for a gateway, ordered by address, together
    /// with the generation it corresponds to. Peers whose expiry has passed by
    /// `now` are disabled (and the generation bumped) before the list is read,
    /// so one generation always maps to one list. The common case needs only a
    /// read transaction and never blocks writers.
    pub fn gateway_peers(&self, gateway_id: &str, now: i64) -> Result<(u64, Vec<PeerRecord>)> {
        {
            let txn = self.db.begin_read()?;
            let sync = sync::read(&txn, gateway_id)?;
            let addresses = txn.open_table(PEER_ADDRESSES)?;
            let peers = txn.open_table(PEERS)?;
            let list = scoped_peers(&addresses, &peers, gateway_id)?;
            if !list.iter().any(|p| p.enabled && p.is_expired(now)) {
                return Ok((sync.generation, list));
            }
        }

        let txn = self.db.begin_write()?;
        let mut expired: Vec<PeerRecord> = {
            let addresses = txn.open_table(PEER_ADDRESSES)?;
            let peers = txn.open_table(PEERS)?;
            scoped_peers(&addresses, &peers, gateway_id)?
                .into_iter()
                .filter(|p| p.enabled && p.is_expired(now))
                .collect()
        };
        expire_peers(&txn, &mut expired, now)?;
        let generation = sync::current(&txn, gateway_id)?.generation;
        let list = {
            let addresses = txn.open_table(PEER_ADDRESSES)?;
            let peers = txn.open_table(PEERS)?;
            scoped_peers(&addresses, &peers, gateway_id)?
        };
        self.commit(txn)?;
        if !expired.is_empty() {
            info!(gateway_id, expired = expired.len(), generation, "expired peers on pull");
        }
        Ok((generation, list))
    }

    /// Record the generation a gateway has applied. Once acknowledged,
    /// addresses released at or before that generation become reusable.
    pub fn acknowledge_sync(&self, gateway_id: &str, generation: u64) -> Result<Ack> {
        let txn = self.db.begin_write()?;
        let ack = sync::acknowledge(&txn, gateway_id, generation, unix_now())?;
        if let AckOutcome::Advanced { from } = ack.outcome {
            let reclaimed = reclaim_addresses(&txn, gateway_id, ack.acked_generation)?;
            audit::append(
                &txn,
                &Actor::Gateway(gateway_id.to_owned()),
                "gateway.sync",
                gateway_id,
                Some(format!("acked_generation={from}")),
                Some(format!(
                    "acked_generation={} reclaimed_addresses={reclaimed}",
                    ack.acked_generation
                )),
            )?;
        }
        self.commit(txn)?;
        Ok(ack)
    }

    /// Store handshake and traffic counters reported by a gateway. Unknown
    /// public keys are skipped. Returns how many peers were updated.
    pub fn update_peer_status(&self, gateway_id: &str, statuses: &[PeerStatus]) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let updated = {
            let keys = txn.open_table(PEER_KEYS)?;
            let mut peers = txn.open_table(PEERS)?;
            let mut updated = 0;
            for status in statuses {
                let key = scoped_key(gateway_id, &status.public_key);
                let Some(peer_id) = keys.get(key.as_str())?.map(|g| g.value().to_owned()) else {
                    continue;
                };
                let Some(mut peer) = load::<PeerRecord, _>(&peers, &peer_id)? else {
                    continue;
                };
                if status.last_handshake.is_some() {
                    peer.last_handshake = status.last_handshake;
                }
                peer.rx_bytes = status.rx_bytes;
                peer.tx_bytes = status.tx_bytes;
                save(&mut peers, &peer_id, &peer)?;
                updated += 1;
            }
            updated
        };
        self.commit(txn)?;
        Ok(updated)
    }
}

pub(crate) fn reclaim_addresses(txn: &WriteTransaction, gateway_id: &str, acked: u64) -> Result<usize> {
    let mut pools = txn.open_table(POOLS)?;
    let mut pool: AddressPool = load(&pools, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no address pool")))?;
    let reclaimed = pool.reclaim(acked);
    if reclaimed > 0 {
        save(&mut pools, gateway_id, &pool)?;
    }
    Ok(reclaimed)
}

/// Every peer indexed under `gateway_id`, ordered by address.
fn scoped_peers<A, P>(addresses: &A, peers: &P, gateway_id: &str) -> Result<Vec<PeerRecord>>
where
    A: ReadableTable<&'static str, &'static str>,
    P: ReadableTable<&'static str, &'static [u8]>,
{
    let (lo, hi) = scope_bounds(gateway_id);
    let mut out = Vec::new();
    for item in addresses.range(lo.as_str()..hi.as_str())? {
        let (_, peer_id) = item?;
        let peer: PeerRecord = load(peers, peer_id.value())?.ok_or_else(|| {
            Error::Internal(format!("address index points at missing peer {}", peer_id.value()))
        })?;
        out.push(peer);
    }
    out.sort_by_key(|p| u32::from(p.address));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{NewPeer, Obfuscation, Placement};
    use crate::store::AuditQuery;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("vpnsync.db")).unwrap();
        (dir, store)
    }

    fn key(n: u8) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([n; 32])
    }

    fn new_gateway(hostname: &str) -> NewGateway {
        NewGateway {
            hostname: hostname.into(),
            region: "Europe".into(),
            country_code: "nl".into(),
            city: Some("Amsterdam".into()),
            protocol: Protocol::WireGuard,
            listen_port: 51820,
            max_peers: None,
            pool_cidr: "10.66.0.0/24".into(),
        }
    }

    fn registration() -> Registration {
        Registration {
            public_key: key(9),
            public_ip: "198.51.100.4".into(),
            listen_port: Some(51821),
            obfuscation: None,
        }
    }

    fn add_peer(store: &Store, gateway_id: &str, n: u8) -> PeerRecord {
        let new = NewPeer {
            id: format!("peer-{n}"),
            name: format!("device {n}"),
            email: None,
            device_name: None,
            device_type: None,
            notes: None,
            public_key: key(n),
            allowed_ips: vec!["0.0.0.0/0".into()],
            dns_servers: vec!["1.1.1.1".into()],
            persistent_keepalive: 25,
            mtu: 1420,
            expires_at: None,
            token_hash: format!("client-{n}"),
        };
        store
            .create_peer(&Placement::Gateway(gateway_id.into()), new, &Actor::Admin, 3)
            .unwrap()
            .0
    }

    #[test]
    fn hostnames_are_unique() {
        let (_dir, store) = store();
        store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        let err = store
            .create_gateway(new_gateway("GW-1"), "p2", &Actor::Admin)
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn provisioning_secret_is_single_use() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        assert_eq!(gw.region, "europe");
        assert_eq!(gw.country_code, "NL");

        let (registered, sync) = store.register_gateway("p1", "t1", registration()).unwrap();
        assert!(registered.is_registered());
        assert_eq!(registered.listen_port, 51821);
        assert_eq!(sync.acked_generation, 0);

        let err = store.register_gateway("p1", "t2", registration()).unwrap_err();
        assert!(matches!(err, Error::Auth(ref m) if m.contains("already used")));
        assert!(matches!(store.register_gateway("nope", "t3", registration()), Err(Error::Auth(_))));
        assert_eq!(store.gateway_by_token("t1").unwrap().id, gw.id);
    }

    #[test]
    fn reprovisioning_resets_acknowledgement_and_revokes_old_token() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        add_peer(&store, &gw.id, 1);
        store.acknowledge_sync(&gw.id, 1).unwrap();

        store.reissue_provisioning(&gw.id, "p2", &Actor::Admin).unwrap();
        let (_, sync) = store.register_gateway("p2", "t2", registration()).unwrap();
        assert_eq!(sync.generation, 1);
        assert_eq!(sync.acked_generation, 0);
        assert!(matches!(store.gateway_by_token("t1"), Err(Error::Auth(_))));
        assert!(store.gateway_by_token("t2").is_ok());
    }

    #[test]
    fn obfuscation_is_refused_on_wireguard_gateways() {
        let (_dir, store) = store();
        store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        let mut reg = registration();
        reg.obfuscation = Some(Obfuscation {
            jc: 4,
            jmin: 40,
            jmax: 70,
            s1: 0,
            s2: 0,
            h1: 1,
            h2: 2,
            h3: 3,
            h4: 4,
        });
        let err = store.register_gateway("p1", "t1", reg).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.register_gateway("p1", "t1", registration()).is_ok());
    }

    #[test]
    fn superseded_secret_is_refused() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.reissue_provisioning(&gw.id, "p2", &Actor::Admin).unwrap();
        assert!(matches!(store.register_gateway("p1", "t1", registration()), Err(Error::Auth(_))));
        assert!(store.register_gateway("p2", "t1", registration()).is_ok());
    }

    #[test]
    fn retired_gateway_is_locked_out() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        let retired = store.retire_gateway(&gw.id, &Actor::Admin).unwrap();
        assert!(retired.retired && retired.retired_at.is_some());
        assert!(matches!(store.gateway_by_token("t1"), Err(Error::Auth(_))));
        assert!(matches!(
            store.reissue_provisioning(&gw.id, "p2", &Actor::Admin),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn acknowledgements_never_regress() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        for n in 1..=3 {
            add_peer(&store, &gw.id, n);
        }

        let ack = store.acknowledge_sync(&gw.id, 3).unwrap();
        assert_eq!(ack.outcome, AckOutcome::Advanced { from: 0 });
        let ack = store.acknowledge_sync(&gw.id, 2).unwrap();
        assert_eq!(ack.outcome, AckOutcome::Stale);
        assert_eq!(ack.acked_generation, 3);
        assert_eq!(store.acknowledge_sync(&gw.id, 3).unwrap().outcome, AckOutcome::Unchanged);
        assert!(matches!(store.acknowledge_sync(&gw.id, 4), Err(Error::Validation(_))));
    }

    #[test]
    fn pulls_without_mutation_are_identical() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        add_peer(&store, &gw.id, 1);
        add_peer(&store, &gw.id, 2);

        let (g1, first) = store.gateway_peers(&gw.id, unix_now()).unwrap();
        let (g2, second) = store.gateway_peers(&gw.id, unix_now()).unwrap();
        assert_eq!(g1, g2);
        let keys = |ps: &[PeerRecord]| ps.iter().map(|p| (p.public_key.clone(), p.address)).collect::<Vec<_>>();
        assert_eq!(keys(&first[..]), keys(&second[..]));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn expiry_between_pulls_bumps_the_generation() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        let now = unix_now();
        let new = NewPeer {
            id: "short-lived".into(),
            name: "guest".into(),
            email: None,
            device_name: None,
            device_type: None,
            notes: None,
            public_key: key(7),
            allowed_ips: vec!["0.0.0.0/0".into()],
            dns_servers: vec!["1.1.1.1".into()],
            persistent_keepalive: 25,
            mtu: 1420,
            expires_at: Some(now + 60),
            token_hash: "client-7".into(),
        };
        store
            .create_peer(&Placement::Gateway(gw.id.clone()), new, &Actor::Admin, 3)
            .unwrap();

        let (g1, first) = store.gateway_peers(&gw.id, now).unwrap();
        let (g2, second) = store.gateway_peers(&gw.id, now).unwrap();
        assert_eq!((g1, g2), (1, 1));
        assert!(first[0].enabled && second[0].enabled);

        let later = now + 120;
        let (g3, third) = store.gateway_peers(&gw.id, later).unwrap();
        assert_eq!(g3, 2);
        assert!(!third[0].enabled);
        assert_eq!(third[0].disabled_at, Some(later));

        let (g4, fourth) = store.gateway_peers(&gw.id, later + 5).unwrap();
        assert_eq!(g4, 2);
        assert!(!fourth[0].enabled);
        assert_eq!(store.disable_expired(later + 5).unwrap(), 0);

        let events = store
            .audit(&AuditQuery {
                action: Some("peer.expire".into()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, Actor::System.to_string());
    }

    #[test]
    fn status_report_updates_counters_without_bumping() {
        let (_dir, store) = store();
        let gw = store.create_gateway(new_gateway("gw-1"), "p1", &Actor::Admin).unwrap();
        store.register_gateway("p1", "t1", registration()).unwrap();
        let peer = add_peer(&store, &gw.id, 1);

        let updated = store
            .update_peer_status(
                &gw.id,
                &[
                    PeerStatus {
                        public_key: peer.public_key.clone(),
                        last_handshake: Some(1_700_000_000),
                        rx_bytes: 10,
                        tx_bytes: 20,
                    },
                    PeerStatus {
                        public_key: key(77),
                        last_handshake: None,
                        rx_bytes: 1,
                        tx_bytes: 1,
                    },
                ],
            )
            .unwrap();
        assert_eq!(updated, 1);
        let stored = store.get_peer(&peer.id).unwrap();
        assert_eq!((stored.rx_bytes, stored.tx_bytes), (10, 20));
        assert_eq!(stored.last_handshake, Some(1_700_000_000));
        assert_eq!(store.sync_record(&gw.id).unwrap().generation, 1);
    }
}
