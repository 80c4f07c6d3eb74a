use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sync::SYNC;

pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
pub(crate) const GATEWAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateways");
/// hostname → gateway id
pub(crate) const HOSTNAMES: TableDefinition<&str, &str> = TableDefinition::new("gateway_hostnames");
pub(crate) const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");
pub(crate) const PEERS: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");
/// "gateway_id|address" → peer id
pub(crate) const PEER_ADDRESSES: TableDefinition<&str, &str> =
    TableDefinition::new("peer_addresses");
/// "gateway_id|public_key" → peer id
pub(crate) const PEER_KEYS: TableDefinition<&str, &str> = TableDefinition::new("peer_keys");
/// token hash → TokenEntry
pub(crate) const TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");
pub(crate) const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn(&WriteTransaction) -> Result<()>;

/// Ordered schema migrations; entry `i` upgrades version `i` to `i + 1`.
const MIGRATIONS: &[Migration] = &[create_core_tables, create_token_and_audit_tables];

fn create_core_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(GATEWAYS)?;
    txn.open_table(HOSTNAMES)?;
    txn.open_table(POOLS)?;
    txn.open_table(PEERS)?;
    txn.open_table(PEER_ADDRESSES)?;
    txn.open_table(PEER_KEYS)?;
    txn.open_table(SYNC)?;
    Ok(())
}

fn create_token_and_audit_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(TOKENS)?;
    txn.open_table(AUDIT)?;
    Ok(())
}

pub fn schema_version() -> u64 {
    MIGRATIONS.len() as u64
}

const GATE_OPEN: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Shared decision between a caller waiting on a store call and the call
/// itself: either the call commits or the caller gives up, never both.
#[derive(Clone, Debug, Default)]
pub struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to commit. False once the caller has given up.
    pub fn try_commit(&self) -> bool {
        match self.0.compare_exchange(
            GATE_OPEN,
            GATE_COMMITTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(state) => state == GATE_COMMITTING,
        }
    }

    /// Give up on the call. False if a commit already started, in which case
    /// the caller must wait for its result.
    pub fn cancel(&self) -> bool {
        match self.0.compare_exchange(
            GATE_OPEN,
            GATE_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(state) => state == GATE_CANCELLED,
        }
    }
}

/// Handle to the embedded database. Cheap to clone; every clone shares the
/// same redb instance, whose write transactions are serialized.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    gate: Option<CommitGate>,
}

impl Store {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        let store = Self {
            db: Arc::new(db),
            gate: None,
        };
        store.migrate()?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let target = schema_version();
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            let current = meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0);
            if current > target {
                return Err(Error::Internal(format!(
                    "database schema v{current} is newer than this build understands (v{target})"
                )));
            }
            for (version, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
                migration(&txn)?;
                info!(version = version + 1, "applied schema migration");
            }
            meta.insert(SCHEMA_VERSION_KEY, target)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// A handle whose commits only go through while `gate` is still open.
    pub fn gated(&self, gate: CommitGate) -> Store {
        Store {
            db: Arc::clone(&self.db),
            gate: Some(gate),
        }
    }

    /// Commit `txn`, or abort it if the caller behind this handle's gate has
    /// already given up.
    pub(crate) fn commit(&self, txn: WriteTransaction) -> Result<()> {
        if let Some(gate) = &self.gate {
            if !gate.try_commit() {
                txn.abort()?;
                return Err(Error::TransientStore(
                    "store call abandoned before commit".into(),
                ));
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Stored schema version.
    pub fn current_schema_version(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        Ok(meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Spawn a background task that disables expired peers and prunes audit
    /// entries older than `audit_retention`.
    pub fn spawn_sweep(self, interval: Duration, audit_retention: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let store = self.clone();
                let res = tokio::task::spawn_blocking(move || store.sweep(audit_retention)).await;
                match res {
                    Ok(Ok((disabled, pruned))) => {
                        if disabled > 0 || pruned > 0 {
                            info!(disabled, pruned, "sweep completed");
                        } else {
                            debug!("sweep: nothing to do");
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "sweep failed"),
                    Err(e) => warn!(error = %e, "sweep task panicked"),
                }
            }
        });
    }

    /// One maintenance pass. Returns (peers disabled, audit entries pruned).
    pub fn sweep(&self, audit_retention: Duration) -> Result<(usize, usize)> {
        let now = unix_now();
        let disabled = self.disable_expired(now)?;
        let cutoff = now - audit_retention.as_secs() as i64;
        let pruned = self.prune_audit(cutoff)?;
        Ok((disabled, pruned))
    }
}

// ── Record helpers ────────────────────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Internal(format!("bincode encode: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| Error::Internal(format!("bincode decode: {e}")))?;
    Ok(value)
}

pub(crate) fn load<T, Tbl>(table: &Tbl, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn save<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = encode(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Index key for per-gateway unique columns.
pub(crate) fn scoped_key(gateway_id: &str, value: &str) -> String {
    format!("{gateway_id}|{value}")
}

/// Bounds covering every `scoped_key(gateway_id, _)`.
pub(crate) fn scope_bounds(gateway_id: &str) -> (String, String) {
    (format!("{gateway_id}|"), format!("{gateway_id}}}"))
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_runs_all_migrations_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnsync.db");
        let store = Store::open(&path).unwrap();
        assert_eq!(store.current_schema_version().unwrap(), schema_version());
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.current_schema_version().unwrap(), schema_version());
    }

    #[test]
    fn refuses_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnsync.db");
        {
            let store = Store::open(&path).unwrap();
            let txn = store.db.begin_write().unwrap();
            {
                let mut meta = txn.open_table(META).unwrap();
                meta.insert(SCHEMA_VERSION_KEY, schema_version() + 5).unwrap();
            }
            txn.commit().unwrap();
        }
        assert!(matches!(Store::open(&path), Err(Error::Internal(_))));
    }

    #[test]
    fn gate_admits_commit_or_cancel_but_not_both() {
        let gate = CommitGate::new();
        assert!(gate.try_commit());
        assert!(gate.try_commit());
        assert!(!gate.cancel());

        let gate = CommitGate::new();
        assert!(gate.cancel());
        assert!(gate.cancel());
        assert!(!gate.try_commit());
    }

    #[test]
    fn cancelled_gate_discards_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("vpnsync.db")).unwrap();
        let gate = CommitGate::new();
        let gated = store.gated(gate.clone());
        assert!(gate.cancel());

        let txn = gated.db.begin_write().unwrap();
        {
            let mut meta = txn.open_table(META).unwrap();
            meta.insert("marker", 7).unwrap();
        }
        assert!(matches!(gated.commit(txn), Err(Error::TransientStore(_))));

        let txn = store.db.begin_read().unwrap();
        let meta = txn.open_table(META).unwrap();
        assert!(meta.get("marker").unwrap().is_none());
    }

    #[test]
    fn scope_bounds_cover_scoped_keys_only() {
        let (lo, hi) = scope_bounds("gw-a");
        let inside = scoped_key("gw-a", "10.0.0.1");
        let other = scoped_key("gw-ab", "10.0.0.1");
        assert!(lo.as_str() <= inside.as_str() && inside.as_str() < hi.as_str());
        assert!(!(lo.as_str() <= other.as_str() && other.as_str() < hi.as_str()));
    }
}
