use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::db::{decode, encode, unix_now, Store, AUDIT, META};
use super::model::Actor;
use crate::error::{Error, Result};

/// META key holding the last audit id handed out; ids are never reused.
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// One immutable audit record. Entries are only ever appended, or dropped as
/// a whole by retention pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub at: i64,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub limit: usize,
    /// Only entries with an id strictly below this one (for paging backwards).
    pub before_id: Option<u64>,
    pub action: Option<String>,
}

/// Append an entry inside the caller's transaction so it commits or aborts
/// with the change it describes.
pub(crate) fn append(
    txn: &WriteTransaction,
    actor: &Actor,
    action: &str,
    target: &str,
    before: Option<String>,
    after: Option<String>,
) -> Result<u64> {
    let mut table = txn.open_table(AUDIT)?;
    let mut meta = txn.open_table(META)?;
    // Databases written before the counter existed fall back to the newest id.
    let last = match meta.get(AUDIT_SEQ_KEY)?.map(|v| v.value()) {
        Some(seq) => seq,
        None => table.last()?.map(|(k, _)| k.value()).unwrap_or(0),
    };
    let id = last
        .checked_add(1)
        .ok_or_else(|| Error::Internal("audit id overflow".into()))?;
    meta.insert(AUDIT_SEQ_KEY, id)?;
    let event = AuditEvent {
        id,
        at: unix_now(),
        actor: actor.to_string(),
        action: action.to_owned(),
        target: target.to_owned(),
        before,
        after,
    };
    let bytes = encode(&event)?;
    table.insert(id, bytes.as_slice())?;
    info!(actor = %actor, target, "audit: {action}");
    Ok(id)
}

impl Store {
    /// Newest-first page of audit entries.
    pub fn audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let limit = if query.limit == 0 { 100 } else { query.limit.min(1000) };
        let txn = self.db.begin_read()?;
        let table = txn.open_table(AUDIT)?;

        let upper = query.before_id.unwrap_or(u64::MAX);
        let mut events = Vec::new();
        for item in table.range(..upper)?.rev() {
            let (_, v) = item?;
            let event: AuditEvent = decode(v.value())?;
            if let Some(action) = &query.action {
                if &event.action != action {
                    continue;
                }
            }
            events.push(event);
            if events.len() >= limit {
                break;
            }
        }
        Ok(events)
    }

    /// Drop entries recorded before `cutoff` (unix seconds).
    pub fn prune_audit(&self, cutoff: i64) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let pruned = {
            let mut table = txn.open_table(AUDIT)?;
            let mut expired = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let event: AuditEvent = decode(v.value())?;
                if event.at >= cutoff {
                    break;
                }
                expired.push(k.value());
            }
            for id in &expired {
                table.remove(*id)?;
            }
            expired.len()
        };
        self.commit(txn)?;
        Ok(pruned)
    }
}
