//! Per-gateway sync state.
//!
//! Every peer mutation under a gateway bumps that gateway's generation; the
//! gateway pulls the full peer list, applies it, and reports the generation it
//! applied. This module is the only code that writes the `sync` table, and it
//! only ever does so inside a caller's write transaction, so a bump commits or
//! aborts together with the mutation that caused it.

use redb::{ReadTransaction, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::db::{load, save};
use crate::store::GatewayRecord;

pub(crate) const SYNC: TableDefinition<&str, &[u8]> = TableDefinition::new("sync");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub generation: u64,
    pub acked_generation: u64,
    pub last_synced_at: Option<i64>,
    /// Whether the gateway reported at least once since it last registered.
    pub synced_since_registration: bool,
}

impl SyncRecord {
    pub fn in_sync(&self) -> bool {
        self.acked_generation == self.generation
    }

    /// Seconds since the last accepted report, if any.
    pub fn staleness(&self, now: i64) -> Option<i64> {
        self.last_synced_at.map(|t| (now - t).max(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayState {
    Unregistered,
    Registered,
    InSync,
    Pending,
    Retired,
}

pub fn state_of(gateway: &GatewayRecord, sync: &SyncRecord) -> GatewayState {
    if gateway.retired {
        GatewayState::Retired
    } else if !gateway.is_registered() {
        GatewayState::Unregistered
    } else if !sync.in_sync() {
        GatewayState::Pending
    } else if !sync.synced_since_registration {
        GatewayState::Registered
    } else {
        GatewayState::InSync
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// The acknowledged generation moved forward.
    Advanced { from: u64 },
    /// The report repeated the current acknowledgment.
    Unchanged,
    /// The report was older than what is already acknowledged and was ignored.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub outcome: AckOutcome,
    pub generation: u64,
    pub acked_generation: u64,
}

// ── Transactional operations ──────────────────────────────────────────────────

pub(crate) fn init(txn: &WriteTransaction, gateway_id: &str) -> Result<()> {
    let mut table = txn.open_table(SYNC)?;
    save(&mut table, gateway_id, &SyncRecord::default())
}

pub(crate) fn read(txn: &ReadTransaction, gateway_id: &str) -> Result<SyncRecord> {
    let table = txn.open_table(SYNC)?;
    load(&table, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no sync record")))
}

pub(crate) fn current(txn: &WriteTransaction, gateway_id: &str) -> Result<SyncRecord> {
    let table = txn.open_table(SYNC)?;
    load(&table, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no sync record")))
}

/// Advance the gateway's generation by one and return the new value.
pub(crate) fn bump(txn: &WriteTransaction, gateway_id: &str) -> Result<u64> {
    let mut table = txn.open_table(SYNC)?;
    let mut rec: SyncRecord = load(&table, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no sync record")))?;
    rec.generation = rec
        .generation
        .checked_add(1)
        .ok_or_else(|| Error::Internal(format!("generation overflow on {gateway_id}")))?;
    save(&mut table, gateway_id, &rec)?;
    Ok(rec.generation)
}

/// A (re-)registered gateway starts from an empty local state, so nothing it
/// acknowledged before counts any more. The generation itself is kept.
pub(crate) fn reset_for_registration(txn: &WriteTransaction, gateway_id: &str) -> Result<SyncRecord> {
    let mut table = txn.open_table(SYNC)?;
    let mut rec: SyncRecord = load(&table, gateway_id)?.unwrap_or_default();
    rec.acked_generation = 0;
    rec.synced_since_registration = false;
    save(&mut table, gateway_id, &rec)?;
    Ok(rec)
}

/// Record that the gateway applied `reported`. Reports never move the
/// acknowledgment backwards, and a report beyond the current generation is
/// rejected.
pub(crate) fn acknowledge(
    txn: &WriteTransaction,
    gateway_id: &str,
    reported: u64,
    now: i64,
) -> Result<Ack> {
    let mut table = txn.open_table(SYNC)?;
    let mut rec: SyncRecord = load(&table, gateway_id)?
        .ok_or_else(|| Error::Internal(format!("gateway {gateway_id} has no sync record")))?;

    if reported > rec.generation {
        return Err(Error::Validation(format!(
            "reported generation {reported} is ahead of current generation {}",
            rec.generation
        )));
    }

    let outcome = if reported < rec.acked_generation {
        AckOutcome::Stale
    } else if reported == rec.acked_generation {
        AckOutcome::Unchanged
    } else {
        AckOutcome::Advanced {
            from: rec.acked_generation,
        }
    };

    if outcome != AckOutcome::Stale {
        rec.acked_generation = reported;
        rec.last_synced_at = Some(now);
        rec.synced_since_registration = true;
        save(&mut table, gateway_id, &rec)?;
    }

    Ok(Ack {
        outcome,
        generation: rec.generation,
        acked_generation: rec.acked_generation,
    })
}
