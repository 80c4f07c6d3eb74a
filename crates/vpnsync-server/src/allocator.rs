//! Per-gateway IPv4 address pools.
//!
//! A pool is a CIDR block plus a bitmap of issued host offsets. Offset 0 (the
//! network address) and the last offset (broadcast) are never issued. Freed
//! offsets do not return to the bitmap immediately: they sit in `pending`
//! tagged with the generation that removed them, and are reclaimed once the
//! owning gateway acknowledges that generation.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

pub const MIN_PREFIX: u8 = 16;
pub const MAX_PREFIX: u8 = 30;

/// Default number of fresh allocation attempts before giving up.
pub const DEFAULT_ALLOCATION_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelease {
    pub offset: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPool {
    pub gateway_id: String,
    pub cidr: String,
    network: u32,
    size: u32,
    used: Vec<u64>,
    pending: Vec<PendingRelease>,
}

impl AddressPool {
    /// Build an empty pool. The CIDR must be IPv4, have no host bits set, and
    /// a prefix between /16 and /30.
    pub fn new(gateway_id: &str, cidr: &str) -> Result<Self> {
        let net = parse_cidr(cidr)?;
        let size = 1u32 << (32 - u32::from(net.prefix_len()));
        let words = size.div_ceil(64) as usize;
        Ok(Self {
            gateway_id: gateway_id.to_owned(),
            cidr: net.to_string(),
            network: u32::from(net.network()),
            size,
            used: vec![0; words],
            pending: Vec::new(),
        })
    }

    /// Number of issuable addresses (network and broadcast excluded).
    pub fn capacity(&self) -> u32 {
        self.size - 2
    }

    pub fn used_count(&self) -> u32 {
        self.used.iter().map(|w| w.count_ones()).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Reserve the lowest free offset.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let offset = (1..self.size - 1)
            .find(|&o| !self.is_used(o))
            .ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "address pool {} for gateway {} is full",
                    self.cidr, self.gateway_id
                ))
            })?;
        self.set(offset, true);
        Ok(self.addr_at(offset))
    }

    /// Mark an address as taken without going through `allocate`. Used when a
    /// collision shows the bitmap lagging behind the address index.
    pub fn mark_used(&mut self, addr: Ipv4Addr) {
        if let Some(offset) = self.offset_of(addr) {
            self.set(offset, true);
        }
    }

    /// Queue `addr` for release once `generation` has been acknowledged.
    pub fn release_after(&mut self, addr: Ipv4Addr, generation: u64) {
        match self.offset_of(addr) {
            Some(offset) if self.is_used(offset) => {
                if !self.pending.iter().any(|p| p.offset == offset) {
                    self.pending.push(PendingRelease { offset, generation });
                }
            }
            _ => warn!(%addr, pool = %self.cidr, "release of an address the pool never issued"),
        }
    }

    /// Return every pending offset whose generation is covered by `acked` to
    /// the free set. Returns how many were reclaimed.
    pub fn reclaim(&mut self, acked: u64) -> usize {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.generation <= acked);
        self.pending = waiting;
        for p in &ready {
            self.set(p.offset, false);
        }
        ready.len()
    }

    fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(addr).checked_sub(self.network)?;
        (offset > 0 && offset < self.size - 1).then_some(offset)
    }

    fn addr_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.network + offset)
    }

    fn is_used(&self, offset: u32) -> bool {
        self.used[(offset / 64) as usize] & (1u64 << (offset % 64)) != 0
    }

    fn set(&mut self, offset: u32, used: bool) {
        let word = &mut self.used[(offset / 64) as usize];
        if used {
            *word |= 1u64 << (offset % 64);
        } else {
            *word &= !(1u64 << (offset % 64));
        }
    }
}

pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{cidr:?} is not an IPv4 CIDR block")))?;
    if net.addr() != net.network() {
        return Err(Error::Validation(format!(
            "{cidr} has host bits set (did you mean {}?)",
            net.trunc()
        )));
    }
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&net.prefix_len()) {
        return Err(Error::Validation(format!(
            "pool prefix must be between /{MIN_PREFIX} and /{MAX_PREFIX}, got /{}",
            net.prefix_len()
        )));
    }
    Ok(net)
}

/// Run `attempt` until it succeeds or fails with something other than an
/// allocation conflict. After `max_attempts` conflicts the pool is reported
/// exhausted.
pub fn with_retries<T>(max_attempts: u32, mut attempt: impl FnMut(u32) -> Result<T>) -> Result<T> {
    let max_attempts = max_attempts.max(1);
    let mut last = String::new();
    for n in 1..=max_attempts {
        match attempt(n) {
            Err(Error::Conflict(reason)) => {
                warn!(attempt = n, %reason, "address allocation conflict, retrying");
                last = reason;
            }
            other => return other,
        }
    }
    Err(Error::ResourceExhausted(format!(
        "no address could be reserved after {max_attempts} attempts: {last}"
    )))
}
