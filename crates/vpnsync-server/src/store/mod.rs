pub mod audit;
pub mod db;
pub mod gateways;
pub mod model;
pub mod peers;
pub mod stats;

pub use audit::{AuditEvent, AuditQuery};
pub use db::{unix_now, CommitGate, Store};
pub use model::{
    Actor, GatewayRecord, NewGateway, NewPeer, Obfuscation, PeerRecord, PeerStatus, Placement,
    Protocol, Registration, TokenEntry,
};
pub use stats::{GatewayOverview, PoolUsage, Stats, CONNECTED_WINDOW_SECS};
