//! Gateway-side agent for vpnsync.
//!
//! The agent registers once with a provisioning secret, then on every cycle
//! pulls the full peer list, converges the local interface onto it, and
//! reports the generation it applied together with per-peer counters.

pub mod agent;
pub mod client;
pub mod error;
pub mod wg;

pub use agent::{Agent, AgentConfig, CycleReport};
pub use client::ApiClient;
pub use error::{AgentError, Result};
