use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::keys::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    WireGuard,
    AmneziaWg,
    OpenVpn,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::WireGuard => "wireguard",
            Protocol::AmneziaWg => "amneziawg",
            Protocol::OpenVpn => "openvpn",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wireguard" => Ok(Protocol::WireGuard),
            "amneziawg" => Ok(Protocol::AmneziaWg),
            "openvpn" => Ok(Protocol::OpenVpn),
            other => Err(format!(
                "unknown protocol {other:?} (expected wireguard, amneziawg or openvpn)"
            )),
        }
    }
}

/// AmneziaWG junk-packet and header obfuscation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obfuscation {
    pub jc: u32,
    pub jmin: u32,
    pub jmax: u32,
    pub s1: u32,
    pub s2: u32,
    pub h1: u32,
    pub h2: u32,
    pub h3: u32,
    pub h4: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: String,
    pub hostname: String,
    pub region: String,
    pub country_code: String,
    pub city: Option<String>,
    pub protocol: Protocol,
    pub public_ip: Option<String>,
    pub listen_port: u16,
    pub public_key: Option<String>,
    pub obfuscation: Option<Obfuscation>,
    pub max_peers: Option<u32>,
    /// Hash of the provisioning secret that may register this gateway next.
    pub provisioning_hash: Option<String>,
    pub token_hash: Option<String>,
    pub retired: bool,
    pub created_at: i64,
    pub registered_at: Option<i64>,
    pub retired_at: Option<i64>,
}

impl GatewayRecord {
    pub fn is_registered(&self) -> bool {
        self.token_hash.is_some() && self.public_key.is_some()
    }

    /// Registered and not retired: may receive peers.
    pub fn is_active(&self) -> bool {
        self.is_registered() && !self.retired
    }

    pub fn endpoint(&self) -> Option<String> {
        self.public_ip
            .as_ref()
            .map(|ip| format_endpoint(ip, self.listen_port))
    }

    /// Obfuscation parameters clients must use. Only AmneziaWG gateways have any.
    pub fn effective_obfuscation(&self) -> Option<Obfuscation> {
        match self.protocol {
            Protocol::AmneziaWg => self.obfuscation,
            _ => None,
        }
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Fields supplied when provisioning a new gateway.
#[derive(Debug, Clone)]
pub struct NewGateway {
    pub hostname: String,
    pub region: String,
    pub country_code: String,
    pub city: Option<String>,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub max_peers: Option<u32>,
    pub pool_cidr: String,
}

/// Runtime facts a gateway reports when it registers.
#[derive(Debug, Clone)]
pub struct Registration {
    pub public_key: String,
    pub public_ip: String,
    pub listen_port: Option<u16>,
    pub obfuscation: Option<Obfuscation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub gateway_id: String,
    pub name: String,
    pub email: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub notes: Option<String>,
    pub public_key: String,
    pub address: Ipv4Addr,
    pub allowed_ips: Vec<String>,
    pub dns_servers: Vec<String>,
    pub persistent_keepalive: u16,
    pub mtu: u16,
    pub enabled: bool,
    pub token_hash: String,
    pub created_at: i64,
    pub disabled_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl PeerRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }

    /// Enabled and not past its expiry.
    pub fn is_live(&self, now: i64) -> bool {
        self.enabled && !self.is_expired(now)
    }

    /// One-line summary for audit entries. Never includes the token hash.
    pub fn summary(&self) -> String {
        format!(
            "name={} gateway={} address={} enabled={}",
            self.name, self.gateway_id, self.address, self.enabled
        )
    }
}

/// Fields supplied when creating a peer; the store fills in ids, address and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub notes: Option<String>,
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub dns_servers: Vec<String>,
    pub persistent_keepalive: u16,
    pub mtu: u16,
    pub expires_at: Option<i64>,
    pub token_hash: String,
}

/// Where a new peer should land.
#[derive(Debug, Clone)]
pub enum Placement {
    Gateway(String),
    /// Least-loaded active gateway, optionally within a region.
    LeastLoaded { region: Option<String> },
}

/// Status counters pushed by a gateway for one of its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Value stored in the token index, keyed by token hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub kind: TokenKind,
    pub subject_id: String,
    pub issued_at: i64,
    pub used_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Admin,
    Gateway(String),
    Client(String),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Admin => f.write_str("admin"),
            Actor::Gateway(id) => write!(f, "gateway:{id}"),
            Actor::Client(id) => write!(f, "client:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(enabled: bool, expires_at: Option<i64>) -> PeerRecord {
        PeerRecord {
            id: "p1".into(),
            gateway_id: "g1".into(),
            name: "laptop".into(),
            email: None,
            device_name: None,
            device_type: None,
            notes: None,
            public_key: "pk".into(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            allowed_ips: vec![],
            dns_servers: vec![],
            persistent_keepalive: 25,
            mtu: 1420,
            enabled,
            token_hash: "secret-hash".into(),
            created_at: 1000,
            disabled_at: None,
            expires_at,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    #[test]
    fn expiry_only_checks_timestamp() {
        assert!(!make_peer(true, None).is_expired(5000));
        assert!(make_peer(true, Some(2000)).is_expired(2000));
        assert!(!make_peer(true, Some(2000)).is_expired(1999));
    }

    #[test]
    fn live_requires_enabled_and_unexpired() {
        assert!(make_peer(true, None).is_live(0));
        assert!(!make_peer(false, None).is_live(0));
        assert!(!make_peer(true, Some(10)).is_live(10));
    }

    #[test]
    fn summary_omits_token_hash() {
        assert!(!make_peer(true, None).summary().contains("secret-hash"));
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("AmneziaWG".parse::<Protocol>().unwrap(), Protocol::AmneziaWg);
        assert!("ipsec".parse::<Protocol>().is_err());
    }

    #[test]
    fn endpoint_brackets_ipv6() {
        assert_eq!(format_endpoint("203.0.113.7", 51820), "203.0.113.7:51820");
        assert_eq!(format_endpoint("2001:db8::1", 51820), "[2001:db8::1]:51820");
    }
}
