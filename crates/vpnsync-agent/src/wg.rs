//! Local interface control through the `wg` / `awg` command-line tools.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use tokio::process::Command;
use tracing::debug;

use crate::client::{DesiredPeer, PeerStatus};
use crate::error::{AgentError, Result};

/// One peer as the kernel currently has it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    /// Unix seconds; `None` if the peer never completed a handshake.
    pub latest_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Upsert {
        public_key: String,
        allowed_ips: Vec<String>,
    },
    Remove {
        public_key: String,
    },
}

/// Parse `wg show <iface> dump`. The first line describes the interface and
/// is skipped; every following line is one tab-separated peer.
pub fn parse_dump(text: &str) -> Result<Vec<LivePeer>> {
    let mut peers = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return Err(AgentError::Dump(format!(
                "expected at least 7 fields, got {}",
                fields.len()
            )));
        }
        let allowed_ips = match fields[3] {
            "(none)" | "" => Vec::new(),
            list => list.split(',').map(|s| s.trim().to_owned()).collect(),
        };
        let number = |i: usize| {
            fields[i]
                .parse::<u64>()
                .map_err(|_| AgentError::Dump(format!("field {i} is not a number: {:?}", fields[i])))
        };
        let handshake = number(4)?;
        peers.push(LivePeer {
            public_key: fields[0].to_owned(),
            allowed_ips,
            latest_handshake: (handshake > 0).then_some(handshake as i64),
            rx_bytes: number(5)?,
            tx_bytes: number(6)?,
        });
    }
    Ok(peers)
}

/// Actions that turn `live` into `desired`. Disabled peers are removed from
/// the interface; peers the server does not list are removed; peers whose
/// allowed IPs already match are left alone. Removals come first so a reused
/// address is never claimed by two keys at once.
pub fn plan(desired: &[DesiredPeer], live: &[LivePeer]) -> Vec<Action> {
    let want: BTreeMap<&str, BTreeSet<&str>> = desired
        .iter()
        .filter(|p| p.enabled)
        .map(|p| {
            (
                p.public_key.as_str(),
                p.allowed_ips.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let have: BTreeMap<&str, BTreeSet<&str>> = live
        .iter()
        .map(|p| {
            (
                p.public_key.as_str(),
                p.allowed_ips.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let removals = have
        .keys()
        .filter(|k| !want.contains_key(*k))
        .map(|k| Action::Remove {
            public_key: (*k).to_owned(),
        });
    let upserts = want
        .iter()
        .filter(|(k, ips)| have.get(*k) != Some(*ips))
        .map(|(k, ips)| Action::Upsert {
            public_key: (*k).to_owned(),
            allowed_ips: ips.iter().map(|s| (*s).to_owned()).collect(),
        });
    removals.chain(upserts).collect()
}

pub fn statuses(live: &[LivePeer]) -> Vec<PeerStatus> {
    live.iter()
        .map(|p| PeerStatus {
            public_key: p.public_key.clone(),
            last_handshake: p.latest_handshake,
            rx_bytes: p.rx_bytes,
            tx_bytes: p.tx_bytes,
        })
        .collect()
}

// ── Interface ────────────────────────────────────────────────────────────────

/// What the agent needs from the local tunnel interface.
pub trait Interface {
    fn public_key(&self) -> impl Future<Output = Result<String>> + Send;
    fn dump(&self) -> impl Future<Output = Result<Vec<LivePeer>>> + Send;
    fn apply(&self, action: &Action) -> impl Future<Output = Result<()>> + Send;
}

/// A kernel interface driven by `wg` (WireGuard) or `awg` (AmneziaWG).
#[derive(Debug, Clone)]
pub struct WgTool {
    pub tool: String,
    pub interface: String,
}

impl WgTool {
    pub fn new(tool: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            interface: interface.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(tool = %self.tool, ?args, "running");
        let out = Command::new(&self.tool).args(args).output().await?;
        if !out.status.success() {
            return Err(AgentError::Command {
                tool: self.tool.clone(),
                message: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl Interface for WgTool {
    async fn public_key(&self) -> Result<String> {
        let out = self.run(&["show", self.interface.as_str(), "public-key"]).await?;
        Ok(out.trim().to_owned())
    }

    async fn dump(&self) -> Result<Vec<LivePeer>> {
        let out = self.run(&["show", self.interface.as_str(), "dump"]).await?;
        parse_dump(&out)
    }

    async fn apply(&self, action: &Action) -> Result<()> {
        match action {
            Action::Upsert {
                public_key,
                allowed_ips,
            } => {
                let ips = allowed_ips.join(",");
                self.run(&[
                    "set",
                    self.interface.as_str(),
                    "peer",
                    public_key.as_str(),
                    "allowed-ips",
                    ips.as_str(),
                ])
                .await?;
            }
            Action::Remove { public_key } => {
                self.run(&["set", self.interface.as_str(), "peer", public_key.as_str(), "remove"])
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "cHJpdmF0ZQ==\tc2VydmVy\t51820\toff\n\
        a2V5LWE=\t(none)\t198.51.100.7:40000\t10.10.5.1/32\t1700000000\t1024\t2048\t25\n\
        a2V5LWI=\t(none)\t(none)\t10.10.5.2/32,fd00::2/128\t0\t0\t0\toff\n";

    fn desired(key: &str, ip: &str, enabled: bool) -> DesiredPeer {
        DesiredPeer {
            public_key: key.into(),
            address: ip.into(),
            allowed_ips: vec![format!("{ip}/32")],
            enabled,
        }
    }

    #[test]
    fn dump_parses_peers_and_skips_interface_line() {
        let peers = parse_dump(DUMP).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "a2V5LWE=");
        assert_eq!(peers[0].allowed_ips, vec!["10.10.5.1/32"]);
        assert_eq!(peers[0].latest_handshake, Some(1_700_000_000));
        assert_eq!(peers[0].rx_bytes, 1024);
        assert_eq!(peers[0].tx_bytes, 2048);
        assert_eq!(peers[1].latest_handshake, None);
        assert_eq!(peers[1].allowed_ips.len(), 2);
    }

    #[test]
    fn dump_with_no_peers_is_empty() {
        assert!(parse_dump("priv\tpub\t51820\toff\n").unwrap().is_empty());
        assert!(parse_dump("").unwrap().is_empty());
    }

    #[test]
    fn dump_rejects_short_lines() {
        assert!(parse_dump("iface\nkey\tpsk\n").is_err());
    }

    #[test]
    fn plan_adds_missing_and_removes_unknown() {
        let live = parse_dump(DUMP).unwrap();
        let want = vec![
            desired("a2V5LWE=", "10.10.5.1", true),
            desired("a2V5LWM=", "10.10.5.3", true),
        ];
        let actions = plan(&want, &live);
        assert_eq!(
            actions,
            vec![
                Action::Remove {
                    public_key: "a2V5LWI=".into()
                },
                Action::Upsert {
                    public_key: "a2V5LWM=".into(),
                    allowed_ips: vec!["10.10.5.3/32".into()],
                },
            ]
        );
    }

    #[test]
    fn plan_removes_disabled_peers() {
        let live = parse_dump(DUMP).unwrap();
        let want = vec![
            desired("a2V5LWE=", "10.10.5.1", false),
            desired("a2V5LWI=", "10.10.5.2", true),
        ];
        let actions = plan(&want, &live);
        assert!(actions.contains(&Action::Remove {
            public_key: "a2V5LWE=".into()
        }));
        // a2V5LWI= carries an extra IPv6 route live, so it is rewritten.
        assert!(actions.contains(&Action::Upsert {
            public_key: "a2V5LWI=".into(),
            allowed_ips: vec!["10.10.5.2/32".into()],
        }));
    }

    #[test]
    fn plan_is_empty_when_converged() {
        let live = vec![LivePeer {
            public_key: "k".into(),
            allowed_ips: vec!["10.0.0.1/32".into()],
            latest_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }];
        assert!(plan(&[desired("k", "10.0.0.1", true)], &live).is_empty());
    }

    #[test]
    fn statuses_mirror_counters() {
        let s = statuses(&parse_dump(DUMP).unwrap());
        assert_eq!(s[0].last_handshake, Some(1_700_000_000));
        assert_eq!(s[1].last_handshake, None);
        assert_eq!(s[0].tx_bytes, 2048);
    }
}
