//! The pull loop: register once, then pull, apply, acknowledge, report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::client::{ApiClient, Obfuscation, RegisterRequest};
use crate::error::{AgentError, Result};
use crate::wg::{plan, statuses, Interface};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Single-use secret from the administrator; only needed until the first
    /// successful registration.
    pub provisioning_secret: Option<String>,
    pub public_ip: String,
    pub listen_port: Option<u16>,
    pub obfuscation: Option<Obfuscation>,
    /// Where the gateway token is cached between restarts.
    pub token_file: PathBuf,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub generation: u64,
    pub actions: usize,
    pub status_updated: usize,
}

pub struct Agent<I> {
    client: ApiClient,
    iface: I,
    config: AgentConfig,
    token: Option<String>,
}

impl<I: Interface> Agent<I> {
    /// Build an agent, picking up a previously cached token if there is one.
    pub fn new(client: ApiClient, iface: I, config: AgentConfig) -> Result<Self> {
        let token = read_token(&config.token_file)?;
        Ok(Self {
            client,
            iface,
            config,
            token,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.token.is_some()
    }

    /// Return the gateway token, registering first if none is cached.
    pub async fn ensure_registered(&mut self) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let secret = self
            .config
            .provisioning_secret
            .clone()
            .ok_or(AgentError::NotProvisioned)?;
        let req = RegisterRequest {
            provisioning_secret: secret,
            public_key: self.iface.public_key().await?,
            public_ip: self.config.public_ip.clone(),
            listen_port: self.config.listen_port,
            obfuscation: self.config.obfuscation,
        };
        let registered = self.client.register(&req).await?;
        write_token(&self.config.token_file, &registered.gateway_token)?;
        info!(gateway_id = %registered.gateway_id, "registered with server");
        self.token = Some(registered.gateway_token.clone());
        Ok(registered.gateway_token)
    }

    /// Pull the full peer list, converge the interface, acknowledge the
    /// generation, then report counters. The generation is only acknowledged
    /// after every action succeeded.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let token = self.ensure_registered().await?;
        let result = self.cycle(&token).await;
        if matches!(result, Err(AgentError::Unauthorized)) {
            warn!("gateway token rejected; discarding it");
            self.forget_token()?;
        }
        result
    }

    async fn cycle(&self, token: &str) -> Result<CycleReport> {
        let desired = self.client.peers(token).await?;
        let live = self.iface.dump().await?;
        let actions = plan(&desired.peers, &live);
        for action in &actions {
            self.iface.apply(action).await?;
        }
        if !actions.is_empty() {
            info!(
                generation = desired.generation,
                actions = actions.len(),
                "applied peer changes"
            );
        }
        self.client.report_sync(token, desired.generation).await?;

        let live = self.iface.dump().await?;
        let status_updated = self.client.report_status(token, &statuses(&live)).await?;
        Ok(CycleReport {
            generation: desired.generation,
            actions: actions.len(),
            status_updated,
        })
    }

    fn forget_token(&mut self) -> Result<()> {
        self.token = None;
        match std::fs::remove_file(&self.config.token_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run cycles forever. Failures are logged and retried on the next tick.
    pub async fn run(&mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(report) => tracing::debug!(?report, "cycle complete"),
                Err(e) if e.is_transient() => warn!(error = %e, "cycle failed; will retry"),
                Err(e) => error!(error = %e, "cycle failed"),
            }
        }
    }
}

fn read_token(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_owned()).filter(|t| !t.is_empty())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_token(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_file_round_trip_and_blank_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token");
        assert_eq!(read_token(&path).unwrap(), None);

        write_token(&path, "vgt_abc").unwrap();
        assert_eq!(read_token(&path).unwrap().as_deref(), Some("vgt_abc"));

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(read_token(&path).unwrap(), None);
    }
}
