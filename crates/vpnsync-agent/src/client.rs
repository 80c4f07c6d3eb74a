use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

// ── Wire types ───────────────────────────────────────────────────────────────

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

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub provisioning_secret: String,
    pub public_key: String,
    pub public_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<Obfuscation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registered {
    pub gateway_id: String,
    pub gateway_token: String,
    #[serde(default)]
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DesiredPeer {
    pub public_key: String,
    pub address: String,
    pub allowed_ips: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerList {
    pub generation: u64,
    pub peers: Vec<DesiredPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

// ── ApiClient ────────────────────────────────────────────────────────────────

/// HTTP client for the gateway half of the vpnsync API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vpnsync-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Exchange a single-use provisioning secret for a gateway token.
    pub async fn register(&self, req: &RegisterRequest) -> Result<Registered> {
        let res = self
            .http
            .post(self.url("/api/v1/gateway/register"))
            .json(req)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    pub async fn peers(&self, token: &str) -> Result<PeerList> {
        let res = self
            .http
            .get(self.url("/api/v1/gateway/peers"))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    /// Report the generation that is now live on the interface.
    pub async fn report_sync(&self, token: &str, generation: u64) -> Result<()> {
        let res = self
            .http
            .put(self.url("/api/v1/gateway/sync"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "generation": generation }))
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    /// Report handshake and traffic counters. Returns how many peers the
    /// server recognised.
    pub async fn report_status(&self, token: &str, peers: &[PeerStatus]) -> Result<usize> {
        #[derive(Deserialize)]
        struct Updated {
            updated: usize,
        }
        let res = self
            .http
            .put(self.url("/api/v1/gateway/status"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "peers": peers }))
            .send()
            .await?;
        let body: Updated = check(res).await?.json().await?;
        Ok(body.updated)
    }
}

async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(AgentError::Unauthorized);
    }
    let message = res
        .json::<ErrorBody>()
        .await
        .map(|b| b.message)
        .unwrap_or_default();
    Err(AgentError::Server {
        status: status.as_u16(),
        message,
    })
}
