use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vpnsync_agent::client::Obfuscation;
use vpnsync_agent::wg::WgTool;
use vpnsync_agent::{Agent, AgentConfig, ApiClient};

#[derive(Parser)]
#[command(
    name = "vpnsync-agent",
    about = "vpnsync gateway agent — keeps a local WireGuard/AmneziaWG interface in sync with the server",
    version
)]
struct Cli {
    /// Base URL of the vpnsync server
    #[arg(long, env = "VPNSYNC_SERVER_URL")]
    server_url: String,

    /// Interface to manage
    #[arg(long, env = "VPNSYNC_INTERFACE", default_value = "wg0")]
    interface: String,

    /// Control tool: `wg` for WireGuard, `awg` for AmneziaWG
    #[arg(long, env = "VPNSYNC_WG_TOOL", default_value = "wg")]
    tool: String,

    /// One-time provisioning secret (only needed until first registration)
    #[arg(long, env = "VPNSYNC_PROVISIONING_SECRET", hide_env_values = true)]
    provisioning_secret: Option<String>,

    /// Public IP clients should connect to
    #[arg(long, env = "VPNSYNC_PUBLIC_IP")]
    public_ip: String,

    #[arg(long, env = "VPNSYNC_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// AmneziaWG parameters as JSON: {"jc":..,"jmin":..,"jmax":..,"s1":..,"s2":..,"h1":..,"h2":..,"h3":..,"h4":..}
    #[arg(long, env = "VPNSYNC_OBFUSCATION")]
    obfuscation: Option<String>,

    /// Where the gateway token is cached
    #[arg(long, env = "VPNSYNC_TOKEN_FILE", default_value = "/var/lib/vpnsync-agent/token")]
    token_file: PathBuf,

    /// Time between sync cycles
    #[arg(long, env = "VPNSYNC_SYNC_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// HTTP request timeout
    #[arg(long, env = "VPNSYNC_HTTP_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level: error, warn, info, debug, verbose
    #[arg(long, env = "VPNSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.log_level.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        cli.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&level))
        .init();

    let obfuscation = cli
        .obfuscation
        .as_deref()
        .map(serde_json::from_str::<Obfuscation>)
        .transpose()
        .context("parse --obfuscation")?;

    let client = ApiClient::new(&cli.server_url, cli.timeout).context("build http client")?;
    let config = AgentConfig {
        provisioning_secret: cli.provisioning_secret,
        public_ip: cli.public_ip,
        listen_port: cli.listen_port,
        obfuscation,
        token_file: cli.token_file,
    };
    let mut agent = Agent::new(client, WgTool::new(cli.tool, cli.interface), config)
        .context("load agent state")?;

    if cli.once {
        let report = agent.run_cycle().await?;
        println!(
            "generation {} applied ({} changes, {} peers reported)",
            report.generation, report.actions, report.status_updated
        );
        return Ok(());
    }

    tracing::info!(interval = %humantime::format_duration(cli.interval), "agent started");
    agent.run(cli.interval).await;
    Ok(())
}
