use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpnsync_server::store::{unix_now, Actor, NewGateway, Protocol};
use vpnsync_server::{open_state, resolve_data_dir, AppState, ServerConfig, Settings};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vpnsyncd",
    about = "vpnsyncd — VPN configuration and gateway sync server",
    version
)]
struct Cli {
    /// Data directory (default: $VPNSYNC_DATA_DIR or the platform data dir)
    #[arg(long, env = "VPNSYNC_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level: error, warn, info, debug, verbose
    #[arg(long, env = "VPNSYNC_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, env = "VPNSYNC_PORT", default_value = "8080")]
        port: u16,
        #[arg(long, env = "VPNSYNC_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Value expected in the X-Admin-Key header
        #[arg(long, env = "VPNSYNC_ADMIN_KEY", hide_env_values = true)]
        admin_key: Option<String>,
        /// How often expired peers are disabled and old audit entries pruned
        #[arg(long, env = "VPNSYNC_SWEEP_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
        sweep_interval: Duration,
        /// Upper bound on a single store call made for a request
        #[arg(long, env = "VPNSYNC_STORE_TIMEOUT", value_parser = humantime::parse_duration)]
        store_timeout: Option<Duration>,
        /// Comma-separated CORS origins (default: any)
        #[arg(long, env = "VPNSYNC_CORS_ORIGINS")]
        cors_origins: Option<String>,
    },
    /// Manage gateways offline. The server must not be running: the store
    /// file is opened exclusively.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },
}

#[derive(Subcommand)]
enum GatewayCommand {
    /// Create a gateway and print its one-time provisioning secret
    Create {
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        region: String,
        #[arg(long)]
        country_code: String,
        #[arg(long)]
        city: Option<String>,
        /// wireguard, amneziawg or openvpn
        #[arg(long, default_value = "wireguard")]
        protocol: Protocol,
        #[arg(long, default_value = "51820")]
        listen_port: u16,
        #[arg(long)]
        max_peers: Option<u32>,
        /// IPv4 pool the gateway's peers draw addresses from, e.g. 10.10.5.0/24
        #[arg(long)]
        pool: String,
    },
    /// Issue a fresh provisioning secret, revoking the current gateway token
    Reprovision { gateway_id: String },
    /// Retire a gateway; its token stops working and it takes no new peers
    Retire { gateway_id: String },
    /// List gateways with their sync state
    List,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter(cli.log_level.as_deref())))
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            admin_key,
            sweep_interval,
            store_timeout,
            cors_origins,
        } => {
            let defaults = ServerConfig::default();
            let cfg = ServerConfig {
                host,
                port,
                admin_key: admin_key.filter(|k| !k.is_empty()),
                data_dir: cli.data_dir,
                sweep_interval,
                cors_origins: cors_origins.or(defaults.cors_origins),
                store_timeout: store_timeout.unwrap_or(defaults.store_timeout),
                ..defaults
            };
            info!(
                host = %cfg.host,
                port = cfg.port,
                admin_api = cfg.admin_key.is_some(),
                store_timeout = %humantime::format_duration(cfg.store_timeout),
                sweep_interval = %humantime::format_duration(cfg.sweep_interval),
                "starting vpnsyncd"
            );
            vpnsync_server::run(cfg).await
        }
        Commands::Gateway { command } => cmd_gateway(cli.data_dir, command),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

/// `--log-level` value to a tracing filter. "verbose" is accepted as debug.
fn log_filter(raw: Option<&str>) -> String {
    match raw {
        None => "info".to_owned(),
        Some(level) if level.eq_ignore_ascii_case("verbose") => "debug".to_owned(),
        Some(level) => level.to_owned(),
    }
}

fn open_offline(data_dir: Option<PathBuf>) -> Result<AppState> {
    let dir = resolve_data_dir(data_dir.as_ref())?;
    let state = open_state(&dir, None, Settings::default())
        .with_context(|| format!("open data directory {} (is the server running?)", dir.display()))?;
    info!(data_dir = %dir.display(), "opened data directory for offline gateway management");
    Ok(state)
}

fn cmd_gateway(data_dir: Option<PathBuf>, command: GatewayCommand) -> Result<()> {
    let state = open_offline(data_dir)?;

    match command {
        GatewayCommand::Create {
            hostname,
            region,
            country_code,
            city,
            protocol,
            listen_port,
            max_peers,
            pool,
        } => {
            let secret = state.tokens.issue_provisioning_secret()?;
            let new = NewGateway {
                hostname,
                region,
                country_code,
                city,
                protocol,
                listen_port,
                max_peers,
                pool_cidr: pool,
            };
            let gateway = state.store.create_gateway(new, &secret.hash, &Actor::Admin)?;
            info!(gateway_id = %gateway.id, hostname = %gateway.hostname, "gateway created");
            println!("created gateway {} ({})", gateway.id, gateway.hostname);
            println!("provisioning secret (shown once): {}", secret.token.as_str());
        }
        GatewayCommand::Reprovision { gateway_id } => {
            let secret = state.tokens.issue_provisioning_secret()?;
            let gateway = state
                .store
                .reissue_provisioning(&gateway_id, &secret.hash, &Actor::Admin)?;
            info!(gateway_id = %gateway.id, "provisioning secret reissued");
            println!("reprovisioned gateway {} ({})", gateway.id, gateway.hostname);
            println!("provisioning secret (shown once): {}", secret.token.as_str());
        }
        GatewayCommand::Retire { gateway_id } => {
            let gateway = state.store.retire_gateway(&gateway_id, &Actor::Admin)?;
            info!(gateway_id = %gateway.id, "gateway retired");
            println!("retired gateway {} ({})", gateway.id, gateway.hostname);
        }
        GatewayCommand::List => {
            let overview = state.store.overview(unix_now())?;
            if overview.is_empty() {
                println!("no gateways");
            }
            for g in overview {
                println!(
                    "{}  {:<24} {:<10} {:<10} {:?}  gen {}/{}  peers {}  pool {} ({}/{})",
                    g.id,
                    g.hostname,
                    g.region,
                    g.protocol.as_str(),
                    g.state,
                    g.acked_generation,
                    g.generation,
                    g.peers,
                    g.pool.cidr,
                    g.pool.used,
                    g.pool.capacity,
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_defaults_to_info_and_maps_verbose() {
        assert_eq!(log_filter(None), "info");
        assert_eq!(log_filter(Some("VERBOSE")), "debug");
        assert_eq!(log_filter(Some("warn")), "warn");
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "vpnsyncd",
            "--log-level",
            "verbose",
            "serve",
            "--port",
            "9000",
            "--sweep-interval",
            "30s",
        ])
        .unwrap();
        assert_eq!(log_filter(cli.log_level.as_deref()), "debug");
        match cli.command {
            Commands::Serve {
                port,
                sweep_interval,
                ..
            } => {
                assert_eq!(port, 9000);
                assert_eq!(sweep_interval, Duration::from_secs(30));
            }
            Commands::Gateway { .. } => panic!("expected serve"),
        }
    }
}
