//! Manager binary

use anyhow::Context;
use blockorc::common::{Config, HostInfo, Storage};
use blockorc::server::{EngineMode, ManagerServer};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blockorc-manager")]
#[command(about = "blockorc volume manager host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Engine {
    /// Simulated in-process engines (development)
    Sim,
    /// Engine control endpoints over HTTP
    Http,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a manager host
    Serve {
        /// Host ID (unique in the cluster)
        #[arg(long)]
        host_id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Address peers use to reach this host (defaults to the bind address)
        #[arg(long)]
        advertise: Option<String>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Peer host as `id=ip:port` (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Engine client
        #[arg(long, value_enum, default_value = "sim")]
        engine: Engine,

        /// Data directory (sled store); in-memory when unset
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

fn parse_peer(spec: &str) -> anyhow::Result<HostInfo> {
    let (id, address) = spec
        .split_once('=')
        .with_context(|| format!("invalid peer '{}', expected id=ip:port", spec))?;
    anyhow::ensure!(
        !id.is_empty() && !address.is_empty(),
        "invalid peer '{}', expected id=ip:port",
        spec
    );
    Ok(HostInfo {
        uuid: id.to_string(),
        name: id.to_string(),
        address: address.to_string(),
    })
}

fn open_store(data: Option<PathBuf>) -> anyhow::Result<Storage> {
    match data {
        None => Ok(Storage::new_memory()),
        #[cfg(feature = "sled-backend")]
        Some(path) => Ok(Storage::new_sled(&path)?),
        #[cfg(not(feature = "sled-backend"))]
        Some(path) => anyhow::bail!(
            "--data {} needs the sled-backend feature",
            path.display()
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host_id,
            bind,
            advertise,
            config,
            peers,
            engine,
            data,
        } => {
            // File and environment first, CLI flags on top
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind_addr = bind.parse().context("invalid --bind address")?;
            }
            if host_id.is_some() {
                config.host_id = host_id;
            }
            let host_id = config
                .host_id
                .clone()
                .context("host id required (--host-id or host_id in config)")?;

            let host = HostInfo {
                uuid: host_id.clone(),
                name: host_id,
                address: advertise.unwrap_or_else(|| config.bind_addr.to_string()),
            };
            let peers = peers
                .iter()
                .map(|p| parse_peer(p))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let engine = match engine {
                Engine::Sim => EngineMode::Sim,
                Engine::Http => EngineMode::Http,
            };
            let store = open_store(data)?;

            ManagerServer::new(config, host, peers, store, engine)
                .serve()
                .await?;
        }
    }

    Ok(())
}
