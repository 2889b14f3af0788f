use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing::Level;

use strata_failover::Prober;
use strata_wire::{Gateway, ProxyConfig};

/// Strata shard-routing proxy daemon.
#[derive(Parser)]
#[command(name = "stratad", author, version, about = "Strata proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy.
    Serve {
        /// Path to configuration file.
        #[arg(long, default_value = "strata.yaml")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the routing table.
    Check {
        #[arg(long, default_value = "strata.yaml")]
        config: PathBuf,
    },

    /// Query a running proxy's endpoint health and exit.
    HealthCheck {
        /// Proxy address.
        #[arg(long, default_value = "127.0.0.1:7433")]
        addr: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => {
            let rt = Runtime::new()?;
            rt.block_on(serve(config))
        }
        Some(Commands::Check { config }) => check(config),
        Some(Commands::HealthCheck { addr }) => {
            let rt = Runtime::new()?;
            rt.block_on(health_check(&addr))
        }
        None => {
            // Clap will print help.
            Ok(())
        }
    }
}

async fn serve(path: PathBuf) -> anyhow::Result<()> {
    let config = ProxyConfig::load(&path)?;
    let _reload = match &config.log_dir {
        Some(dir) => Some(strata_log::init(dir, Level::INFO)?),
        None => {
            strata_log::init_stderr(Level::INFO);
            None
        }
    };
    let gateway = Arc::new(Gateway::new(&config)?);
    if let Some(metrics_addr) = &config.metrics_listen {
        let auth = config
            .metrics_basic_auth
            .as_ref()
            .map(|a| (a.user.clone(), a.password.clone()));
        strata_metrics::serve(metrics_addr, auth).await?;
    }
    Prober::new(gateway.directory().clone(), gateway.board().clone(), &config.health).spawn();
    strata_wire::run_server(&config.listen, gateway).await
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = ProxyConfig::load(&path)?;
    let table = config.routing_table()?;
    println!("{} shard(s):", table.len());
    for d in table.shards() {
        println!(
            "  shard {:>3}  [{}, {})  primary={}  replicas={}",
            d.shard_id,
            d.key_low,
            d.key_high,
            d.connection.primary,
            d.connection.replicas.len()
        );
    }
    if !table.is_contiguous() {
        println!("warning: key space has gaps; keys in a gap will fail to route");
    }
    println!("OK");
    Ok(())
}

async fn health_check(addr: &str) -> anyhow::Result<()> {
    let mut client = strata_client::Client::connect(addr).await?;
    let endpoints = client.health().await?;
    if endpoints.is_empty() {
        println!("no endpoints probed yet");
        return Ok(());
    }
    let mut all_up = true;
    for e in &endpoints {
        println!("{}  {}", if e.up { "up  " } else { "down" }, e.endpoint);
        all_up &= e.up;
    }
    println!("{}", if all_up { "OK" } else { "DEGRADED" });
    Ok(())
}
