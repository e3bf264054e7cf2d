use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prequal::client::{Client, SelectionMode};
use prequal::{config, metrics, server};

#[derive(Parser)]
#[command(name = "prequal")]
#[command(version, about = "Probe-based hot/cold load balancing for HTTP replicas", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replica server
    Server {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Address for the Prometheus scrape endpoint
        #[arg(long)]
        metrics_listen: Option<String>,
    },

    /// Run the load-balancing client with a demo workload
    Client {
        /// Config file path (falls back to environment variables)
        #[arg(long)]
        config: Option<String>,

        /// Replica selection mode (hcl or round_robin)
        #[arg(long, default_value = "hcl")]
        selection: String,

        /// Address for the Prometheus scrape endpoint
        #[arg(long)]
        metrics_listen: Option<String>,

        /// Workload requests spawned per second
        #[arg(long, default_value = "100")]
        rps: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Server {
            listen,
            metrics_listen,
        } => {
            init_metrics(metrics_listen.as_deref())?;
            server::run_server(&listen).await
        }
        Commands::Client {
            config,
            selection,
            metrics_listen,
            rps,
        } => {
            init_metrics(metrics_listen.as_deref())?;
            run_client(config.as_deref(), &selection, rps).await
        }
    }
}

fn init_metrics(listen: Option<&str>) -> Result<()> {
    if let Some(addr) = listen {
        metrics::init_metrics(addr.parse()?)?;
    }
    Ok(())
}

/// Drive a demo workload against the replica pool until Ctrl-C, then stop
/// the prober cooperatively.
async fn run_client(config_path: Option<&str>, selection: &str, rps: u32) -> Result<()> {
    let config = config::load_config(config_path)?;
    let client = Arc::new(Client::new(config, SelectionMode::parse(selection))?);
    let prober = Arc::clone(&client).start();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    info!(rps = rps, selection = %selection, "workload started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for _ in 0..rps {
                    let client = Arc::clone(&client);
                    tokio::spawn(async move {
                        let job = {
                            use rand::Rng;
                            rand::thread_rng().gen_range(0..3)
                        };
                        let result = match job {
                            0 => client.ping().await,
                            1 => client.batch_process(&["example".to_string()]).await,
                            _ => client.medium_process().await,
                        };
                        if let Err(e) = result {
                            warn!("request failed: {}", e);
                        }
                    });
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping client");
                break;
            }
        }
    }

    client.shutdown();
    let _ = prober.await;
    Ok(())
}
