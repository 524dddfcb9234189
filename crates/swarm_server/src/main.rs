//! SWARM.GRID Server
//!
//! Scheduler daemon and swarm simulator.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use swarm_cluster::{Coordinator, MpscLink, NoopStore};
use swarm_server::{settings, sim, SimConfig};
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarm-server")]
#[command(about = "SWARM.GRID - volunteer compute scheduler", long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Run an in-process swarm and print its statistics as JSON
    Simulate {
        /// Simulated nodes
        #[arg(long, default_value_t = 8)]
        nodes: usize,
        /// Misbehaving nodes among them
        #[arg(long, default_value_t = 2)]
        faulty: usize,
        /// Tasks to submit
        #[arg(long, default_value_t = 20)]
        tasks: usize,
        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        deadline_ms: u64,
        /// Execution timeout applied to the simulated swarm
        #[arg(long, default_value_t = 250)]
        execution_timeout_ms: u64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swarm=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = settings::load(cli.config.as_deref()).map_err(|err| eyre!("{err:#}"))?;

    match cli.command {
        Commands::Run => {
            let (link, mut frames) = MpscLink::new();
            let coordinator = Coordinator::new(config, Arc::new(link), Arc::new(NoopStore))?;
            coordinator.start();

            // Frames leave through the broker relay; without one attached they are only traced.
            let relay = tokio::spawn(async move {
                while let Some((node, frame)) = frames.recv().await {
                    trace!(node = %node, channel = %frame.channel, sequence = frame.sequence, "outbound frame");
                }
            });

            info!("swarm-server running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            coordinator.shutdown().await;
            relay.abort();
            Ok(())
        }
        Commands::Simulate { nodes, faulty, tasks, seed, deadline_ms, execution_timeout_ms } => {
            config.ledger.execution_timeout_ms = execution_timeout_ms;
            if config.assignment.seed.is_none() {
                config.assignment.seed = Some(seed);
            }
            let params = SimConfig::new(nodes, faulty, tasks, seed).with_deadline(deadline_ms);
            let report = sim::run(params, config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
