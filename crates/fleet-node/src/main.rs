//! FleetMesh binary — orchestrator replicas and node daemons.
//!
//! ```bash
//! # Run a control replica on the local mesh
//! RUST_LOG=info cargo run --bin fleet-node -- orchestrator --replica-id replica-a
//!
//! # Run a node daemon with an operator-provided worker program
//! RUST_LOG=info cargo run --bin fleet-node -- daemon --node-id node-a \
//!     --worker /usr/local/bin/infer-worker
//!
//! # Validate a job spec file without submitting it
//! cargo run --bin fleet-node -- check my-job.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_control::OrchestratorReplica;
use fleet_daemon::NodeDaemon;
use fleet_net::GossipBus;
use fleet_state::StateGateway;
use fleet_types::config::{ControlConfig, DaemonConfig, NetConfig, StateConfig};
use fleet_types::job::JobSpec;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "fleet-node",
    version = env!("CARGO_PKG_VERSION"),
    about = "FleetMesh — decentralized AI inference orchestration"
)]
struct Cli {
    /// Root directory for blobs and name records.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// UDP port for the QUIC listener. 0 = OS-assigned.
    #[arg(long, global = true, default_value_t = 0)]
    port: u16,

    /// Multiaddrs of peers to dial at startup (repeatable).
    #[arg(long = "seed", global = true)]
    seeds: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an orchestrator replica.
    Orchestrator {
        #[arg(long, default_value = "replica-001")]
        replica_id: String,
    },

    /// Run a node daemon.
    Daemon {
        #[arg(long, default_value = "node-001")]
        node_id: String,

        /// Worker program spawned per work item (JSON handoff on stdin,
        /// JSON output on stdout).
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Capability flags advertised in heartbeats (repeatable).
        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Node-local dataset kinds advertised in heartbeats (repeatable).
        #[arg(long = "data-kind")]
        data_kinds: Vec<String>,
    },

    /// Validate a job spec file and exit.
    Check {
        /// Path to a JSON job spec.
        path: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let net_cfg = NetConfig {
        listen_port: cli.port,
        seed_addrs: cli.seeds.clone(),
    };
    let state_cfg = match &cli.data_dir {
        Some(dir) => StateConfig {
            data_dir: dir.clone(),
        },
        None => StateConfig::default(),
    };

    match cli.command {
        Command::Orchestrator { replica_id } => {
            run_orchestrator(net_cfg, state_cfg, replica_id).await
        }
        Command::Daemon {
            node_id,
            worker,
            flags,
            data_kinds,
        } => run_daemon(net_cfg, state_cfg, node_id, worker, flags, data_kinds).await,
        Command::Check { path } => run_check(&path),
    }
}

// ── Orchestrator mode ─────────────────────────────────────────────────────────

async fn run_orchestrator(
    net_cfg: NetConfig,
    state_cfg: StateConfig,
    replica_id: String,
) -> Result<()> {
    let mut cfg = ControlConfig::default();
    cfg.replica_id = replica_id;

    let bus = Arc::new(
        GossipBus::spawn(&net_cfg, &cfg.topics.all())
            .await
            .context("mesh bus startup")?,
    );
    let gateway = Arc::new(
        StateGateway::new(&state_cfg, &cfg.replica_id, bus.clone())
            .context("state gateway startup")?,
    );

    let replica = OrchestratorReplica::new(cfg.clone(), gateway);
    let cancel = CancellationToken::new();
    replica.start(&cancel);

    info!(replica_id = %cfg.replica_id, "orchestrator replica running — Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C — shutting down");
    cancel.cancel();
    bus.shutdown().await?;
    Ok(())
}

// ── Daemon mode ───────────────────────────────────────────────────────────────

async fn run_daemon(
    net_cfg: NetConfig,
    state_cfg: StateConfig,
    node_id: String,
    worker: Option<PathBuf>,
    flags: Vec<String>,
    data_kinds: Vec<String>,
) -> Result<()> {
    let mut cfg = DaemonConfig::default();
    cfg.node_id = node_id;
    cfg.flags = flags;
    cfg.data_kinds = data_kinds;
    if let Some(program) = worker {
        cfg.worker.program = program;
    }

    let bus = Arc::new(
        GossipBus::spawn(&net_cfg, &cfg.topics.all())
            .await
            .context("mesh bus startup")?,
    );
    let gateway = Arc::new(
        StateGateway::new(&state_cfg, &cfg.node_id, bus.clone())
            .context("state gateway startup")?,
    );

    let daemon = NodeDaemon::new(cfg.clone(), gateway).context("daemon startup")?;
    let cancel = CancellationToken::new();
    daemon.start(&cancel);

    info!(node_id = %cfg.node_id, worker = %cfg.worker.program.display(), "node daemon running — Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C — shutting down");
    cancel.cancel();
    bus.shutdown().await?;
    Ok(())
}

// ── Check mode ────────────────────────────────────────────────────────────────

fn run_check(path: &std::path::Path) -> Result<()> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let spec: JobSpec = serde_json::from_slice(&data).context("parsing job spec")?;
    spec.validate_shape()
        .map_err(|e| anyhow::anyhow!("invalid spec: {e}"))?;
    println!(
        "{}: valid {} spec, {} initial work item(s)",
        path.display(),
        spec.pattern(),
        spec.initial_work_items()
    );
    Ok(())
}
