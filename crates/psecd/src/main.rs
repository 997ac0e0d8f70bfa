//! psecd - MAC security admission daemon
//!
//! Entry point for the psecd daemon.

use anyhow::Context;
use clap::Parser;
use psecd::audit::{AuditCategory, AuditOutcome, AuditRecord};
use psecd::audit_log;
use psecd::config::{PsecConfig, DEFAULT_CONFIG_PATH};
use psecd::hal::Hal;
use psecd::stack::{self, ChannelTransport, SecondaryRelay};
use psecd::{dispatcher, scheduler, Engine, LimitControl, NodeRole};
use psec_types::NodeId;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How often the dispatcher sweeps the queue without a wake-up.
const DISPATCH_SWEEP: Duration = Duration::from_millis(500);

/// MAC security admission daemon
#[derive(Parser, Debug)]
#[command(name = "psecd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("psecd failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = PsecConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    info!("--- Starting psecd ---");
    info!(
        role = ?config.engine.role,
        node = %config.engine.local_node,
        pool = config.engine.pool_capacity,
        "Configuration loaded"
    );

    let transport = Arc::new(ChannelTransport::new());
    let inbox = transport.connect(config.engine.local_node, config.stack.relay_queue_depth);
    let (mut hal, _handles) = Hal::in_memory();
    hal.transport = transport.clone();

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    match config.engine.role {
        NodeRole::Primary => {
            let engine = Engine::new(&config, hal);
            let _limit = LimitControl::attach(engine.clone(), &config.limit)
                .context("registering limit control")?;

            tasks.push(tokio::spawn(scheduler::run(
                engine.clone(),
                config.tick_interval(),
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(dispatcher::run(
                engine.clone(),
                DISPATCH_SWEEP,
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(stack::run_primary(engine, inbox, cancel.clone())));
        }
        NodeRole::Secondary => {
            let relay = SecondaryRelay::new(
                config.engine.local_node,
                NodeId::FIRST,
                config.rate_limit,
                transport.clone(),
            );
            let relay = Arc::new(parking_lot::Mutex::new(relay));
            tasks.push(tokio::spawn(stack::run_secondary(relay, inbox, cancel.clone())));
        }
    }

    audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "psecd", "start")
        .with_outcome(AuditOutcome::Success)
        .with_object_id(config.engine.local_node.to_string())
        .with_object_type("node"));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();
    transport.disconnect(config.engine.local_node);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task ended abnormally");
        }
    }

    info!("psecd stopped");
    Ok(())
}
