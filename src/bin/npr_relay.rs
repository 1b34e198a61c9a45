//! npr_relay - license-plate detection relay daemon
//!
//! This daemon:
//! 1. Accepts camera detection posts over HTTP
//! 2. Records every detection in the local buffer
//! 3. Delivers new plates to the sink while it is reachable
//! 4. Replays buffered detections every reconciliation interval
//! 5. Truncates the buffer once a day

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use npr_relay::config::{load_env_file, RelayConfig};
use npr_relay::intake::{IntakeConfig, IntakeServer, DEFAULT_MAX_BODY_BYTES};
use npr_relay::{
    AlwaysReachable, ConnectivityProbe, DedupEngine, DeliveryWorker, DurableBuffer, PeriodicTask,
    Reconciler, Relay, Retention, Schedule, SinkConnector, SqliteSink, TcpProbe,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay license-plate detections to the sink")]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "NPR_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let env_file = load_env_file()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(path) = env_file {
        log::info!("loaded environment from {}", path.display());
    }
    let cfg = RelayConfig::load_from(args.config.as_deref())?;

    log::info!("npr_relay starting");
    log::info!("  listen: {}", cfg.listen_addr);
    log::info!("  buffer: {}", cfg.buffer_path);
    log::info!("  sink: {} (table {})", cfg.sink.db_path, cfg.sink.table);
    log::info!(
        "  delivery: timeout {}ms, queue {}",
        cfg.delivery_timeout.as_millis(),
        cfg.delivery_queue
    );
    if cfg.probe.enabled {
        log::info!(
            "  probe: {} (timeout {}ms)",
            cfg.probe.addr,
            cfg.probe.timeout.as_millis()
        );
    } else {
        log::info!("  probe: disabled");
    }

    let buffer = Arc::new(
        DurableBuffer::open_sqlite(&cfg.buffer_path)
            .with_context(|| format!("open buffer {}", cfg.buffer_path))?,
    );
    let sink: Arc<dyn SinkConnector> = Arc::new(
        SqliteSink::open(&cfg.sink.db_path, &cfg.sink.table)
            .with_context(|| format!("open sink {}", cfg.sink.db_path))?,
    );
    let delivery = Arc::new(
        DeliveryWorker::spawn(sink, cfg.delivery_queue).context("start sink delivery worker")?,
    );
    let probe: Arc<dyn ConnectivityProbe> = if cfg.probe.enabled {
        Arc::new(TcpProbe::new(cfg.probe.addr.clone(), cfg.probe.timeout))
    } else {
        Arc::new(AlwaysReachable)
    };

    let relay = Arc::new(
        Relay::new(
            buffer.clone(),
            DedupEngine::new(cfg.plate_policy()?),
            probe.clone(),
            delivery.clone(),
        )
        .with_delivery_timeout(cfg.delivery_timeout),
    );
    let reconciler = Arc::new(
        Reconciler::new(buffer.clone(), probe, delivery)
            .with_max_run(cfg.reconcile.max_run)
            .with_delivery_timeout(cfg.delivery_timeout),
    );
    let retention = Retention::new(buffer);

    let intake = IntakeServer::new(
        IntakeConfig {
            addr: cfg.listen_addr.clone(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        },
        relay,
    )
    .with_reconciler(reconciler.clone())
    .spawn()?;
    log::info!("intake listening on {}", intake.addr);

    let reconcile_task = PeriodicTask::spawn(
        "reconciliation",
        Schedule::Every(cfg.reconcile.interval),
        move |cancel| {
            if let Err(e) = reconciler.run_once(cancel) {
                log::error!("reconciliation failed: {}", e);
            }
        },
    )?;
    let retention_task = PeriodicTask::spawn(
        "retention",
        Schedule::DailyAt(cfg.retention_at),
        move |_| {
            if let Err(e) = retention.run_once() {
                log::error!("retention failed: {}", e);
            }
        },
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("npr_relay running; waiting for shutdown signal (Ctrl-C)...");
    rx.recv()
        .map_err(|_| anyhow!("shutdown channel closed unexpectedly"))?;
    log::info!("shutdown signal received, stopping...");

    intake.stop()?;
    reconcile_task.stop()?;
    retention_task.stop()?;
    log::info!("npr_relay stopped");
    Ok(())
}
