use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::driver::invoker::FunctionInvoker;
use crate::driver::{DriverConfig, FunctionDriver, MinuteBatch};
use crate::error::{Error, Result};
use crate::generator::{iat, SpecGenerator};
use crate::metric::{self, OverloadMonitor, RECORD_CHANNEL_CAPACITY};
use crate::sched::planner::{round_jobs, HttpReplicaApplier, PlannerDriver};
use crate::telemetry::{spawn_collector, PromScraper};
use crate::trace::Trace;

/// Distinct drivers in overload before the whole run is flagged.
pub const OVERLOAD_DRIVER_THRESHOLD: usize = 1;

/// What a finished (or cancelled) run left behind.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub records_written: u64,
    pub snapshots_written: u64,
    pub job_audits_written: u64,
    pub overloaded: bool,
    pub cancelled: bool,
}

/// Drive a full run: bootstrap, warm-up, minute ticks, teardown.
///
/// Owns the run clock. At each minute boundary the per-function generators
/// produce the minute's specs, the scheduler round (if any) is applied, and
/// the batches are handed to the long-lived drivers. Cancellation stops new
/// arrivals; in-flight RPCs drain inside the drivers' grace window and the
/// partial artifacts are still flushed.
pub async fn run(
    cfg: RunConfig,
    trace: Trace,
    invoker: Arc<dyn FunctionInvoker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let overload = OverloadMonitor::new(OVERLOAD_DRIVER_THRESHOLD);

    let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let record_writer = metric::spawn_record_writer(cfg.experiment_csv_path(), record_rx);

    // Scheduler mode: planner connection is part of bootstrap, failing the
    // run before any RPC fires if the planner is unreachable.
    let (mut planner, joblog_writer) = if cfg.scheduler_mode() {
        let (audit_tx, audit_rx) = mpsc::channel(1024);
        let writer = metric::spawn_joblog_writer(cfg.joblogs_csv_path(), audit_rx);
        let planner =
            PlannerDriver::connect(&cfg, Arc::new(HttpReplicaApplier::new()), audit_tx).await?;
        (Some(planner), Some(writer))
    } else {
        (None, None)
    };

    let run_start = Instant::now();

    // Telemetry: its own end signal so natural run completion stops it too.
    let (collector_end_tx, collector_end_rx) = watch::channel(false);
    let (collector, snapshot_writer) = if cfg.enable_metrics_scraping {
        let (snap_tx, snap_rx) = mpsc::channel(64);
        let writer = metric::spawn_ndjson_writer(cfg.cluster_csv_path(), snap_rx);
        let collector = spawn_collector(
            PromScraper::new(cfg.prometheus_url.clone()),
            Duration::from_secs(cfg.metric_scraping_period_seconds),
            run_start,
            snap_tx,
            overload.clone(),
            collector_end_rx,
        );
        (Some(collector), Some(writer))
    } else {
        (None, None)
    };

    // One long-lived driver per function, each with its own seeded spec
    // stream so the run is reproducible regardless of task interleaving.
    let driver_cfg = DriverConfig {
        single_slot: cfg.single_slot,
        rpc_timeout_floor: Duration::from_secs(cfg.grpc_timeout_seconds),
        resize_grace: cfg.scheduler_mode(),
    };
    let mut generators = Vec::with_capacity(trace.functions.len());
    let mut batch_txs = Vec::with_capacity(trace.functions.len());
    let mut driver_tasks = Vec::with_capacity(trace.functions.len());
    for (idx, function) in trace.functions.iter().enumerate() {
        generators.push(SpecGenerator::new(
            Arc::clone(function),
            iat::function_rng(cfg.seed, idx),
            cfg.iat_distribution,
            cfg.function_multiplier,
            cfg.warmup_duration,
        ));

        let (batch_tx, batch_rx) = mpsc::channel::<MinuteBatch>(4);
        let driver = FunctionDriver::new(
            Arc::clone(function),
            Arc::clone(&invoker),
            record_tx.clone(),
            overload.clone(),
            driver_cfg.clone(),
            run_start,
        );
        driver_tasks.push(tokio::spawn(driver.run(batch_rx, shutdown.clone())));
        batch_txs.push(batch_tx);
    }
    drop(record_tx); // the record log closes once the last driver finishes

    info!(
        functions = trace.functions.len(),
        duration = cfg.duration,
        warmup = cfg.warmup_duration,
        scheduler = cfg.scheduler_mode(),
        "Run started"
    );

    let total_slots = cfg.warmup_duration + cfg.duration;
    let mut cancelled = false;
    'ticks: for slot in 0..total_slots {
        let warmup = slot < cfg.warmup_duration;
        let measured_minute = slot.saturating_sub(cfg.warmup_duration) as usize;

        // Replica counts are applied before the minute's arrivals fire.
        if !warmup {
            if let Some(planner) = planner.as_mut() {
                let jobs = round_jobs(&trace, measured_minute);
                planner.run_round(measured_minute as u32, jobs).await;
            }
        }

        let mut planned = 0usize;
        for (idx, generator) in generators.iter_mut().enumerate() {
            let specs = if warmup {
                generator.warmup_minute(slot + 1)
            } else {
                let specs = generator.minute(measured_minute);
                let expected = trace.functions[idx]
                    .ipm
                    .get(measured_minute)
                    .copied()
                    .unwrap_or(0)
                    * cfg.function_multiplier;
                if specs.len() != expected as usize {
                    return Err(Error::Internal(format!(
                        "spec count mismatch for {}: generated {}, trace says {expected}",
                        trace.functions[idx].name,
                        specs.len()
                    )));
                }
                specs
            };
            if specs.is_empty() {
                continue;
            }
            planned += specs.len();
            if batch_txs[idx].send(MinuteBatch { slot, specs }).await.is_err() {
                return Err(Error::Internal(format!(
                    "driver batch channel for {} closed prematurely",
                    trace.functions[idx].name
                )));
            }
        }
        info!(slot, warmup, planned, "Minute dispatched");

        let boundary = run_start + Duration::from_secs(60 * (slot as u64 + 1));
        tokio::select! {
            _ = sleep_until(boundary) => {}
            _ = shutdown.changed() => {
                warn!("Cancellation received, stopping new arrivals");
                cancelled = true;
                break 'ticks;
            }
        }
    }

    // Teardown: closing the batch channels lets each driver drain its
    // in-flight RPCs inside its own grace window.
    drop(batch_txs);
    for result in futures::future::join_all(driver_tasks).await {
        if result.is_err() {
            warn!("A driver task panicked during teardown");
        }
    }

    drop(planner); // closes the audit channel
    let job_audits_written = match joblog_writer {
        Some(writer) => writer
            .await
            .map_err(|e| Error::Internal(format!("job log writer: {e}")))??,
        None => 0,
    };

    let _ = collector_end_tx.send(true);
    if let Some(collector) = collector {
        let _ = collector.await;
    }
    let snapshots_written = match snapshot_writer {
        Some(writer) => writer
            .await
            .map_err(|e| Error::Internal(format!("snapshot writer: {e}")))??,
        None => 0,
    };

    let records_written = record_writer
        .await
        .map_err(|e| Error::Internal(format!("record writer: {e}")))??;

    let overloaded = overload.tripped();
    if overload.write_flag(&cfg.overload_flag_path())? {
        warn!(path = %cfg.overload_flag_path().display(), "Overload flag written");
    }

    info!(
        records_written,
        snapshots_written,
        job_audits_written,
        overloaded,
        cancelled,
        "Run finished"
    );
    Ok(RunSummary {
        records_written,
        snapshots_written,
        job_audits_written,
        overloaded,
        cancelled,
    })
}
