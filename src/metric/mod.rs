use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Capacity of the invocation record channel. Must stay at or above the
/// maximum number of concurrently in-flight RPCs so producers never block the
/// arrival loops.
pub const RECORD_CHANNEL_CAPACITY: usize = 16 * 1024;

/// Outcome of one attempted (or deliberately not attempted) invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Ok,
    Failed,
    Timeout,
    Skipped,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Ok => "ok",
            InvocationStatus::Failed => "failed",
            InvocationStatus::Timeout => "timeout",
            InvocationStatus::Skipped => "skipped",
        }
    }
}

/// One row of the experiment log. Append-only; immutable after creation.
/// All *_ns timestamps are relative to the run start.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub function: String,
    pub minute: u32,
    pub planned_start_ns: u64,
    pub actual_start_ns: u64,
    pub end_ns: u64,
    pub requested_duration_ms: u32,
    pub memory_mib: u32,
    pub observed_duration_us: u64,
    pub response_time_us: u64,
    pub status: InvocationStatus,
    /// Failure category ("timeout", "transport", "slot_busy", "overload", ...);
    /// empty on success.
    pub error_kind: String,
    /// Dispatch happened more than 10 ms after the planned instant.
    pub late_dispatch: bool,
}

/// One row of the scheduler-mode job audit log.
#[derive(Debug, Clone, Serialize)]
pub struct JobAudit {
    pub round: u32,
    pub name: String,
    pub prev_replica: i64,
    pub new_replica: i64,
    pub deadline_ms: i64,
    pub iterations_remaining: i64,
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Spawn the single consumer of the invocation record channel. Writes one CSV
/// row per record and returns the row count once the channel drains.
pub fn spawn_record_writer(
    path: PathBuf,
    mut rx: mpsc::Receiver<InvocationRecord>,
) -> JoinHandle<Result<u64>> {
    tokio::spawn(async move {
        create_parent(&path)?;
        let file = std::fs::File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);

        let mut rows: u64 = 0;
        while let Some(record) = rx.recv().await {
            writer
                .serialize(&record)
                .map_err(|e| Error::Internal(format!("record log write: {e}")))?;
            rows += 1;
        }
        writer
            .flush()
            .map_err(|e| Error::Internal(format!("record log flush: {e}")))?;
        info!(rows, path = %path.display(), "Invocation log written");
        Ok(rows)
    })
}

/// Spawn the single consumer of the job audit channel (scheduler mode).
pub fn spawn_joblog_writer(
    path: PathBuf,
    mut rx: mpsc::Receiver<JobAudit>,
) -> JoinHandle<Result<u64>> {
    tokio::spawn(async move {
        create_parent(&path)?;
        let file = std::fs::File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);

        let mut rows: u64 = 0;
        while let Some(audit) = rx.recv().await {
            writer
                .serialize(&audit)
                .map_err(|e| Error::Internal(format!("job log write: {e}")))?;
            rows += 1;
        }
        writer
            .flush()
            .map_err(|e| Error::Internal(format!("job log flush: {e}")))?;
        Ok(rows)
    })
}

/// Spawn a newline-delimited JSON writer for an arbitrary snapshot stream
/// (used for cluster telemetry).
pub fn spawn_ndjson_writer<T>(path: PathBuf, mut rx: mpsc::Receiver<T>) -> JoinHandle<Result<u64>>
where
    T: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        create_parent(&path)?;
        let mut out = std::io::BufWriter::new(std::fs::File::create(&path)?);

        let mut rows: u64 = 0;
        while let Some(snapshot) = rx.recv().await {
            let line = serde_json::to_string(&snapshot)
                .map_err(|e| Error::Internal(format!("snapshot encode: {e}")))?;
            writeln!(out, "{line}")?;
            rows += 1;
        }
        out.flush()?;
        Ok(rows)
    })
}

/// Cluster overload detector shared between all drivers and the orchestrator.
///
/// Drivers report themselves when they cross their consecutive-failure
/// threshold; once `driver_threshold` distinct functions have reported, the
/// run is flagged and `overload.flag` is written at teardown. Cloning is
/// cheap, clones share the same underlying data via Arc.
#[derive(Debug, Clone)]
pub struct OverloadMonitor {
    reported: Arc<Mutex<HashSet<String>>>,
    driver_threshold: usize,
    tripped: Arc<AtomicBool>,
}

impl OverloadMonitor {
    pub fn new(driver_threshold: usize) -> Self {
        Self {
            reported: Arc::new(Mutex::new(HashSet::new())),
            driver_threshold: driver_threshold.max(1),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record that a driver entered overload. Idempotent per function.
    pub fn report(&self, function: &str) {
        let distinct = {
            let mut reported = self.reported.lock().unwrap_or_else(|e| e.into_inner());
            reported.insert(function.to_string());
            reported.len()
        };
        warn!(function, distinct, "Driver reported overload");
        if distinct >= self.driver_threshold && !self.tripped.swap(true, Ordering::SeqCst) {
            warn!(
                drivers = distinct,
                "Cluster overload flagged; run continues to termination"
            );
        }
    }

    /// External overload condition (e.g. queue depth past the threshold).
    pub fn trip(&self, reason: &str) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            warn!(reason, "Cluster overload flagged");
        }
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Write the sentinel file if the run went into overload. Returns whether
    /// the flag was written.
    pub fn write_flag(&self, path: &Path) -> Result<bool> {
        if !self.tripped() {
            return Ok(false);
        }
        create_parent(path)?;
        std::fs::write(path, b"overload\n")?;
        Ok(true)
    }
}
