pub mod loader;

use std::sync::Arc;

/// Percentile labels of the duration statistics columns, in ms.
pub const DURATION_PCTS: [f64; 7] = [0.0, 1.0, 25.0, 50.0, 75.0, 99.0, 100.0];

/// Percentile labels of the memory statistics columns, in MiB.
pub const MEMORY_PCTS: [f64; 8] = [1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0, 100.0];

/// Empirical runtime statistics of one function, as preprocessed from the
/// provider trace. Units are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationStats {
    pub average: f64,
    pub count: f64,
    pub minimum: f64,
    pub maximum: f64,
    /// Values at [`DURATION_PCTS`].
    pub percentiles: [f64; 7],
}

/// Empirical allocated-memory statistics of one function, in MiB.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    pub sample_count: f64,
    pub average: f64,
    /// Values at [`MEMORY_PCTS`].
    pub percentiles: [f64; 8],
}

/// Per-minute job parameters, scheduler mode only. Indexed by measured
/// minute; a zero iterations entry means the job is inactive that minute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSeries {
    pub iterations: Vec<i64>,
    pub batchsize: Vec<i64>,
    pub deadline_ms: Vec<i64>,
}

impl JobSeries {
    pub fn active(&self, minute: usize) -> bool {
        self.iterations.get(minute).copied().unwrap_or(0) > 0
    }
}

/// One function of the trace. Immutable after bootstrap; the hash is the sole
/// join key across the input CSVs, the name is what the cluster knows it as.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub hash: String,
    /// Resolved executor URL, e.g. "http://trace-func-0-a1b2c3d4.default.svc.cluster.local:80".
    pub endpoint: String,
    /// Invocations per measured minute (minute column 1 lands at index 0).
    pub ipm: Vec<u32>,
    /// Invocations per warm-up ramp minute, chronological, from negative
    /// minute columns. Empty when the trace carries no ramp.
    pub warmup_ipm: Vec<u32>,
    pub duration: DurationStats,
    pub memory: MemoryStats,
    pub jobs: Option<JobSeries>,
}

/// A fully resolved trace: the immutable function set of one run.
#[derive(Debug, Clone)]
pub struct Trace {
    pub functions: Vec<Arc<Function>>,
}
