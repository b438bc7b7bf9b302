use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Inter-arrival-time distribution for the invocation stream of each minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IatDistribution {
    Exponential,
    Uniform,
    Equidistant,
}

/// Which function server flavor the trace was deployed with. Only used to tag
/// output artifacts and pick sensible defaults; the driver treats every
/// endpoint as an opaque executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerKind {
    Trace,
    Wimpy,
    Empty,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Trace => "trace",
            ServerKind::Wimpy => "wimpy",
            ServerKind::Empty => "empty",
        }
    }
}

/// Replica planning algorithm; `none` disables scheduler mode entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedAlg {
    None,
    Elastic,
    #[value(name = "elastic_flow", alias = "elastic-flow")]
    ElasticFlow,
    Infless,
}

impl SchedAlg {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedAlg::None => "none",
            SchedAlg::Elastic => "elastic",
            SchedAlg::ElasticFlow => "elastic_flow",
            SchedAlg::Infless => "infless",
        }
    }
}

/// Full run configuration. Every knob of a run is an explicit flag; nothing is
/// read from process-wide state, so parallel drivers stay deterministic.
#[derive(Debug, Clone, Parser)]
#[command(name = "faasload", about = "Trace-driven serverless workload driver")]
pub struct RunConfig {
    /// Directory holding invocations.csv, durations.csv, memory.csv
    /// (+ iterations/batch/deadline.csv in scheduler mode).
    #[arg(long, default_value = "data/traces")]
    pub trace_path: PathBuf,

    /// Directory receiving experiment/cluster/joblog artifacts.
    #[arg(long, default_value = "data/out")]
    pub output_path_prefix: PathBuf,

    /// Measured experiment length in minutes.
    #[arg(long, default_value_t = 1)]
    pub duration: u32,

    /// Warm-up ramp length in minutes (0 disables the warm-up phase).
    #[arg(long, default_value_t = 0)]
    pub warmup_duration: u32,

    /// Inter-arrival-time distribution.
    #[arg(long, value_enum, default_value_t = IatDistribution::Exponential)]
    pub iat_distribution: IatDistribution,

    /// Deployed function server flavor.
    #[arg(long, value_enum, default_value_t = ServerKind::Trace)]
    pub server: ServerKind,

    /// Worker node count of the target cluster.
    #[arg(long, default_value_t = 1)]
    pub cluster: u32,

    /// Seed for all sampling; a fixed seed reproduces the exact spec stream.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Scrape cluster metrics during the run.
    #[arg(long)]
    pub enable_metrics_scraping: bool,

    /// Seconds between metric scrapes.
    #[arg(long, default_value_t = 5)]
    pub metric_scraping_period_seconds: u64,

    /// Floor for per-invocation RPC deadlines, in seconds. The effective
    /// deadline is max(2 x requested runtime, this floor).
    #[arg(long, default_value_t = 2)]
    pub grpc_timeout_seconds: u64,

    /// At most one outstanding RPC per function; arrivals finding the slot
    /// busy are recorded as skipped.
    #[arg(long)]
    pub single_slot: bool,

    /// Replica planning algorithm (`none` disables scheduler mode).
    #[arg(long, value_enum, default_value_t = SchedAlg::None)]
    pub sched_alg: SchedAlg,

    /// GPU budget handed to the replica planner each round.
    #[arg(long, default_value_t = 0)]
    pub total_gpu: i64,

    /// Invocation count multiplier; 1 replays the trace as-is, larger values
    /// synthesize proportionally heavier load.
    #[arg(long, default_value_t = 1)]
    pub function_multiplier: u32,

    /// DNS suffix functions resolve under, e.g. "default.svc.cluster.local".
    #[arg(long, default_value = "default.svc.cluster.local")]
    pub gateway: String,

    /// Port the function executors listen on.
    #[arg(long, default_value_t = 80)]
    pub function_port: u16,

    /// Prometheus base URL for metric scraping.
    #[arg(long, default_value = "http://localhost:9090")]
    pub prometheus_url: String,

    /// Replica planner (schedd) endpoint, scheduler mode only.
    #[arg(long, default_value = "http://localhost:50051")]
    pub sched_endpoint: String,

    /// Tag embedded in artifact filenames; defaults to "<duration>min".
    #[arg(long)]
    pub tag: Option<String>,

    /// Invoke functions over HTTP JSON instead of gRPC.
    #[arg(long)]
    pub http_invoker: bool,
}

impl RunConfig {
    /// Reject incoherent option combinations before any endpoint is touched.
    pub fn validate(&self) -> Result<()> {
        if self.duration == 0 {
            return Err(Error::Config("duration must be at least 1 minute".into()));
        }
        if self.function_multiplier == 0 {
            return Err(Error::Config(
                "function multiplier must be at least 1".into(),
            ));
        }
        if !self.trace_path.is_dir() {
            return Err(Error::Config(format!(
                "trace path {} is not a directory",
                self.trace_path.display()
            )));
        }
        if self.sched_alg != SchedAlg::None && self.total_gpu <= 0 {
            return Err(Error::Config(format!(
                "sched alg {} requires a positive --total-gpu",
                self.sched_alg.as_str()
            )));
        }
        if self.enable_metrics_scraping && self.metric_scraping_period_seconds == 0 {
            return Err(Error::Config(
                "metric scraping period must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_mode(&self) -> bool {
        self.sched_alg != SchedAlg::None
    }

    pub fn tag(&self) -> String {
        self.tag
            .clone()
            .unwrap_or_else(|| format!("{}min", self.duration))
    }

    fn artifact(&self, stem: &str) -> PathBuf {
        self.output_path_prefix
            .join(format!("{stem}_{}_{}.csv", self.tag(), self.server.as_str()))
    }

    /// One row per attempted (or skipped) invocation.
    pub fn experiment_csv_path(&self) -> PathBuf {
        self.artifact("experiment")
    }

    /// Newline-delimited JSON cluster snapshots.
    pub fn cluster_csv_path(&self) -> PathBuf {
        self.artifact("cluster_usage")
    }

    /// Per-round replica audit, scheduler mode only.
    pub fn joblogs_csv_path(&self) -> PathBuf {
        self.artifact("joblogs")
    }

    /// Sentinel written at teardown when the cluster went into overload.
    pub fn overload_flag_path(&self) -> PathBuf {
        self.output_path_prefix.join("overload.flag")
    }
}
