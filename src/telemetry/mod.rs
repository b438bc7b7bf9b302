use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metric::OverloadMonitor;

/// Sentinel recorded when a metric is missing or its query errored. Snapshots
/// are never skipped, so the time series stays aligned with the run clock.
pub const MISSING: f64 = -99.0;

/// A node counts as active when its CPU utilization is at or above this.
pub const ACTIVE_NODE_CPU_PCT: f64 = 5.0;

/// Activator queue depth beyond which the run is flagged as overloaded.
pub const QUEUE_OVERLOAD_THRESHOLD: f64 = 1_000.0;

/// Core count of the node the driver runs on. The driver's own CPU share is
/// reported per core and must be normalized to [0, 100] before it is
/// subtracted from the master reading.
pub const LOADER_TOTAL_CORES: f64 = 8.0;

/// Current replica count of one deployment, suffix-trimmed to the function
/// name (each function is deployed exactly once).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentScale {
    pub deployment: String,
    pub scale: i64,
}

/// A point-in-time snapshot of cluster state, one per scrape interval,
/// appended as newline-delimited JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub timestamp: String,
    /// Offset since the run start, for alignment with the invocation log.
    pub offset_ms: i64,
    pub master_cpu_pct: f64,
    pub master_mem_pct: f64,
    /// Per-worker-node CPU utilization, in instance order.
    pub cpu_pct: Vec<f64>,
    /// Per-worker-node memory utilization, in instance order.
    pub memory_pct_nodes: Vec<f64>,
    pub cpu_pct_avg: f64,
    pub cpu_pct_active_avg: f64,
    pub cpu_pct_max: f64,
    /// Active-node memory average.
    pub memory_pct: f64,
    pub desired_pods: i64,
    pub requested_pods: i64,
    pub running_pods: i64,
    pub unready_pods: i64,
    pub pending_pods: i64,
    pub terminating_pods: i64,
    pub activator_request_count: i64,
    pub autoscaler_stable_queue: f64,
    pub autoscaler_panic_queue: f64,
    pub activator_queue: f64,
    pub scheduling_p50: f64,
    pub scheduling_p95: f64,
    pub scheduling_p99: f64,
    pub scales: Vec<DeploymentScale>,
}

/// Extract `(label, value)` pairs from a Prometheus instant-vector reply.
/// The label is whichever of `instance`/`deployment` is present.
fn parse_vector(body: &Value) -> Option<Vec<(String, f64)>> {
    if body.get("status")?.as_str()? != "success" {
        return None;
    }
    let result = body.get("data")?.get("result")?.as_array()?;
    let mut out = Vec::with_capacity(result.len());
    for item in result {
        let metric = item.get("metric")?;
        let label = metric
            .get("instance")
            .or_else(|| metric.get("deployment"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let value: f64 = item.get("value")?.get(1)?.as_str()?.parse().ok()?;
        out.push((label, value));
    }
    Some(out)
}

/// Collapse NaN (e.g. a quantile over an empty histogram) into the sentinel.
fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        MISSING
    } else {
        value
    }
}

/// Worker-node aggregates: (avg, active avg, max, active memory avg).
fn aggregate_nodes(cpu: &[f64], memory: &[f64]) -> (f64, f64, f64, f64) {
    if cpu.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let avg = cpu.iter().sum::<f64>() / cpu.len() as f64;
    let max = cpu.iter().cloned().fold(f64::MIN, f64::max);

    let mut active_nodes = 0usize;
    let mut active_cpu = 0.0;
    let mut active_mem = 0.0;
    for (&c, &m) in cpu.iter().zip(memory) {
        if c >= ACTIVE_NODE_CPU_PCT {
            active_cpu += c;
            active_mem += m;
            active_nodes += 1;
        }
    }
    let divisor = active_nodes.max(1) as f64;
    (avg, active_cpu / divisor, max, active_mem / divisor)
}

/// Master-node readings include the driver's own footprint (the driver runs
/// on the master); subtract it, clamped at zero. A sentinel reading passes
/// through untouched.
fn deduct_loader_share(node_pct: f64, loader_pct: f64) -> f64 {
    if node_pct == MISSING {
        return MISSING;
    }
    (node_pct - loader_pct).max(0.0)
}

/// Deployments carry a two-segment replica-set style suffix; cut it off to
/// recover the function name.
fn trim_deployment_suffix(name: &str) -> String {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() > 2 {
        parts[..parts.len() - 2].join("-")
    } else {
        name.to_string()
    }
}

/// Prometheus scraper: evaluates the fixed query set of one snapshot.
pub struct PromScraper {
    http: reqwest::Client,
    base_url: String,
}

impl PromScraper {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Run one instant query; `None` covers transport errors and malformed
    /// replies alike, turning into sentinels at the call sites.
    async fn query(&self, promql: &str) -> Option<Vec<(String, f64)>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", promql)])
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        parse_vector(&body)
    }

    async fn scalar(&self, promql: &str) -> f64 {
        match self.query(promql).await {
            Some(values) if !values.is_empty() => sanitize(values[0].1),
            _ => MISSING,
        }
    }

    async fn scalar_int(&self, promql: &str) -> i64 {
        let v = self.scalar(promql).await;
        if v == MISSING {
            MISSING as i64
        } else {
            v as i64
        }
    }

    /// Per-node vector, sorted by instance so the master (first node) is
    /// stable across snapshots.
    async fn node_vector(&self, promql: &str) -> Vec<(String, f64)> {
        let mut values = self.query(promql).await.unwrap_or_default();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    /// The driver's own CPU share, normalized to [0, 100]. Missing loader
    /// metrics mean nothing to subtract, not a sentinel.
    async fn loader_cpu_share(&self) -> f64 {
        let per_core = self
            .scalar("sum(rate(process_cpu_seconds_total{job=\"loader\"}[30s])) * 100")
            .await;
        if per_core == MISSING {
            0.0
        } else {
            (per_core / LOADER_TOTAL_CORES).max(0.0)
        }
    }

    /// The driver's own memory share as a percentage of the master node's
    /// total memory.
    async fn loader_mem_share(&self, master_instance: Option<&str>) -> f64 {
        let Some(instance) = master_instance else {
            return 0.0;
        };
        let promql = format!(
            "100 * sum(process_resident_memory_bytes{{job=\"loader\"}}) \
             / sum(node_memory_MemTotal_bytes{{instance=\"{instance}\"}})"
        );
        let share = self.scalar(&promql).await;
        if share == MISSING {
            0.0
        } else {
            share.max(0.0)
        }
    }

    /// Evaluate the full query set into one snapshot.
    pub async fn collect(&self, run_start: Instant) -> ClusterSnapshot {
        let node_cpu = self
            .node_vector(
                "100 - (avg by (instance) (rate(node_cpu_seconds_total{mode=\"idle\"}[30s])) * 100)",
            )
            .await;
        let node_mem = self
            .node_vector(
                "100 * (1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes))",
            )
            .await;

        // First node is the master; the rest are workers.
        let (master_cpu_pct, cpu_pct): (f64, Vec<f64>) = match node_cpu.split_first() {
            Some(((_, master), workers)) => (*master, workers.iter().map(|(_, v)| *v).collect()),
            None => (MISSING, Vec::new()),
        };
        let (master_mem_pct, memory_pct_nodes): (f64, Vec<f64>) = match node_mem.split_first() {
            Some(((_, master), workers)) => (*master, workers.iter().map(|(_, v)| *v).collect()),
            None => (MISSING, Vec::new()),
        };

        // The driver shares the master node; deduct its own footprint so the
        // master reading reflects cluster work only.
        let master_instance = node_mem.first().map(|(instance, _)| instance.clone());
        let loader_cpu = self.loader_cpu_share().await;
        let loader_mem = self.loader_mem_share(master_instance.as_deref()).await;
        let master_cpu_pct = deduct_loader_share(master_cpu_pct, loader_cpu);
        let master_mem_pct = deduct_loader_share(master_mem_pct, loader_mem);

        let (cpu_pct_avg, cpu_pct_active_avg, cpu_pct_max, memory_pct) =
            aggregate_nodes(&cpu_pct, &memory_pct_nodes);

        let quantile = |q: &str| {
            format!(
                "histogram_quantile({q}, sum by (le) (rate(scheduler_e2e_scheduling_duration_seconds_bucket{{job=\"kube-scheduler\"}}[30s])))"
            )
        };

        let scales = self
            .query("kube_deployment_status_replicas")
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(deployment, scale)| DeploymentScale {
                deployment: trim_deployment_suffix(&deployment),
                scale: scale as i64,
            })
            .collect();

        ClusterSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            offset_ms: Instant::now().saturating_duration_since(run_start).as_millis() as i64,
            master_cpu_pct,
            master_mem_pct,
            cpu_pct,
            memory_pct_nodes,
            cpu_pct_avg,
            cpu_pct_active_avg,
            cpu_pct_max,
            memory_pct,
            desired_pods: self.scalar_int("sum(autoscaler_desired_pods)").await,
            requested_pods: self.scalar_int("sum(autoscaler_requested_pods)").await,
            running_pods: self.scalar_int("sum(autoscaler_actual_pods)").await,
            unready_pods: self.scalar_int("sum(autoscaler_not_ready_pods)").await,
            pending_pods: self.scalar_int("sum(autoscaler_pending_pods)").await,
            terminating_pods: self.scalar_int("sum(autoscaler_terminating_pods)").await,
            activator_request_count: self.scalar_int("sum(activator_request_count)").await,
            autoscaler_stable_queue: self
                .scalar("avg(autoscaler_stable_request_concurrency)")
                .await,
            autoscaler_panic_queue: self
                .scalar("avg(autoscaler_panic_request_concurrency)")
                .await,
            activator_queue: self.scalar("avg(activator_request_concurrency)").await,
            scheduling_p50: self.scalar(&quantile("0.50")).await,
            scheduling_p95: self.scalar(&quantile("0.95")).await,
            scheduling_p99: self.scalar(&quantile("0.99")).await,
            scales,
        }
    }
}

/// Spawn the background scrape task. Snapshots flow to the NDJSON writer;
/// a queue depth past the threshold trips the overload monitor.
pub fn spawn_collector(
    scraper: PromScraper,
    period: Duration,
    run_start: Instant,
    tx: mpsc::Sender<ClusterSnapshot>,
    overload: OverloadMonitor,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate, skip it
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let snapshot = scraper.collect(run_start).await;
            if snapshot.activator_queue != MISSING
                && snapshot.activator_queue > QUEUE_OVERLOAD_THRESHOLD
            {
                overload.trip("activator queue depth");
            }
            debug!(offset_ms = snapshot.offset_ms, "Cluster snapshot collected");
            if tx.send(snapshot).await.is_err() {
                warn!("Snapshot writer gone, stopping metric scraping");
                break;
            }
        }
    })
}
