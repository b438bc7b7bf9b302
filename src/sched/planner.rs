use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::metric::JobAudit;
use crate::pb::sched::planner_client::PlannerClient;
use crate::pb::sched::SchedRequest;
use crate::trace::Trace;

/// Fixed deadline of one planner RPC.
pub const SCHED_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque resize surface of the function runtime. The planner only requests
/// replica counts; whatever acts on them is outside the driver.
#[async_trait]
pub trait ReplicaApplier: Send + Sync {
    async fn resize(&self, endpoint: &str, replicas: i64) -> std::result::Result<(), String>;
}

/// Default applier: POST the count to the function's resize endpoint.
pub struct HttpReplicaApplier {
    http: reqwest::Client,
}

impl HttpReplicaApplier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpReplicaApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaApplier for HttpReplicaApplier {
    async fn resize(&self, endpoint: &str, replicas: i64) -> std::result::Result<(), String> {
        let response = self
            .http
            .post(format!("{endpoint}/resize"))
            .timeout(Duration::from_secs(5))
            .json(&serde_json::json!({ "replicas": replicas }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        Ok(())
    }
}

/// One job entering a scheduling round, refreshed from the trace each minute.
#[derive(Debug, Clone)]
pub struct RoundJob {
    pub name: String,
    pub endpoint: String,
    pub batchsize: i64,
    pub deadline_ms: i64,
    pub iterations: i64,
    pub runtime_ms: i64,
}

/// Gather the jobs still in service at a measured minute.
pub fn round_jobs(trace: &Trace, minute: usize) -> Vec<RoundJob> {
    trace
        .functions
        .iter()
        .filter_map(|f| {
            let jobs = f.jobs.as_ref()?;
            if !jobs.active(minute) {
                return None;
            }
            Some(RoundJob {
                name: f.name.clone(),
                endpoint: f.endpoint.clone(),
                batchsize: jobs.batchsize.get(minute).copied().unwrap_or(0),
                deadline_ms: jobs.deadline_ms.get(minute).copied().unwrap_or(0),
                iterations: jobs.iterations.get(minute).copied().unwrap_or(0),
                runtime_ms: f.duration.average.round() as i64,
            })
        })
        .collect()
}

/// Per-minute planner client: streams the job batch to the planner, applies
/// the returned counts, and keeps the only cross-round state there is, the
/// previous replica of each job.
pub struct PlannerDriver {
    client: PlannerClient<Channel>,
    applier: Arc<dyn ReplicaApplier>,
    sched_alg: &'static str,
    total_gpu: i64,
    prev: HashMap<String, i64>,
    audits: mpsc::Sender<JobAudit>,
}

impl PlannerDriver {
    pub async fn connect(
        cfg: &RunConfig,
        applier: Arc<dyn ReplicaApplier>,
        audits: mpsc::Sender<JobAudit>,
    ) -> Result<Self> {
        let client = PlannerClient::connect(cfg.sched_endpoint.clone())
            .await
            .map_err(|e| {
                Error::Scheduler(format!(
                    "cannot reach planner at {}: {e}",
                    cfg.sched_endpoint
                ))
            })?;
        Ok(Self {
            client,
            applier,
            sched_alg: cfg.sched_alg.as_str(),
            total_gpu: cfg.total_gpu,
            prev: HashMap::new(),
            audits,
        })
    }

    /// Wrap an already-established client (tests, in-process planner).
    pub fn with_client(
        client: PlannerClient<Channel>,
        applier: Arc<dyn ReplicaApplier>,
        sched_alg: &'static str,
        total_gpu: i64,
        audits: mpsc::Sender<JobAudit>,
    ) -> Self {
        Self {
            client,
            applier,
            sched_alg,
            total_gpu,
            prev: HashMap::new(),
            audits,
        }
    }

    /// Run one scheduling round. Resizes are applied before the caller hands
    /// specs to the drivers. On a planner failure the round is dropped:
    /// previous replica counts remain in force and the run continues.
    pub async fn run_round(&mut self, round: u32, jobs: Vec<RoundJob>) {
        if jobs.is_empty() {
            return;
        }

        let requests: Vec<SchedRequest> = jobs
            .iter()
            .map(|j| SchedRequest {
                invocation_name: j.name.clone(),
                batchsize: j.batchsize,
                deadline: j.deadline_ms,
                iterations: j.iterations,
                prev_replica: self.prev.get(&j.name).copied().unwrap_or(0),
                runtime_in_milli_sec: j.runtime_ms,
                available_gpu: self.total_gpu,
                sched_alg: self.sched_alg.to_string(),
            })
            .collect();

        let outbound = tokio_stream::iter(requests.clone());
        let reply = match tokio::time::timeout(
            SCHED_RPC_TIMEOUT,
            self.client.plan_stream(tonic::Request::new(outbound)),
        )
        .await
        {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => {
                warn!(round, error = %status, "Planner stream failed; previous replica counts remain in force");
                return;
            }
            Err(_) => {
                warn!(round, "Planner deadline exceeded; previous replica counts remain in force");
                return;
            }
        };

        if reply.invocation_name.len() != reply.replica.len() {
            warn!(
                round,
                names = reply.invocation_name.len(),
                replicas = reply.replica.len(),
                "Malformed planner reply; previous replica counts remain in force"
            );
            return;
        }
        let plan: HashMap<&String, i64> = reply
            .invocation_name
            .iter()
            .zip(reply.replica.iter().copied())
            .collect();

        for (job, request) in jobs.iter().zip(&requests) {
            let new_replica = plan.get(&job.name).copied().unwrap_or(0);
            if let Err(e) = self.applier.resize(&job.endpoint, new_replica).await {
                // The resize surface is best-effort; arrivals tolerate the
                // race through the minute-start grace.
                warn!(function = %job.name, error = %e, "Replica resize failed");
            }
            let _ = self
                .audits
                .send(JobAudit {
                    round,
                    name: job.name.clone(),
                    prev_replica: request.prev_replica,
                    new_replica,
                    deadline_ms: job.deadline_ms,
                    iterations_remaining: job.iterations,
                })
                .await;
            self.prev.insert(job.name.clone(), new_replica);
        }

        info!(
            round,
            jobs = jobs.len(),
            overhead_s = reply.sched_overhead,
            "Scheduling round applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{DurationStats, Function, JobSeries, MemoryStats};

    fn job_function(name: &str, iterations: Vec<i64>) -> Arc<Function> {
        Arc::new(Function {
            name: name.into(),
            hash: name.into(),
            endpoint: format!("http://{name}:80"),
            ipm: vec![1; iterations.len()],
            warmup_ipm: vec![],
            duration: DurationStats {
                average: 50.0,
                count: 1.0,
                minimum: 50.0,
                maximum: 50.0,
                percentiles: [50.0; 7],
            },
            memory: MemoryStats {
                sample_count: 1.0,
                average: 128.0,
                percentiles: [128.0; 8],
            },
            jobs: Some(JobSeries {
                batchsize: vec![64; iterations.len()],
                deadline_ms: vec![5000; iterations.len()],
                iterations,
            }),
        })
    }

    #[test]
    fn round_jobs_selects_only_active_functions() {
        let trace = Trace {
            functions: vec![
                job_function("active", vec![10, 10]),
                job_function("drained", vec![10, 0]),
            ],
        };

        let first = round_jobs(&trace, 0);
        assert_eq!(first.len(), 2);

        let second = round_jobs(&trace, 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "active");
        assert_eq!(second[0].batchsize, 64);
        assert_eq!(second[0].runtime_ms, 50);
    }

    #[test]
    fn functions_without_job_series_never_enter_rounds() {
        let mut f = (*job_function("plain", vec![10])).clone();
        f.jobs = None;
        let trace = Trace {
            functions: vec![Arc::new(f)],
        };
        assert!(round_jobs(&trace, 0).is_empty());
    }
}
