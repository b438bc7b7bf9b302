use std::time::Instant;

use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::pb::sched::planner_server::{Planner, PlannerServer};
use crate::pb::sched::{SchedReply, SchedRequest};
use crate::sched::algorithm::{self, JobDescriptor};

/// gRPC surface of the elastic replica planner. Stateless across rounds: all
/// round context arrives on the request stream.
pub struct PlannerService {
    total_gpu: i64,
}

impl PlannerService {
    pub fn new(total_gpu: i64) -> Self {
        Self { total_gpu }
    }

    pub fn into_server(self) -> PlannerServer<Self> {
        PlannerServer::new(self)
    }
}

#[tonic::async_trait]
impl Planner for PlannerService {
    async fn plan_stream(
        &self,
        request: Request<Streaming<SchedRequest>>,
    ) -> Result<Response<SchedReply>, Status> {
        let started = Instant::now();
        let mut stream = request.into_inner();

        let mut jobs = Vec::new();
        let mut available_gpus = 0;
        let mut runtime_ms = 0;
        let mut sched_alg = String::new();
        while let Some(req) = stream.message().await? {
            // Trailing context: the last message's values win.
            available_gpus = req.available_gpu;
            runtime_ms = req.runtime_in_milli_sec;
            sched_alg = req.sched_alg;
            jobs.push(JobDescriptor {
                name: req.invocation_name,
                batchsize: req.batchsize,
                deadline_ms: req.deadline,
                iterations: req.iterations,
                prev_replica: req.prev_replica,
            });
        }

        info!(
            jobs = jobs.len(),
            available_gpus,
            sched_alg = %sched_alg,
            "Scheduling round received"
        );

        let plan = match sched_alg.as_str() {
            "elastic" | "elastic_flow" | "infless" => {
                algorithm::plan(&jobs, available_gpus, runtime_ms, self.total_gpu)
            }
            other => {
                warn!(sched_alg = %other, "Unknown scheduling algorithm, returning all-zero plan");
                algorithm::ReplicaPlan {
                    replicas: jobs.iter().map(|j| (j.name.clone(), 0)).collect(),
                }
            }
        };

        let (invocation_name, replica): (Vec<String>, Vec<i64>) =
            plan.replicas.into_iter().unzip();
        let sched_overhead = started.elapsed().as_secs() as i64;
        Ok(Response::new(SchedReply {
            invocation_name,
            replica,
            sched_overhead,
        }))
    }
}
