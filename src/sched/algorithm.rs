use tracing::warn;

/// Reconfiguration penalty applied when a proposed replica count differs from
/// the job's previous one, in milliseconds.
pub const SWITCHING_COST_MS: i64 = 1000;

/// One allocation unit serves this many samples of a batch.
pub const BATCH_UNIT: i64 = 32;

/// One pending job as seen by the planner in a single round.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub batchsize: i64,
    pub deadline_ms: i64,
    pub iterations: i64,
    pub prev_replica: i64,
}

impl JobDescriptor {
    /// Baseline parallelism: the replica count at which the batch fits.
    pub fn desired_replicas(&self) -> i64 {
        (self.batchsize / BATCH_UNIT).max(0)
    }
}

/// Replica counts in the exact input order of the job batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaPlan {
    pub replicas: Vec<(String, i64)>,
}

impl ReplicaPlan {
    pub fn total(&self) -> i64 {
        self.replicas.iter().map(|(_, r)| r).sum()
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.replicas
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| *r)
    }
}

/// Permitted replica counts: single GPUs, GPU pairs, and node-sized
/// multiples of four, bounded by the cluster's GPU total.
pub fn allocation_set(total_gpu: i64) -> Vec<i64> {
    let mut set = vec![1, 2];
    let mut k = 4;
    while k <= total_gpu {
        set.push(k);
        k += 4;
    }
    set
}

/// Estimated time for a job to finish on `replicas` GPUs. Integer division
/// runs left to right, matching the wire units (ms).
fn remaining_time_ms(job: &JobDescriptor, runtime_ms: i64, replicas: i64) -> i64 {
    job.batchsize * runtime_ms / BATCH_UNIT * job.iterations / replicas
}

/// Compute the replica plan for one round.
///
/// Jobs are served in deadline order (stable within ties). Each job gets the
/// smallest permitted count, at or above its desired parallelism and within
/// the remaining budget, whose estimated remaining time plus switching cost
/// beats the deadline strictly; jobs no count can satisfy get zero. A second
/// pass hands leftover GPUs to still-empty jobs in input order, up to their
/// desired parallelism. The plan never exceeds `available_gpus` in total.
pub fn plan(
    jobs: &[JobDescriptor],
    available_gpus: i64,
    runtime_ms: i64,
    total_gpu: i64,
) -> ReplicaPlan {
    let mut replicas: Vec<(String, i64)> = jobs.iter().map(|j| (j.name.clone(), 0)).collect();
    let mut remaining = available_gpus.max(0);
    if remaining == 0 || jobs.is_empty() {
        return ReplicaPlan { replicas };
    }

    let set = allocation_set(total_gpu);

    let mut order: Vec<(usize, &JobDescriptor)> = jobs.iter().enumerate().collect();
    order.sort_by_key(|(_, j)| j.deadline_ms);

    for (slot, job) in order {
        if remaining == 0 {
            break;
        }
        if job.batchsize <= 0 || job.iterations <= 0 || job.deadline_ms <= 0 || runtime_ms <= 0 {
            warn!(
                job = %job.name,
                batchsize = job.batchsize,
                iterations = job.iterations,
                deadline_ms = job.deadline_ms,
                "Non-positive job parameters, assigning zero replicas"
            );
            continue;
        }

        let desired = job.desired_replicas();
        let mut allocated = 0;
        for &candidate in &set {
            if candidate < desired || candidate > remaining {
                continue;
            }
            let eta = remaining_time_ms(job, runtime_ms, candidate);
            let switch = if candidate != job.prev_replica {
                SWITCHING_COST_MS
            } else {
                0
            };
            if eta + switch < job.deadline_ms {
                allocated = candidate;
                break;
            }
        }

        replicas[slot].1 = allocated;
        remaining -= allocated;
    }

    // Second pass: leftover budget goes to jobs that got nothing, in input
    // order, capped at their desired parallelism.
    for (slot, job) in jobs.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if replicas[slot].1 == 0 {
            let lift = job.desired_replicas().min(remaining);
            if lift > 0 {
                replicas[slot].1 = lift;
                remaining -= lift;
            }
        }
    }

    ReplicaPlan { replicas }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, batchsize: i64, deadline_ms: i64, iterations: i64, prev: i64) -> JobDescriptor {
        JobDescriptor {
            name: name.into(),
            batchsize,
            deadline_ms,
            iterations,
            prev_replica: prev,
        }
    }

    fn counts(plan: &ReplicaPlan) -> Vec<i64> {
        plan.replicas.iter().map(|(_, r)| *r).collect()
    }

    #[test]
    fn allocation_set_is_singles_pairs_and_node_multiples() {
        assert_eq!(allocation_set(8), vec![1, 2, 4, 8]);
        assert_eq!(allocation_set(40), vec![1, 2, 4, 8, 12, 16, 20, 24, 28, 32, 36, 40]);
        assert_eq!(allocation_set(2), vec![1, 2]);
    }

    #[test]
    fn happy_path_assigns_pairs_to_all_three_jobs() {
        // remaining = 64 * 50 / 32 * 10 / 2 = 500 ms, plus 1000 ms switching
        // cost, strictly under the 5000 ms deadline.
        let jobs = vec![
            job("a", 64, 5000, 10, 0),
            job("b", 64, 5000, 10, 0),
            job("c", 64, 5000, 10, 0),
        ];
        let plan = plan(&jobs, 8, 50, 8);
        assert_eq!(counts(&plan), vec![2, 2, 2]);
        assert_eq!(plan.total(), 6);
    }

    #[test]
    fn second_pass_lifts_unsatisfiable_jobs_to_desired() {
        // No permitted count beats a 100 ms deadline, so the first pass
        // leaves both jobs empty and the second pass hands out desired
        // parallelism, leaving 2 of 6 GPUs unused.
        let jobs = vec![job("a", 64, 100, 10, 0), job("b", 64, 100, 10, 0)];
        let plan = plan(&jobs, 6, 50, 8);
        assert_eq!(counts(&plan), vec![2, 2]);
        assert_eq!(plan.total(), 4);
    }

    #[test]
    fn zero_gpus_yields_all_zero_plan() {
        let jobs = vec![job("a", 64, 5000, 10, 0)];
        let plan = plan(&jobs, 0, 50, 8);
        assert_eq!(counts(&plan), vec![0]);
    }

    #[test]
    fn empty_batch_yields_empty_plan() {
        let plan = plan(&[], 8, 50, 8);
        assert!(plan.replicas.is_empty());
    }

    #[test]
    fn deadline_test_is_strict() {
        // eta = 128 * 50 / 32 * 10 / 4 = 500; prev matches so no switching
        // cost. A deadline of exactly 500 must NOT be satisfied by 4 GPUs,
        // pushing the job to the next permitted count.
        let exact = vec![job("a", 128, 500, 10, 4)];
        let plan_exact = plan(&exact, 8, 50, 8);
        // 8 GPUs: eta = 250 + switching 1000 = 1250, also over; first pass
        // fails entirely, second pass lifts to desired (4).
        assert_eq!(counts(&plan_exact), vec![4]);

        let above = vec![job("a", 128, 501, 10, 4)];
        let plan_above = plan(&above, 8, 50, 8);
        assert_eq!(counts(&plan_above), vec![4]);
        // Same count, but now through the first pass: the leftover budget
        // proves it. With deadline 501 the job is satisfied at 4 and the
        // plan total equals 4 either way; distinguish via a second job that
        // only fits if the budget survived the first pass.
        let pair = vec![job("a", 128, 501, 10, 4), job("b", 64, 5000, 10, 0)];
        let plan_pair = plan(&pair, 6, 50, 8);
        assert_eq!(counts(&plan_pair), vec![4, 2]);
    }

    #[test]
    fn switching_cost_prefers_previous_allocation() {
        // eta at 2 GPUs is 500 ms. Deadline 600: only a job keeping its
        // previous pair avoids the 1000 ms switching cost and passes the
        // first pass; with the budget exhausted by the incumbent, the
        // newcomer is left at zero.
        let jobs = vec![job("keeper", 64, 600, 10, 2), job("mover", 64, 600, 10, 0)];
        let plan = plan(&jobs, 2, 50, 8);
        assert_eq!(counts(&plan), vec![2, 0]);
    }

    #[test]
    fn earlier_deadline_is_served_first() {
        // "soon" wins the only pair despite arriving second in input order.
        let jobs = vec![job("late", 64, 9000, 10, 0), job("soon", 64, 3000, 10, 0)];
        let plan = plan(&jobs, 2, 50, 8);
        assert_eq!(plan.get("soon"), Some(2));
        assert_eq!(plan.get("late"), Some(0));
    }

    #[test]
    fn equal_deadlines_keep_input_order() {
        let jobs = vec![job("first", 64, 3000, 10, 0), job("second", 64, 3000, 10, 0)];
        let plan = plan(&jobs, 2, 50, 8);
        assert_eq!(counts(&plan), vec![2, 0]);
    }

    #[test]
    fn non_positive_parameters_plan_zero_without_aborting() {
        let jobs = vec![
            job("bad", -64, 5000, 10, 0),
            job("good", 64, 5000, 10, 0),
            job("worse", 64, 5000, 0, 0),
        ];
        let plan = plan(&jobs, 8, 50, 8);
        assert_eq!(plan.get("bad"), Some(0));
        assert_eq!(plan.get("good"), Some(2));
        assert_eq!(plan.get("worse"), Some(0));
    }

    #[test]
    fn plan_never_exceeds_the_gpu_budget() {
        for budget in 0..12 {
            let jobs = vec![
                job("a", 256, 60_000, 5, 0),
                job("b", 128, 60_000, 5, 0),
                job("c", 64, 60_000, 5, 0),
            ];
            let plan = plan(&jobs, budget, 50, 40);
            assert!(
                plan.total() <= budget,
                "budget {budget} exceeded: {:?}",
                plan.replicas
            );
        }
    }
}
