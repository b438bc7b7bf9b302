use std::sync::Arc;

use rand::rngs::StdRng;

use crate::config::IatDistribution;
use crate::generator::iat;
use crate::trace::{Function, DURATION_PCTS, MEMORY_PCTS};

/// One planned invocation. Created shortly before its minute begins, consumed
/// exactly once by the driver, never mutated.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    /// Offset within the minute, relative to the minute boundary.
    pub t_offset_ns: u64,
    pub runtime_ms: u32,
    pub memory_mib: u32,
    /// Job parameters, scheduler mode only.
    pub batchsize: Option<i64>,
    pub iterations: Option<i64>,
    pub deadline_ms: Option<i64>,
}

/// Per-function spec stream. Owns its own seeded RNG so functions can be
/// generated (and replayed) independently of each other.
pub struct SpecGenerator {
    function: Arc<Function>,
    rng: StdRng,
    dist: IatDistribution,
    multiplier: u32,
    warmup_minutes: u32,
}

impl SpecGenerator {
    pub fn new(
        function: Arc<Function>,
        rng: StdRng,
        dist: IatDistribution,
        multiplier: u32,
        warmup_minutes: u32,
    ) -> Self {
        Self {
            function,
            rng,
            dist,
            multiplier,
            warmup_minutes,
        }
    }

    /// Invocation count of warm-up ramp minute `k` (1-indexed).
    ///
    /// When the trace itself carries ramp columns they win; otherwise the
    /// ramp climbs linearly from 0 to the first measured minute's count,
    /// floor(v * k / W) in integer arithmetic.
    pub fn warmup_count(&self, k: u32) -> u32 {
        debug_assert!(k >= 1 && k <= self.warmup_minutes);
        let from_trace = self
            .function
            .warmup_ipm
            .get((k - 1) as usize)
            .copied();
        match from_trace {
            Some(v) => v * self.multiplier,
            None => {
                let v = (self.function.ipm.first().copied().unwrap_or(0) * self.multiplier) as u64;
                (v * k as u64 / self.warmup_minutes as u64) as u32
            }
        }
    }

    /// Specs for warm-up ramp minute `k` (1-indexed). Job parameters are not
    /// attached during warm-up.
    pub fn warmup_minute(&mut self, k: u32) -> Vec<InvocationSpec> {
        let count = self.warmup_count(k);
        self.specs_for_count(count, None)
    }

    /// Specs for measured minute `m` (0-indexed).
    pub fn minute(&mut self, m: usize) -> Vec<InvocationSpec> {
        let ipm = self.function.ipm.get(m).copied().unwrap_or(0);
        self.specs_for_count(ipm * self.multiplier, Some(m))
    }

    fn specs_for_count(&mut self, count: u32, job_minute: Option<usize>) -> Vec<InvocationSpec> {
        let offsets = iat::offsets(&mut self.rng, self.dist, count);

        let jobs = job_minute.and_then(|m| {
            self.function
                .jobs
                .as_ref()
                .map(|j| {
                    (
                        j.batchsize.get(m).copied().unwrap_or(0),
                        j.iterations.get(m).copied().unwrap_or(0),
                        j.deadline_ms.get(m).copied().unwrap_or(0),
                    )
                })
        });

        offsets
            .into_iter()
            .map(|t_offset_ns| {
                let d = &self.function.duration;
                let m = &self.function.memory;
                let runtime_ms = sample_stat(
                    &mut self.rng,
                    &DURATION_PCTS,
                    &d.percentiles,
                    d.count,
                    d.average,
                )
                .round() as u32;
                let memory_mib = sample_stat(
                    &mut self.rng,
                    &MEMORY_PCTS,
                    &m.percentiles,
                    m.sample_count,
                    m.average,
                )
                .round() as u32;
                InvocationSpec {
                    t_offset_ns,
                    runtime_ms,
                    memory_mib,
                    batchsize: jobs.map(|(b, _, _)| b),
                    iterations: jobs.map(|(_, i, _)| i),
                    deadline_ms: jobs.map(|(_, _, d)| d),
                }
            })
            .collect()
    }
}

/// Two-step inverse-CDF draw over an empirical percentile set: choose a
/// percentile uniformly, then interpolate linearly within the bracketing
/// bucket. A non-positive sample count falls back to the plain average.
fn sample_stat(rng: &mut StdRng, pcts: &[f64], values: &[f64], count: f64, average: f64) -> f64 {
    if count <= 0.0 {
        return average;
    }

    let u = iat::percentile_draw(rng);
    if u <= pcts[0] {
        return values[0];
    }
    for i in 0..pcts.len() - 1 {
        let (lo, hi) = (pcts[i], pcts[i + 1]);
        if u <= hi {
            let frac = (u - lo) / (hi - lo);
            return values[i] + (values[i + 1] - values[i]) * frac;
        }
    }
    values[values.len() - 1]
}
