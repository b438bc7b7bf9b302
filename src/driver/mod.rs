pub mod invoker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::generator::{InvocationSpec, MINUTE_NS};
use crate::metric::{InvocationRecord, InvocationStatus, OverloadMonitor};
use crate::trace::Function;
use invoker::{FunctionInvoker, InvokeError};

/// Consecutive failed/timed-out completions before a driver declares overload.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Dispatches later than this after the planned instant are flagged on the
/// record but still attempted.
pub const LATE_DISPATCH: Duration = Duration::from_millis(10);

/// Scheduler-mode grace at each minute start: failures inside this window are
/// recorded but do not count toward the overload threshold, because replica
/// resizes race the first arrivals.
pub const RESIZE_GRACE: Duration = Duration::from_secs(2);

/// How long a driver waits for in-flight RPCs once the run is over.
pub const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// One minute of work: the wall slot (0-based, warm-up included) and the
/// ordered specs for it.
#[derive(Debug)]
pub struct MinuteBatch {
    pub slot: u32,
    pub specs: Vec<InvocationSpec>,
}

/// Observable driver state, derived from the slot occupancy and the
/// per-minute overload throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Ready,
    InFlight,
    Throttled,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// At most one outstanding RPC; arrivals finding the slot busy are skipped.
    pub single_slot: bool,
    /// Floor for the per-invocation deadline max(2 x runtime, floor).
    pub rpc_timeout_floor: Duration,
    /// Enable the minute-start failure grace (scheduler mode).
    pub resize_grace: bool,
}

/// Restores planned-start order over out-of-order RPC completions. Records
/// enter keyed by their arrival sequence number and leave in sequence.
#[derive(Debug, Default)]
struct ReorderBuffer {
    next: u64,
    pending: BTreeMap<u64, InvocationRecord>,
}

impl ReorderBuffer {
    /// Insert a completed record; returns the run of records that became
    /// ready to emit, in sequence order.
    fn push(&mut self, seq: u64, record: InvocationRecord) -> Vec<InvocationRecord> {
        self.pending.insert(seq, record);
        let mut ready = Vec::new();
        while let Some(record) = self.pending.remove(&self.next) {
            ready.push(record);
            self.next += 1;
        }
        ready
    }

    /// Emit everything left, in key order, skipping over lost sequence
    /// numbers. Only used at teardown after the drain grace expires.
    fn drain(&mut self) -> Vec<InvocationRecord> {
        let drained: Vec<_> = std::mem::take(&mut self.pending).into_values().collect();
        self.next += drained.len() as u64;
        drained
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A completed (or skipped) invocation on its way back to the driver.
struct Completion {
    seq: u64,
    record: InvocationRecord,
    /// Completion happened inside the resize grace window.
    in_grace: bool,
}

/// Per-function invocation driver: the serial arrival scheduler that turns
/// minute batches of specs into RPCs and records.
///
/// One long-lived task per function. The arrival loop sleeps to absolute
/// deadlines; RPCs are launched fire-and-forget and their completions are
/// absorbed between arrivals, re-sequenced into planned-start order before
/// they reach the shared record log.
pub struct FunctionDriver {
    function: Arc<Function>,
    invoker: Arc<dyn FunctionInvoker>,
    records: mpsc::Sender<InvocationRecord>,
    overload: OverloadMonitor,
    cfg: DriverConfig,
    run_start: Instant,
}

fn ns_since(run_start: Instant, t: Instant) -> u64 {
    t.saturating_duration_since(run_start).as_nanos() as u64
}

impl FunctionDriver {
    pub fn new(
        function: Arc<Function>,
        invoker: Arc<dyn FunctionInvoker>,
        records: mpsc::Sender<InvocationRecord>,
        overload: OverloadMonitor,
        cfg: DriverConfig,
        run_start: Instant,
    ) -> Self {
        Self {
            function,
            invoker,
            records,
            overload,
            cfg,
            run_start,
        }
    }

    /// Effective RPC deadline for a spec.
    fn rpc_deadline(&self, spec: &InvocationSpec) -> Duration {
        Duration::from_millis(2 * spec.runtime_ms as u64).max(self.cfg.rpc_timeout_floor)
    }

    pub async fn run(
        self,
        mut batches: mpsc::Receiver<MinuteBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(4096);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut reorder = ReorderBuffer::default();
        let mut next_seq: u64 = 0;
        let mut outstanding: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        'minutes: loop {
            let batch = tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let minute_base_ns = batch.slot as u64 * MINUTE_NS;
            let minute_start = self.run_start + Duration::from_nanos(minute_base_ns);
            let grace_until = minute_start + RESIZE_GRACE;
            // Overload throttles the remainder of this minute only.
            let mut throttled = false;

            for spec in batch.specs {
                let seq = next_seq;
                next_seq += 1;
                let planned_ns = minute_base_ns + spec.t_offset_ns;
                let target = self.run_start + Duration::from_nanos(planned_ns);

                // Sleep to the absolute planned instant, absorbing RPC
                // completions while waiting.
                loop {
                    tokio::select! {
                        _ = sleep_until(target) => break,
                        Some(done) = done_rx.recv() => {
                            outstanding -= 1;
                            self.absorb(done, &mut reorder, &mut consecutive_failures, &mut throttled)
                                .await;
                        }
                        _ = shutdown.changed() => break 'minutes,
                    }
                }

                if throttled {
                    self.skip(seq, batch.slot, planned_ns, &spec, "overload", &mut reorder)
                        .await;
                    continue;
                }
                if self.cfg.single_slot && in_flight.load(Ordering::SeqCst) > 0 {
                    self.skip(seq, batch.slot, planned_ns, &spec, "slot_busy", &mut reorder)
                        .await;
                    continue;
                }

                let now = Instant::now();
                let late = now.saturating_duration_since(target) > LATE_DISPATCH;
                if late {
                    debug!(
                        function = %self.function.name,
                        behind_us = now.saturating_duration_since(target).as_micros() as u64,
                        "Late dispatch"
                    );
                }

                let in_grace = self.cfg.resize_grace && now < grace_until;
                outstanding += 1;
                in_flight.fetch_add(1, Ordering::SeqCst);
                self.fire(
                    seq,
                    batch.slot,
                    planned_ns,
                    spec,
                    late,
                    in_grace,
                    done_tx.clone(),
                    Arc::clone(&in_flight),
                );
            }

            let state = if throttled {
                DriverState::Throttled
            } else if in_flight.load(Ordering::SeqCst) > 0 {
                DriverState::InFlight
            } else {
                DriverState::Ready
            };
            debug!(
                function = %self.function.name,
                slot = batch.slot,
                state = ?state,
                "Minute arrivals dispatched"
            );
        }

        // Run is over (or cancelled): wait out in-flight RPCs, bounded by the
        // grace window, then flush whatever order the buffer still holds.
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        while outstanding > 0 {
            match tokio::time::timeout_at(drain_deadline, done_rx.recv()).await {
                Ok(Some(done)) => {
                    outstanding -= 1;
                    let mut throttled = true; // no more arrivals to throttle
                    self.absorb(done, &mut reorder, &mut consecutive_failures, &mut throttled)
                        .await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        function = %self.function.name,
                        outstanding,
                        "Drain grace expired with RPCs still in flight"
                    );
                    break;
                }
            }
        }
        if !reorder.is_empty() {
            for record in reorder.drain() {
                let _ = self.records.send(record).await;
            }
        }
    }

    /// Process one completion: overload accounting, then ordered emission.
    async fn absorb(
        &self,
        done: Completion,
        reorder: &mut ReorderBuffer,
        consecutive_failures: &mut u32,
        throttled: &mut bool,
    ) {
        match done.record.status {
            InvocationStatus::Ok => *consecutive_failures = 0,
            InvocationStatus::Failed | InvocationStatus::Timeout if !done.in_grace => {
                *consecutive_failures += 1;
                if *consecutive_failures >= FAILURE_THRESHOLD && !*throttled {
                    *throttled = true;
                    *consecutive_failures = 0;
                    self.overload.report(&self.function.name);
                }
            }
            _ => {}
        }

        for record in reorder.push(done.seq, done.record) {
            let _ = self.records.send(record).await;
        }
    }

    /// Record an arrival that never fired.
    async fn skip(
        &self,
        seq: u64,
        slot: u32,
        planned_ns: u64,
        spec: &InvocationSpec,
        reason: &str,
        reorder: &mut ReorderBuffer,
    ) {
        let now_ns = ns_since(self.run_start, Instant::now());
        let record = InvocationRecord {
            function: self.function.name.clone(),
            minute: slot,
            planned_start_ns: planned_ns,
            actual_start_ns: now_ns,
            end_ns: now_ns,
            requested_duration_ms: spec.runtime_ms,
            memory_mib: spec.memory_mib,
            observed_duration_us: 0,
            response_time_us: 0,
            status: InvocationStatus::Skipped,
            error_kind: reason.to_string(),
            late_dispatch: false,
        };
        for record in reorder.push(seq, record) {
            let _ = self.records.send(record).await;
        }
    }

    /// Launch the RPC task for one spec. Does not block the arrival loop.
    #[allow(clippy::too_many_arguments)]
    fn fire(
        &self,
        seq: u64,
        slot: u32,
        planned_ns: u64,
        spec: InvocationSpec,
        late: bool,
        in_grace: bool,
        done: mpsc::Sender<Completion>,
        in_flight: Arc<AtomicUsize>,
    ) {
        let invoker = Arc::clone(&self.invoker);
        let endpoint = self.function.endpoint.clone();
        let function = self.function.name.clone();
        let deadline = self.rpc_deadline(&spec);
        let run_start = self.run_start;

        tokio::spawn(async move {
            let started = Instant::now();
            let actual_start_ns = ns_since(run_start, started);
            let result = invoker.invoke(&endpoint, &spec, deadline).await;
            let ended = Instant::now();

            let (status, error_kind, observed_duration_us) = match &result {
                Ok(output) => (InvocationStatus::Ok, String::new(), output.duration_us),
                Err(InvokeError::Timeout(_)) => {
                    (InvocationStatus::Timeout, "timeout".to_string(), 0)
                }
                Err(e) => (InvocationStatus::Failed, e.kind().to_string(), 0),
            };

            let record = InvocationRecord {
                function,
                minute: slot,
                planned_start_ns: planned_ns,
                actual_start_ns,
                end_ns: ns_since(run_start, ended),
                requested_duration_ms: spec.runtime_ms,
                memory_mib: spec.memory_mib,
                observed_duration_us,
                response_time_us: ended.saturating_duration_since(started).as_micros() as u64,
                status,
                error_kind,
                late_dispatch: late,
            };

            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = done
                .send(Completion {
                    seq,
                    record,
                    in_grace,
                })
                .await;
        });
    }
}
