//! Open-loop serverless workload driver and elastic replica scheduler.
//!
//! The driver replays per-function invocation traces against a live cluster:
//! it samples inter-arrival times per minute, fires invocations at absolute
//! deadlines, records per-call outcomes, and scrapes cluster telemetry
//! aligned to the run clock. In scheduler mode a per-minute round streams the
//! pending GPU jobs to the replica planner (`schedd`) and applies the
//! returned counts before arrivals fire.

pub mod config;
pub mod driver;
pub mod error;
pub mod generator;
pub mod metric;
pub mod orchestrator;
pub mod pb;
pub mod sched;
pub mod telemetry;
pub mod trace;
