pub mod algorithm;
pub mod planner;
pub mod server;

pub use algorithm::{plan, JobDescriptor, ReplicaPlan};
