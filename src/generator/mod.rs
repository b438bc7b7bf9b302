pub mod iat;
pub mod spec;

pub use spec::{InvocationSpec, SpecGenerator};

/// Nanoseconds in one trace minute; every IAT sequence sums to exactly this.
pub const MINUTE_NS: u64 = 60_000_000_000;
