use thiserror::Error;

/// Top-level error taxonomy. Every kind maps to a distinct process exit code
/// so experiment harnesses can tell a bad flag from a bad trace.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown option, incoherent flag combination, missing input path.
    /// Surfaced before any RPC is issued.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed CSV, missing join key, negative invocation count.
    /// Surfaced before the run starts.
    #[error("trace error: {0}")]
    Trace(String),

    /// Replica planner stream abort or bad payload. The affected round falls
    /// back to an all-zero plan; this variant only surfaces when the planner
    /// endpoint cannot be reached at all during bootstrap.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Invariant violation: spec count mismatch, channel closed prematurely.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error kind (0 is reserved for success).
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 2,
            Error::Trace(_) => 3,
            Error::Scheduler(_) | Error::Internal(_) | Error::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_2() {
        assert_eq!(Error::Config("bad flag".into()).exit_code(), 2);
    }

    #[test]
    fn trace_errors_exit_with_3() {
        assert_eq!(Error::Trace("negative count".into()).exit_code(), 3);
    }

    #[test]
    fn runtime_errors_exit_with_1() {
        assert_eq!(Error::Internal("channel closed".into()).exit_code(), 1);
        assert_eq!(Error::Scheduler("stream aborted".into()).exit_code(), 1);
    }
}
