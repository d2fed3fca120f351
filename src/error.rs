//! Error kinds that abort a batch evaluation.
//!
//! Every variant is fatal to the whole batch: the supervisor tears down all workers and the
//! caller is expected to retry the batch. Intentional early termination in debug-isolation
//! mode is not an error, see [`BatchOutcome`](crate::server::BatchOutcome).

use std::time::Duration;

use thiserror::Error;

/// Reason a batch evaluation failed.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The worker closed its connection before the handshake or the fitness report.
    #[error("connection closed by worker {worker} while {during}")]
    ConnectionClosed {
        /// Index of the worker whose connection closed.
        worker: usize,
        /// Protocol phase in which the connection closed.
        during: &'static str,
    },

    /// A blocking accept or receive exceeded its configured bound.
    #[error("timed out after {after:?} while {during}")]
    Timeout {
        /// The bound that was exceeded.
        after: Duration,
        /// What the coordinator was waiting for.
        during: &'static str,
    },

    /// Malformed frame or unparsable payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A worker process could not be launched.
    #[error("could not spawn worker {worker}: {source:#}")]
    Spawn {
        /// Index of the worker that failed to launch.
        worker: usize,
        /// Launcher error.
        source: anyhow::Error,
    },

    /// The decision factory or the decision function failed.
    #[error("decision function failed for agent {agent}: {source:#}")]
    Decision {
        /// Identifier of the agent being evaluated.
        agent: i64,
        /// Collaborator error.
        source: anyhow::Error,
    },

    /// A sibling session failed and the batch was cancelled.
    #[error("evaluation cancelled")]
    Cancelled,

    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvalError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        EvalError::Protocol(msg.into())
    }

    /// True for the error raised in sessions that only observed another session's failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EvalError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_phase_and_worker() {
        let err = EvalError::ConnectionClosed {
            worker: 3,
            during: "evaluating",
        };
        assert_eq!(
            err.to_string(),
            "connection closed by worker 3 while evaluating"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: EvalError = io.into();
        assert!(matches!(err, EvalError::Io(_)));
        assert!(!err.is_cancellation());
        assert!(EvalError::Cancelled.is_cancellation());
    }
}
