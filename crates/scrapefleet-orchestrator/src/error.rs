//! Error types for the orchestrator.

use scrapefleet_proto::{TaskId, WorkerId};
use thiserror::Error;

/// Orchestrator errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Authentication failed (bad or stale token).
    ///
    /// Never affects task state; the connection is rejected and the worker
    /// must re-authenticate.
    #[error("authentication failed for worker {worker_id}: {reason}")]
    Auth { worker_id: WorkerId, reason: String },

    /// Wire protocol violation. The connection is dropped and any held
    /// task is released.
    #[error("protocol error: {0}")]
    Protocol(#[from] scrapefleet_proto::ProtocolError),

    /// Worker not found in the registry.
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// Task not found in the store.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A state transition that the task or worker state machine forbids.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The worker's connection is gone.
    #[error("connection closed for worker {0}")]
    ConnectionClosed(WorkerId),

    /// Result sink failure.
    #[error("result sink error: {0}")]
    Sink(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
