//! Message types for the worker protocol.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{BotId, TaskId, WorkerId};

/// Authentication handshake messages.
///
/// The first frame on a worker connection must be [`AuthMessage::Hello`].
/// The orchestrator answers with `Granted` or `Denied` and, on denial,
/// closes the connection.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    /// Worker credential presentation.
    Hello {
        /// Worker identity.
        worker_id: WorkerId,
        /// Opaque worker token issued by the orchestrator.
        token: String,
    },

    /// Authentication accepted.
    Granted {
        /// Interval at which the worker should send heartbeats.
        heartbeat_interval_ms: u64,
    },

    /// Authentication rejected.
    Denied {
        /// Human-readable rejection reason.
        reason: String,
    },
}

/// Control messages exchanged after authentication.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Worker liveness signal.
    Heartbeat {
        /// Tasks the worker is currently executing.
        active_tasks: u32,
    },

    /// Worker reports it has been rate-limited or blocked at the network
    /// level, independent of any single task.
    BlockedNotice {
        /// How long the worker should be excluded from dispatch.
        duration_ms: u64,
    },
}

/// Task lifecycle messages.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TaskMessage {
    /// Orchestrator → worker: execute a scrape task.
    Dispatch(DispatchRequest),

    /// Worker → orchestrator: task finished successfully.
    Completed(TaskResult),

    /// Worker → orchestrator: task failed.
    Failed(TaskFailure),
}

/// A scrape task dispatched to a worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Task identity.
    pub task_id: TaskId,

    /// Listing page to scrape.
    pub target_url: String,

    /// Bot this task belongs to.
    pub bot_id: BotId,

    /// Affiliate/context parameters, opaque to the orchestrator.
    pub params: Vec<(String, String)>,

    /// Proxy the worker should route through for this attempt.
    ///
    /// Set when the previous attempt's egress identity is considered
    /// compromised. `None` leaves the choice to the worker.
    pub proxy_hint: Option<String>,
}

impl DispatchRequest {
    /// Creates a dispatch request without params or proxy hint.
    #[must_use]
    pub fn new(task_id: TaskId, target_url: impl Into<String>, bot_id: impl Into<BotId>) -> Self {
        Self {
            task_id,
            target_url: target_url.into(),
            bot_id: bot_id.into(),
            params: Vec::new(),
            proxy_hint: None,
        }
    }

    /// Adds a context parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Sets the proxy hint.
    #[must_use]
    pub fn with_proxy_hint(mut self, hint: impl Into<String>) -> Self {
        self.proxy_hint = Some(hint.into());
        self
    }
}

/// Successful scrape output.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// Task identity.
    pub task_id: TaskId,

    /// Serialised scrape output.
    ///
    /// The orchestrator treats this as opaque bytes and hands it to the
    /// result sink for persistence.
    pub payload: Vec<u8>,
}

/// Failed scrape report.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Task identity.
    pub task_id: TaskId,

    /// Raw failure signal for classification.
    pub signal: FailureSignal,
}

/// Raw failure signal reported by a worker.
///
/// Opaque to the protocol layer; the orchestrator's classifier maps it to
/// an error kind.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureSignal {
    /// Free-form failure description from the automation driver.
    pub message: String,

    /// HTTP status observed on the target page, if any.
    pub http_status: Option<u16>,
}

impl FailureSignal {
    /// Creates a signal from a message alone.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
        }
    }

    /// Creates a signal carrying an HTTP status.
    #[must_use]
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            http_status: Some(status),
        }
    }
}
