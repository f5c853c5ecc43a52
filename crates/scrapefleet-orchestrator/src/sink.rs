//! Result sink boundary.
//!
//! Terminal task outcomes leave the orchestration core through this seam:
//! completed results go to an external persistence collaborator, permanent
//! failures to external alerting/storage. The core never deletes terminal
//! tasks itself.

use async_trait::async_trait;
use scrapefleet_proto::{BotId, TaskId};

use crate::classify::ErrorKind;
use crate::error::{OrchestratorError, Result};

/// Trait for terminal-outcome handling backends.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persists a completed task's output.
    ///
    /// Returns the external reference the task record stores as its
    /// result ID.
    async fn store_result(&self, task_id: TaskId, bot_id: &BotId, payload: Vec<u8>) -> Result<String>;

    /// Surfaces a permanently failed task.
    async fn task_failed(&self, task_id: TaskId, bot_id: &BotId, kind: ErrorKind, message: &str) -> Result<()>;
}

/// In-memory sink for testing and standalone operation.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: dashmap::DashMap<TaskId, StoredResult>,
    failures: dashmap::DashMap<TaskId, StoredFailure>,
}

/// A captured completed result.
#[derive(Debug, Clone)]
pub struct StoredResult {
    /// Bot the result belongs to.
    pub bot_id: BotId,
    /// The raw result payload.
    pub payload: Vec<u8>,
}

/// A captured permanent failure.
#[derive(Debug, Clone)]
pub struct StoredFailure {
    /// Bot the task belonged to.
    pub bot_id: BotId,
    /// Classified kind of the final error.
    pub kind: ErrorKind,
    /// Final error message.
    pub message: String,
}

impl MemorySink {
    /// Creates a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored result for a task, if any.
    pub fn result(&self, task_id: TaskId) -> Option<StoredResult> {
        self.results.get(&task_id).map(|r| r.clone())
    }

    /// Returns the stored failure for a task, if any.
    pub fn failure(&self, task_id: TaskId) -> Option<StoredFailure> {
        self.failures.get(&task_id).map(|r| r.clone())
    }

    /// Returns how many results have been stored.
    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Returns how many failures have been surfaced.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn store_result(&self, task_id: TaskId, bot_id: &BotId, payload: Vec<u8>) -> Result<String> {
        if self.results.contains_key(&task_id) {
            // Duplicate application would double-count downstream
            return Err(OrchestratorError::Sink(format!(
                "result already stored for task {task_id}"
            )));
        }
        self.results.insert(
            task_id,
            StoredResult {
                bot_id: bot_id.clone(),
                payload,
            },
        );
        Ok(format!("result-{task_id}"))
    }

    async fn task_failed(&self, task_id: TaskId, bot_id: &BotId, kind: ErrorKind, message: &str) -> Result<()> {
        self.failures.insert(
            task_id,
            StoredFailure {
                bot_id: bot_id.clone(),
                kind,
                message: message.to_owned(),
            },
        );
        Ok(())
    }
}
