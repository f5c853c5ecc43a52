//! Task store and lifecycle state machine.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scrapefleet_proto::{BotId, TaskId, WorkerId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::classify::ErrorKind;
use crate::error::{OrchestratorError, Result};
use crate::retry::RetryDecision;

/// A scrape task's payload, opaque context included.
#[derive(Debug, Clone)]
pub struct TaskPayload {
    /// Listing page to scrape.
    pub target_url: String,
    /// Bot this task belongs to.
    pub bot_id: BotId,
    /// Affiliate/context parameters.
    pub params: Vec<(String, String)>,
}

impl TaskPayload {
    /// Creates a payload without params.
    #[must_use]
    pub fn new(target_url: impl Into<String>, bot_id: impl Into<BotId>) -> Self {
        Self {
            target_url: target_url.into(),
            bot_id: bot_id.into(),
            params: Vec::new(),
        }
    }
}

/// Task lifecycle state.
///
/// Fields live only in the variant they are valid for: the assigned
/// worker exists only in progress, the result reference only on
/// completion. Terminal variants are never transitioned out of.
#[derive(Debug, Clone)]
pub enum TaskState {
    /// Awaiting dispatch.
    Pending {
        /// Earliest instant the task may be claimed, from a retry delay.
        not_before: Option<Instant>,
    },
    /// Dispatched to a worker.
    InProgress {
        /// The worker executing this task.
        worker_id: WorkerId,
        /// When the dispatch happened.
        dispatched_at: Instant,
    },
    /// Terminal: finished successfully.
    Completed {
        /// Reference to the externally persisted output.
        result_id: String,
        /// Completion time.
        completed_at: DateTime<Utc>,
    },
    /// Terminal: gave up after retries.
    PermanentlyFailed {
        /// Classified kind of the final error.
        kind: ErrorKind,
        /// Final error message.
        message: String,
    },
}

impl TaskState {
    /// Returns the stable status name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::InProgress { .. } => "in_progress",
            Self::Completed { .. } => "completed",
            Self::PermanentlyFailed { .. } => "permanently_failed",
        }
    }

    /// Returns true for completed and permanently failed tasks.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::PermanentlyFailed { .. })
    }
}

/// Outcome of applying a success report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Task transitioned to completed; the result must go to the sink.
    Completed {
        /// Bot the result belongs to.
        bot_id: BotId,
    },
    /// Task was already terminal; duplicate report, nothing to emit.
    AlreadyTerminal,
    /// Report did not match the task's current assignment; dropped.
    Stale,
}

/// Outcome of applying a failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Task re-enqueued with a delay.
    Requeued {
        /// Dispatch embargo applied.
        delay: Duration,
    },
    /// Task reached permanent failure; must be surfaced via the sink.
    Failed {
        /// Bot the task belongs to.
        bot_id: BotId,
    },
    /// Report did not apply (terminal or stale); dropped.
    Ignored,
}

/// A claimed task, ready for dispatch to its worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    /// Task identity.
    pub task_id: TaskId,
    /// Payload to send.
    pub payload: TaskPayload,
    /// Whether the retry policy demanded a fresh egress identity.
    pub rotate_proxy: bool,
    /// Proxy used on the previous attempt, to avoid immediate repetition.
    pub last_proxy: Option<String>,
}

/// In-memory task store.
///
/// Transitions for one task are serialised by per-entry map locking, so a
/// result report and a timeout racing on the same task cannot both apply.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl TaskStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Enqueues a new pending task.
    pub fn enqueue(&self, payload: TaskPayload) -> TaskId {
        let id = TaskId::new();
        debug!(task_id = %id, bot_id = %payload.bot_id, url = %payload.target_url, "Task enqueued");
        self.tasks.insert(id, TaskRecord::new(id, payload));
        id
    }

    /// Lists pending tasks whose retry delay has elapsed, oldest first.
    pub fn ready_pending(&self) -> Vec<TaskId> {
        let now = Instant::now();
        let mut ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| match entry.state {
                TaskState::Pending { not_before } => not_before.is_none_or(|t| t <= now),
                _ => false,
            })
            .map(|entry| *entry.key())
            .collect();

        // Task IDs are ULIDs: sorting gives enqueue order
        ready.sort_unstable();
        ready
    }

    /// Atomically claims a pending task for a worker.
    ///
    /// Fails if the task is not pending or its retry delay has not
    /// elapsed. Increments the attempt count.
    pub fn claim(&self, task_id: TaskId, worker_id: &str) -> Result<ClaimedTask> {
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;

        match record.state {
            TaskState::Pending { not_before } => {
                if not_before.is_some_and(|t| t > Instant::now()) {
                    return Err(OrchestratorError::InvalidTransition {
                        from: "pending (delayed)".to_owned(),
                        to: "in_progress".to_owned(),
                    });
                }
            }
            ref state => {
                return Err(OrchestratorError::InvalidTransition {
                    from: state.name().to_owned(),
                    to: "in_progress".to_owned(),
                });
            }
        }

        record.state = TaskState::InProgress {
            worker_id: worker_id.to_owned(),
            dispatched_at: Instant::now(),
        };
        record.attempts += 1;

        Ok(ClaimedTask {
            task_id,
            payload: record.payload.clone(),
            rotate_proxy: record.rotate_proxy,
            last_proxy: record.last_proxy.clone(),
        })
    }

    /// Records the proxy chosen for the current dispatch.
    pub fn record_proxy(&self, task_id: TaskId, proxy: Option<String>) {
        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            if proxy.is_some() {
                record.last_proxy = proxy;
            }
            record.rotate_proxy = false;
        }
    }

    /// Releases an in-progress task back to pending.
    ///
    /// The attempt count is left unchanged: the in-flight attempt was
    /// abandoned, not failed, since no error signal arrived. No-op for
    /// tasks in any other state.
    pub fn release(&self, task_id: TaskId) {
        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            if matches!(record.state, TaskState::InProgress { .. }) {
                record.state = TaskState::Pending { not_before: None };
                debug!(task_id = %task_id, "Task released back to pending");
            }
        }
    }

    /// Applies a success report from a worker.
    ///
    /// Duplicate reports for an already-terminal task are accepted as
    /// no-ops; reports from a worker the task is no longer assigned to
    /// are dropped as stale.
    pub fn complete(&self, task_id: TaskId, worker_id: &str, result_id: String) -> Result<CompletionOutcome> {
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;

        match record.state {
            TaskState::InProgress { worker_id: ref assigned, .. } => {
                if assigned != worker_id {
                    warn!(task_id = %task_id, worker_id, assigned, "Stale success report dropped");
                    return Ok(CompletionOutcome::Stale);
                }
                let bot_id = record.payload.bot_id.clone();
                record.state = TaskState::Completed {
                    result_id,
                    completed_at: Utc::now(),
                };
                Ok(CompletionOutcome::Completed { bot_id })
            }
            TaskState::Completed { .. } | TaskState::PermanentlyFailed { .. } => {
                debug!(task_id = %task_id, "Duplicate report for terminal task ignored");
                Ok(CompletionOutcome::AlreadyTerminal)
            }
            TaskState::Pending { .. } => {
                warn!(task_id = %task_id, worker_id, "Success report for unassigned task dropped");
                Ok(CompletionOutcome::Stale)
            }
        }
    }

    /// Applies a failure report and the retry decision derived from it.
    pub fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        kind: ErrorKind,
        message: String,
        decision: RetryDecision,
    ) -> Result<FailureOutcome> {
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;

        match record.state {
            TaskState::InProgress { worker_id: ref assigned, .. } => {
                if assigned != worker_id {
                    warn!(task_id = %task_id, worker_id, assigned, "Stale failure report dropped");
                    return Ok(FailureOutcome::Ignored);
                }
            }
            TaskState::Completed { .. } | TaskState::PermanentlyFailed { .. } => {
                debug!(task_id = %task_id, "Failure report for terminal task ignored");
                return Ok(FailureOutcome::Ignored);
            }
            TaskState::Pending { .. } => {
                warn!(task_id = %task_id, worker_id, "Failure report for unassigned task dropped");
                return Ok(FailureOutcome::Ignored);
            }
        }

        record.last_error = Some((kind, message.clone()));

        match decision {
            RetryDecision::Retry { delay, rotate_egress } => {
                record.state = TaskState::Pending {
                    not_before: Some(Instant::now() + delay),
                };
                record.rotate_proxy |= rotate_egress;
                debug!(
                    task_id = %task_id,
                    kind = %kind,
                    delay_secs = delay.as_secs(),
                    rotate_egress,
                    "Task re-enqueued after failure"
                );
                Ok(FailureOutcome::Requeued { delay })
            }
            RetryDecision::GiveUp => {
                let bot_id = record.payload.bot_id.clone();
                record.state = TaskState::PermanentlyFailed { kind, message };
                warn!(task_id = %task_id, kind = %kind, attempts = record.attempts, "Task permanently failed");
                Ok(FailureOutcome::Failed { bot_id })
            }
        }
    }

    /// Gets a snapshot of a task.
    pub fn get(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(&task_id).map(|r| r.snapshot())
    }

    /// Lists snapshots of all tasks.
    pub fn list_all(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self.tasks.iter().map(|r| r.snapshot()).collect();
        all.sort_unstable_by_key(|s| s.id);
        all
    }

    /// Returns the number of tasks in the store.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A task's store record.
#[derive(Debug, Clone)]
struct TaskRecord {
    id: TaskId,
    payload: TaskPayload,
    state: TaskState,
    /// Dispatches consumed so far.
    attempts: u32,
    /// Kind and message of the most recent failure.
    last_error: Option<(ErrorKind, String)>,
    /// Proxy used on the previous attempt.
    last_proxy: Option<String>,
    /// Next dispatch must carry a proxy hint different from `last_proxy`.
    rotate_proxy: bool,
}

impl TaskRecord {
    fn new(id: TaskId, payload: TaskPayload) -> Self {
        Self {
            id,
            payload,
            state: TaskState::Pending { not_before: None },
            attempts: 0,
            last_error: None,
            last_proxy: None,
            rotate_proxy: false,
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        let (assigned_worker, result_id, completed_at) = match &self.state {
            TaskState::InProgress { worker_id, .. } => (Some(worker_id.clone()), None, None),
            TaskState::Completed { result_id, completed_at } => {
                (None, Some(result_id.clone()), Some(*completed_at))
            }
            _ => (None, None, None),
        };

        TaskSnapshot {
            id: self.id,
            bot_id: self.payload.bot_id.clone(),
            target_url: self.payload.target_url.clone(),
            status: self.state.name(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            assigned_worker,
            result_id,
            completed_at,
        }
    }
}

/// Read-only task view for the admin API.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    /// Task identity.
    pub id: TaskId,
    /// Bot the task belongs to.
    pub bot_id: BotId,
    /// Listing page being scraped.
    pub target_url: String,
    /// Status name.
    pub status: &'static str,
    /// Dispatches consumed so far.
    pub attempts: u32,
    /// Most recent failure, if any.
    pub last_error: Option<(ErrorKind, String)>,
    /// Worker the task is assigned to, if in progress.
    pub assigned_worker: Option<WorkerId>,
    /// External result reference, if completed.
    pub result_id: Option<String>,
    /// Completion time, if completed.
    pub completed_at: Option<DateTime<Utc>>,
}
