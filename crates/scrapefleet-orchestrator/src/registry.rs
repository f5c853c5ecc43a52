//! Worker registry: connection state, liveness, and token authentication.

use dashmap::DashMap;
use scrapefleet_proto::{TaskId, WorkerId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// Worker registry.
///
/// Thread-safe registry of every worker identity ever issued a token.
/// Records persist across disconnects; a worker is only ever marked
/// disconnected, never removed. All mutations go through per-entry map
/// locking, so transitions for one worker are serialised.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, WorkerRecord>,
}

impl WorkerRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    /// Issues a token for a worker, creating the identity if needed.
    ///
    /// Replaces any previous token atomically; connections still holding
    /// the old value are rejected on their next authenticated action.
    pub fn issue_token(&self, worker_id: &str) -> String {
        let token = generate_token();
        let mut record = self
            .workers
            .entry(worker_id.to_owned())
            .or_insert_with(|| WorkerRecord::new(worker_id.to_owned()));
        record.token = token.clone();
        info!(worker_id, "Worker token issued");
        token
    }

    /// Regenerates the token for an existing worker.
    pub fn regenerate_token(&self, worker_id: &str) -> Result<String> {
        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_owned()))?;
        let token = generate_token();
        record.token = token.clone();
        info!(worker_id, "Worker token regenerated");
        Ok(token)
    }

    /// Authenticates a worker connection.
    ///
    /// On success the worker becomes connected and its heartbeat is
    /// stamped. Returns the task the worker was still holding from a
    /// previous connection, if any; the caller must release it.
    pub fn authenticate(&self, worker_id: &str, token: &str) -> Result<Option<TaskId>> {
        let mut record = self.workers.get_mut(worker_id).ok_or_else(|| {
            OrchestratorError::Auth {
                worker_id: worker_id.to_owned(),
                reason: "unknown worker".to_owned(),
            }
        })?;

        if record.token != token {
            return Err(OrchestratorError::Auth {
                worker_id: worker_id.to_owned(),
                reason: "invalid token".to_owned(),
            });
        }

        let now = Instant::now();
        let held = record.state.held_task();
        record.state = WorkerState::Connected { idle_since: now };
        record.last_heartbeat = now;
        info!(worker_id, "Worker authenticated");
        Ok(held)
    }

    /// Verifies that a token is still the current one for a worker.
    ///
    /// Performed on every post-auth message, so a regenerated token cuts
    /// off the old connection on its next action.
    pub fn verify_token(&self, worker_id: &str, token: &str) -> Result<()> {
        let record = self
            .workers
            .get(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_owned()))?;

        if record.token != token {
            return Err(OrchestratorError::Auth {
                worker_id: worker_id.to_owned(),
                reason: "token revoked".to_owned(),
            });
        }
        Ok(())
    }

    /// Records a heartbeat from a worker.
    ///
    /// Unknown workers are logged and ignored rather than propagated.
    pub fn heartbeat(&self, worker_id: &str) {
        match self.workers.get_mut(worker_id) {
            Some(mut record) => {
                record.last_heartbeat = Instant::now();
                debug!(worker_id, "Heartbeat recorded");
            }
            None => warn!(worker_id, "Heartbeat from unknown worker ignored"),
        }
    }

    /// Marks a worker busy with a task.
    ///
    /// Only an eligible (connected) worker may take a task.
    pub fn mark_busy(&self, worker_id: &str, task_id: TaskId) -> Result<()> {
        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_owned()))?;

        match record.state {
            WorkerState::Connected { .. } => {
                record.state = WorkerState::Busy {
                    task_id,
                    blocked_until: None,
                };
                Ok(())
            }
            ref state => Err(OrchestratorError::InvalidTransition {
                from: state.name().to_owned(),
                to: "busy".to_owned(),
            }),
        }
    }

    /// Marks a busy worker available again.
    ///
    /// If a blocked notice arrived while the worker was busy, it lands in
    /// the blocked state instead of connected.
    pub fn mark_available(&self, worker_id: &str) -> Result<()> {
        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_owned()))?;

        match record.state {
            WorkerState::Busy { blocked_until, .. } => {
                let now = Instant::now();
                record.state = match blocked_until {
                    Some(until) if until > now => WorkerState::Blocked { until },
                    _ => WorkerState::Connected { idle_since: now },
                };
                Ok(())
            }
            ref state => Err(OrchestratorError::InvalidTransition {
                from: state.name().to_owned(),
                to: "connected".to_owned(),
            }),
        }
    }

    /// Excludes a worker from dispatch for a duration.
    ///
    /// Used when a worker reports network-level blocking independent of
    /// any single task. A busy worker finishes its current task first and
    /// then lands in the blocked state.
    pub fn mark_blocked(&self, worker_id: &str, duration: Duration) -> Result<()> {
        let mut record = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.to_owned()))?;

        let until = Instant::now() + duration;
        match record.state {
            WorkerState::Connected { .. } | WorkerState::Blocked { .. } => {
                record.state = WorkerState::Blocked { until };
            }
            WorkerState::Busy { task_id, .. } => {
                record.state = WorkerState::Busy {
                    task_id,
                    blocked_until: Some(until),
                };
            }
            WorkerState::Disconnected => {
                return Err(OrchestratorError::InvalidTransition {
                    from: "disconnected".to_owned(),
                    to: "blocked".to_owned(),
                });
            }
        }
        info!(worker_id, duration_secs = duration.as_secs(), "Worker blocked");
        Ok(())
    }

    /// Forces a worker to disconnected.
    ///
    /// Returns the task it was holding, if any; the caller must release
    /// it back to pending. Used for clean disconnects and protocol
    /// violations, where waiting for the stale sweep would leave the task
    /// stuck.
    pub fn disconnect(&self, worker_id: &str) -> Option<TaskId> {
        let mut record = self.workers.get_mut(worker_id)?;
        let held = record.state.held_task();
        record.state = WorkerState::Disconnected;
        info!(worker_id, held_task = ?held, "Worker disconnected");
        held
    }

    /// Sweeps workers whose heartbeat has gone stale.
    ///
    /// Each stale worker is forced to disconnected; its held task (if
    /// any) is returned so the caller can release it with the attempt
    /// count unchanged.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<(WorkerId, Option<TaskId>)> {
        let now = Instant::now();
        let mut swept = Vec::new();

        for mut entry in self.workers.iter_mut() {
            if matches!(entry.state, WorkerState::Disconnected) {
                continue;
            }
            if now.duration_since(entry.last_heartbeat) > timeout {
                let held = entry.state.held_task();
                entry.state = WorkerState::Disconnected;
                warn!(worker_id = %entry.id, "Worker heartbeat timeout, forcing disconnect");
                swept.push((entry.id.clone(), held));
            }
        }

        swept
    }

    /// Lists eligible workers, longest idle first.
    ///
    /// Eligible means connected: not busy, not blocked, not disconnected.
    /// A blocked worker whose exclusion has elapsed reverts to connected
    /// here.
    pub fn eligible_workers(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        let mut candidates: Vec<(WorkerId, Instant)> = Vec::new();

        for mut entry in self.workers.iter_mut() {
            match entry.state {
                WorkerState::Connected { idle_since } => {
                    candidates.push((entry.id.clone(), idle_since));
                }
                WorkerState::Blocked { until } if until <= now => {
                    entry.state = WorkerState::Connected { idle_since: now };
                    candidates.push((entry.id.clone(), now));
                }
                _ => {}
            }
        }

        candidates.sort_by_key(|(_, idle_since)| *idle_since);
        candidates.into_iter().map(|(id, _)| id).collect()
    }

    /// Gets a snapshot of a worker.
    pub fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.workers.get(worker_id).map(|r| r.snapshot())
    }

    /// Lists snapshots of all workers.
    pub fn list_all(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|r| r.snapshot()).collect()
    }

    /// Returns the number of known worker identities.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are known.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// A worker's registry record.
#[derive(Debug, Clone)]
struct WorkerRecord {
    /// Worker identity.
    id: WorkerId,
    /// Current credential. Never serialised or exposed in snapshots.
    token: String,
    /// Connection state.
    state: WorkerState,
    /// Last heartbeat or authenticated action.
    last_heartbeat: Instant,
    /// First time this identity was issued a token.
    first_seen: Instant,
}

impl WorkerRecord {
    fn new(id: WorkerId) -> Self {
        let now = Instant::now();
        Self {
            id,
            token: String::new(),
            state: WorkerState::Disconnected,
            last_heartbeat: now,
            first_seen: now,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            status: self.state.name(),
            current_task: self.state.held_task(),
            heartbeat_age: self.last_heartbeat.elapsed(),
            first_seen: self.first_seen,
        }
    }
}

/// Worker connection state.
///
/// The held task lives only inside the busy variant, so "busy without a
/// task" and "idle with a task" are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not connected; identity persists.
    Disconnected,
    /// Connected and eligible for dispatch.
    Connected {
        /// When the worker last became idle. Drives longest-idle-first
        /// tie-breaking.
        idle_since: Instant,
    },
    /// Executing a dispatched task.
    Busy {
        /// The task in flight.
        task_id: TaskId,
        /// Exclusion deadline recorded from a blocked notice that arrived
        /// mid-task; applied when the task finishes.
        blocked_until: Option<Instant>,
    },
    /// Excluded from dispatch until the deadline.
    Blocked {
        /// When the exclusion ends.
        until: Instant,
    },
}

impl WorkerState {
    /// Returns the stable status name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected { .. } => "connected",
            Self::Busy { .. } => "busy",
            Self::Blocked { .. } => "blocked",
        }
    }

    /// Returns the task held by this state, if any.
    #[must_use]
    pub const fn held_task(&self) -> Option<TaskId> {
        match self {
            Self::Busy { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Read-only worker view for the admin API.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// Worker identity.
    pub id: WorkerId,
    /// Status name.
    pub status: &'static str,
    /// Task in flight, if busy.
    pub current_task: Option<TaskId>,
    /// Time since the last heartbeat.
    pub heartbeat_age: Duration,
    /// When the identity was first registered.
    pub first_seen: Instant,
}

/// Generates an opaque 64-character hex token.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    let mut token = String::with_capacity(64);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(token, "{byte:02x}");
    }
    token
}
