//! Task dispatcher: matches pending tasks to eligible workers.

use dashmap::DashMap;
use scrapefleet_proto::{
    DispatchRequest, Envelope, TaskFailure, TaskId, TaskMessage, TaskResult, WorkerId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ErrorKind};
use crate::config::DispatchConfig;
use crate::registry::WorkerRegistry;
use crate::retry::RetryPolicy;
use crate::sink::ResultSink;
use crate::tasks::{CompletionOutcome, FailureOutcome, TaskStore};

/// Outbound channel capacity per worker connection.
///
/// A worker that stops draining its queue is treated as gone rather than
/// allowed to stall the matching loop.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Sender half of a worker connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Envelope<TaskMessage>>;

/// Picks proxy labels for egress rotation hints.
///
/// The actual proxy credentials are an external collaborator's concern;
/// the dispatcher only hands out labels and avoids repeating the one the
/// previous attempt used.
#[derive(Debug, Default)]
pub struct ProxyPicker {
    labels: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyPicker {
    /// Creates a picker over the configured proxy labels.
    #[must_use]
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Picks a label different from the previously used one, if possible.
    pub fn pick(&self, avoid: Option<&str>) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        for _ in 0..self.labels.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.labels.len();
            let label = &self.labels[index];
            if Some(label.as_str()) != avoid {
                return Some(label.clone());
            }
        }
        // Single label configured and it was the one to avoid
        self.labels.first().cloned()
    }
}

/// The dispatcher.
///
/// Owns the connection map and the per-dispatch result timers. All task
/// and worker transitions go through the store/registry, whose per-entity
/// locking guarantees that a worker report and a timeout racing on the
/// same task cannot both apply.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn ResultSink>,
    policy: RetryPolicy,
    config: DispatchConfig,
    proxies: ProxyPicker,
    connections: DashMap<WorkerId, OutboundSender>,
    result_timers: DashMap<TaskId, AbortHandle>,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<WorkerRegistry>,
        sink: Arc<dyn ResultSink>,
        policy: RetryPolicy,
        config: DispatchConfig,
        proxies: ProxyPicker,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            policy,
            config,
            proxies,
            connections: DashMap::new(),
            result_timers: DashMap::new(),
        }
    }

    /// Creates an outbound queue for a freshly authenticated connection.
    ///
    /// The transport's writer task drains the returned receiver.
    pub fn register_connection(&self, worker_id: &str) -> mpsc::Receiver<Envelope<TaskMessage>> {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        self.connections.insert(worker_id.to_owned(), sender);
        receiver
    }

    /// Runs the matching loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            result_timeout_secs = self.config.result_timeout.as_secs(),
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                () = cancel.cancelled() => {
                    info!("Dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// One pass of the matching loop.
    ///
    /// Pairs ready pending tasks with eligible workers, longest idle
    /// first. Tasks beyond worker capacity stay pending (backpressure).
    pub async fn tick(self: &Arc<Self>) {
        let ready = self.store.ready_pending();
        if ready.is_empty() {
            return;
        }

        let eligible = self.registry.eligible_workers();
        if eligible.is_empty() {
            warn!(pending = ready.len(), "No eligible worker, tasks remain pending");
            return;
        }

        for (task_id, worker_id) in ready.into_iter().zip(eligible) {
            self.dispatch_one(task_id, &worker_id).await;
        }
    }

    /// Claims a task, binds it to a worker, and sends the dispatch frame.
    async fn dispatch_one(self: &Arc<Self>, task_id: TaskId, worker_id: &str) {
        let claimed = match self.store.claim(task_id, worker_id) {
            Ok(claimed) => claimed,
            // Lost a race, e.g. the task was claimed since the scan
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Claim skipped");
                return;
            }
        };

        if let Err(e) = self.registry.mark_busy(worker_id, task_id) {
            debug!(worker_id, error = %e, "Worker no longer eligible, releasing task");
            self.store.release(task_id);
            return;
        }

        let proxy_hint = if claimed.rotate_proxy {
            self.proxies.pick(claimed.last_proxy.as_deref())
        } else {
            None
        };

        let mut request = DispatchRequest::new(
            task_id,
            claimed.payload.target_url.clone(),
            claimed.payload.bot_id.clone(),
        );
        request.params = claimed.payload.params.clone();
        request.proxy_hint = proxy_hint.clone();

        let sent = match self.connections.get(worker_id) {
            Some(sender) => sender
                .try_send(Envelope::new(TaskMessage::Dispatch(request)))
                .is_ok(),
            None => false,
        };

        if !sent {
            // Connection is gone or fell behind: treat the worker as lost
            warn!(worker_id, task_id = %task_id, "Dispatch send failed, disconnecting worker");
            self.store.release(task_id);
            self.registry.disconnect(worker_id);
            self.connections.remove(worker_id);
            return;
        }

        self.store.record_proxy(task_id, proxy_hint.clone());
        self.start_result_timer(task_id, worker_id.to_owned());
        info!(
            task_id = %task_id,
            worker_id,
            proxy_hint = proxy_hint.as_deref(),
            "Task dispatched"
        );
    }

    /// Starts the result timeout timer for a dispatched task.
    fn start_result_timer(self: &Arc<Self>, task_id: TaskId, worker_id: WorkerId) {
        let dispatcher = Arc::clone(self);
        let timeout = self.config.result_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher.handle_result_timeout(task_id, &worker_id).await;
        });

        if let Some(previous) = self.result_timers.insert(task_id, handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancels the result timer for a task, if one is armed.
    fn cancel_result_timer(&self, task_id: TaskId) {
        if let Some((_, handle)) = self.result_timers.remove(&task_id) {
            handle.abort();
        }
    }

    /// Applies a success report from a worker.
    ///
    /// Reports from a worker the task is no longer assigned to are
    /// dropped before they can touch the sink or the current dispatch's
    /// result timer.
    pub async fn handle_success(&self, worker_id: &str, result: TaskResult) {
        let task_id = result.task_id;

        let snapshot = match self.store.get(task_id) {
            Some(snapshot) => snapshot,
            None => {
                warn!(task_id = %task_id, worker_id, "Success report for unknown task");
                return;
            }
        };

        // Duplicate report for a terminal task: accept without touching
        // the sink again
        if snapshot.status == "completed" || snapshot.status == "permanently_failed" {
            debug!(task_id = %task_id, worker_id, "Duplicate success report ignored");
            let _ = self.registry.mark_available(worker_id);
            return;
        }

        if snapshot.assigned_worker.as_deref() != Some(worker_id) {
            warn!(task_id = %task_id, worker_id, "Stale success report dropped");
            return;
        }

        let result_id = match self
            .sink
            .store_result(task_id, &snapshot.bot_id, result.payload)
            .await
        {
            Ok(result_id) => result_id,
            Err(e) => {
                // The sink is the idempotency point for at-least-once
                // result application; a duplicate store surfaces here.
                // The timer stays armed so the attempt still times out.
                error!(task_id = %task_id, error = %e, "Result sink rejected payload");
                let _ = self.registry.mark_available(worker_id);
                return;
            }
        };

        match self.store.complete(task_id, worker_id, result_id) {
            Ok(CompletionOutcome::Completed { .. }) => {
                self.cancel_result_timer(task_id);
                info!(task_id = %task_id, worker_id, "Task completed");
            }
            // Lost a race since the snapshot: the timer now belongs to a
            // newer dispatch, leave it alone
            Ok(CompletionOutcome::AlreadyTerminal | CompletionOutcome::Stale) => {
                warn!(task_id = %task_id, worker_id, "Result persisted for a report that no longer applies");
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Completion failed"),
        }

        let _ = self.registry.mark_available(worker_id);
    }

    /// Applies a failure report from a worker.
    pub async fn handle_failure(&self, worker_id: &str, failure: TaskFailure) {
        let task_id = failure.task_id;

        match self.store.get(task_id) {
            Some(snapshot) => {
                // Terminal tasks have no assignment, so this also drops
                // duplicate reports without disturbing anything
                if snapshot.assigned_worker.as_deref() != Some(worker_id) {
                    warn!(task_id = %task_id, worker_id, "Stale failure report dropped");
                    return;
                }
            }
            None => {
                warn!(task_id = %task_id, worker_id, "Failure report for unknown task");
                return;
            }
        }

        let kind = classify(&failure.signal);
        self.apply_failure(task_id, worker_id, kind, failure.signal.message)
            .await;
        let _ = self.registry.mark_available(worker_id);
    }

    /// Handles a result timeout firing for a dispatched task.
    ///
    /// Treated exactly as if the worker had reported a timeout error. If
    /// a real report won the race, the store transition no-ops.
    async fn handle_result_timeout(&self, task_id: TaskId, worker_id: &str) {
        self.result_timers.remove(&task_id);
        warn!(task_id = %task_id, worker_id, "Result timeout fired");

        self.apply_failure(
            task_id,
            worker_id,
            ErrorKind::Timeout,
            "no result before timeout".to_owned(),
        )
        .await;
        let _ = self.registry.mark_available(worker_id);
    }

    /// Runs the classify-and-retry pipeline for a failed attempt.
    ///
    /// The result timer is disarmed only when the transition applied; an
    /// ignored report leaves whatever dispatch currently owns the timer
    /// undisturbed.
    async fn apply_failure(&self, task_id: TaskId, worker_id: &str, kind: ErrorKind, message: String) {
        let attempts = match self.store.get(task_id) {
            Some(snapshot) => snapshot.attempts,
            None => {
                warn!(task_id = %task_id, "Failure report for unknown task");
                return;
            }
        };

        let decision = self.policy.decide(kind, attempts);
        match self.store.fail(task_id, worker_id, kind, message.clone(), decision) {
            Ok(FailureOutcome::Requeued { delay }) => {
                self.cancel_result_timer(task_id);
                info!(
                    task_id = %task_id,
                    kind = %kind,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "Task will be retried"
                );
            }
            Ok(FailureOutcome::Failed { bot_id }) => {
                self.cancel_result_timer(task_id);
                if let Err(e) = self.sink.task_failed(task_id, &bot_id, kind, &message).await {
                    error!(task_id = %task_id, error = %e, "Failed to surface permanent failure");
                }
            }
            Ok(FailureOutcome::Ignored) => {
                debug!(task_id = %task_id, worker_id, "Failure report did not apply");
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Failure handling error"),
        }
    }

    /// Handles a worker connection closing, cleanly or not.
    ///
    /// Runs immediately on observed disconnects rather than waiting for
    /// the stale sweep: the held task is released with its attempt count
    /// unchanged and its timer disarmed.
    pub fn handle_disconnect(&self, worker_id: &str) {
        self.connections.remove(worker_id);
        if let Some(task_id) = self.registry.disconnect(worker_id) {
            self.cancel_result_timer(task_id);
            self.store.release(task_id);
        }
    }

    /// Releases a task held over from a worker's previous session.
    ///
    /// Used when a worker reconnects after a crash the orchestrator never
    /// observed as a disconnect. The attempt count stays unchanged.
    pub fn reclaim(&self, task_id: TaskId) {
        self.cancel_result_timer(task_id);
        self.store.release(task_id);
    }

    /// Runs the stale-worker sweep until cancelled.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = heartbeat_timeout.as_secs(),
            "Heartbeat sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(heartbeat_timeout),
                () = cancel.cancelled() => {
                    info!("Heartbeat sweeper stopping");
                    return;
                }
            }
        }
    }

    /// One pass of the stale-worker sweep.
    pub fn sweep(&self, heartbeat_timeout: Duration) {
        for (worker_id, held) in self.registry.sweep_stale(heartbeat_timeout) {
            self.connections.remove(&worker_id);
            if let Some(task_id) = held {
                self.cancel_result_timer(task_id);
                self.store.release(task_id);
            }
        }
    }

    /// Returns the number of live worker connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.connections.len())
            .field("result_timers", &self.result_timers.len())
            .finish_non_exhaustive()
    }
}
