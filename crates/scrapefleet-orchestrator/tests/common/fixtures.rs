//! Test fixtures for orchestrator integration tests.

use scrapefleet_orchestrator::tasks::TaskPayload;
use scrapefleet_orchestrator::Dispatcher;
use scrapefleet_proto::{Envelope, TaskMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builder for creating test task payloads.
pub struct TaskBuilder {
    target_url: String,
    bot_id: String,
    params: Vec<(String, String)>,
}

impl TaskBuilder {
    /// Creates a new task builder for the given bot.
    pub fn new(bot_id: &str) -> Self {
        Self {
            target_url: "https://shop.example/category/widgets".to_string(),
            bot_id: bot_id.to_string(),
            params: vec![],
        }
    }

    /// Sets the target URL.
    pub fn with_url(mut self, url: &str) -> Self {
        self.target_url = url.to_string();
        self
    }

    /// Adds a context parameter.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Builds the payload.
    pub fn build(self) -> TaskPayload {
        TaskPayload {
            target_url: self.target_url,
            bot_id: self.bot_id,
            params: self.params,
        }
    }
}

/// A connected test worker: authenticated identity plus its outbound
/// dispatch queue.
pub struct ConnectedWorker {
    pub id: String,
    pub token: String,
    pub outbound: mpsc::Receiver<Envelope<TaskMessage>>,
}

impl ConnectedWorker {
    /// Issues a token, authenticates, and registers a connection for the
    /// given worker identity.
    pub fn connect(
        registry: &scrapefleet_orchestrator::WorkerRegistry,
        dispatcher: &Arc<Dispatcher>,
        id: &str,
    ) -> Self {
        let token = registry.issue_token(id);
        registry
            .authenticate(id, &token)
            .expect("fresh token must authenticate");
        let outbound = dispatcher.register_connection(id);
        Self {
            id: id.to_string(),
            token,
            outbound,
        }
    }

    /// Pops the next dispatched task, panicking if none is queued.
    pub fn next_dispatch(&mut self) -> scrapefleet_proto::DispatchRequest {
        match self.outbound.try_recv() {
            Ok(envelope) => match envelope.payload {
                TaskMessage::Dispatch(request) => request,
                other => panic!("expected dispatch, got {other:?}"),
            },
            Err(e) => panic!("no dispatch queued: {e}"),
        }
    }

    /// Returns true if no dispatch is queued.
    pub fn queue_empty(&mut self) -> bool {
        self.outbound.try_recv().is_err()
    }
}
