//! Common test utilities for orchestrator integration tests.

pub mod fixtures;

use scrapefleet_orchestrator::{
    api::AppState,
    config::DispatchConfig,
    Dispatcher, MemorySink, ProxyPicker, RetryConfig, RetryPolicy, TaskStore, WorkerRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Complete test orchestrator setup with all components wired together.
pub struct TestOrchestrator {
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<TaskStore>,
    pub sink: Arc<MemorySink>,
    pub dispatcher: Arc<Dispatcher>,
    pub app_state: Arc<AppState>,
}

impl TestOrchestrator {
    /// Creates a new test orchestrator with default configuration.
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default(), DispatchConfig::default())
    }

    /// Creates a new test orchestrator with custom retry and dispatch
    /// configuration.
    pub fn with_config(retry: RetryConfig, dispatch: DispatchConfig) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let store = Arc::new(TaskStore::new());
        let sink = Arc::new(MemorySink::new());

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            sink.clone(),
            RetryPolicy::new(retry),
            dispatch,
            ProxyPicker::new(vec!["proxy-a".to_owned(), "proxy-b".to_owned()]),
        ));

        let app_state = Arc::new(AppState {
            registry: registry.clone(),
            store: store.clone(),
        });

        Self {
            registry,
            store,
            sink,
            dispatcher,
            app_state,
        }
    }

    /// Creates a test orchestrator with zeroed retry delays so retried
    /// tasks are immediately dispatchable again.
    pub fn with_instant_retries() -> Self {
        let retry = RetryConfig {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            transient_delay: Duration::ZERO,
            ..RetryConfig::default()
        };
        let dispatch = DispatchConfig {
            tick_interval: Duration::from_millis(10),
            result_timeout: Duration::from_millis(100),
        };
        Self::with_config(retry, dispatch)
    }
}

impl Default for TestOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
