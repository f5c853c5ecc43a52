//! Scrapefleet orchestrator - task scheduling for remote scrape workers.
//!
//! The orchestrator is responsible for:
//!
//! - **Worker registry**: Tracking worker identities, tokens, and
//!   connection state with heartbeat liveness
//! - **Task lifecycle**: A state machine from pending through in-progress
//!   to completion or permanent failure
//! - **Failure classification**: Mapping raw worker failure signals to
//!   error kinds that drive retry behaviour
//! - **Retry policy**: Exponential backoff with egress rotation for
//!   anti-bot errors, fixed delays for transient ones
//! - **Dispatch**: Matching ready tasks to idle workers over persistent
//!   TCP connections
//!
//! # Architecture
//!
//! Workers hold a single framed TCP connection to the orchestrator and
//! authenticate with a pre-issued token. The matching loop pairs pending
//! tasks with connected workers, longest idle first; results and failure
//! reports flow back over the same connection. An HTTP API serves task
//! submission and operational visibility.
//!
//! # Example
//!
//! ```ignore
//! use scrapefleet_orchestrator::{OrchestratorConfig, tasks::TaskStore};
//!
//! let config = OrchestratorConfig::default();
//! let store = TaskStore::new();
//! ```

pub mod api;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod retry;
pub mod server;
pub mod sink;
pub mod tasks;

// Re-export main types
pub use classify::{classify, ErrorKind};
pub use config::{ApiConfig, DispatchConfig, HealthConfig, OrchestratorConfig, TransportConfig};
pub use dispatch::{Dispatcher, ProxyPicker};
pub use error::{OrchestratorError, Result};
pub use registry::{WorkerRegistry, WorkerSnapshot, WorkerState};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use server::TransportServer;
pub use sink::{MemorySink, ResultSink};
pub use tasks::{TaskPayload, TaskSnapshot, TaskState, TaskStore};
