//! Wire protocol for scrapefleet orchestrator ↔ worker communication.
//!
//! This crate provides the framed wire protocol spoken over the persistent
//! TCP connection between the orchestrator and each scrape worker. It is
//! based on rkyv zero-copy serialisation and supports:
//!
//! - Authentication handshake (worker token exchange)
//! - Control messages (heartbeats, blocked notices)
//! - Task messages (dispatch, completion, failure reports)
//!
//! # Wire Format
//!
//! All messages use a common envelope format with an 8-byte frame header:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Frame Header (8 bytes, fixed)               │
//! ├──────────────┬──────────────┬────────────────────────────┤
//! │  Version (2) │ Msg Type (2) │    Payload Length (4)      │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │                 rkyv-serialised Envelope                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use scrapefleet_proto::{Envelope, TaskMessage, TaskResult, TaskId};
//!
//! let envelope = Envelope::new(TaskMessage::Completed(TaskResult {
//!     task_id: TaskId::new(),
//!     payload: b"{\"items\": []}".to_vec(),
//! }));
//! ```

pub mod codec;
mod envelope;
mod error;
mod messages;
mod types;

// Re-export core types
pub use codec::{Codec, FrameHeader, MessageType, CURRENT_VERSION, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use envelope::{Envelope, EnvelopeHeader};
pub use error::ProtocolError;
pub use messages::{
    AuthMessage, ControlMessage, DispatchRequest, FailureSignal, TaskFailure, TaskMessage,
    TaskResult,
};
pub use types::{BotId, CorrelationId, TaskId, WorkerId};

/// Protocol version constants.
pub mod version {
    /// Current protocol version.
    pub const CURRENT: u16 = 1;

    /// Minimum supported protocol version.
    pub const MIN_SUPPORTED: u16 = 1;
}
