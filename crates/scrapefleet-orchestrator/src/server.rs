//! TCP transport for worker connections.
//!
//! Each connection starts with an auth handshake (`Hello` -> `Granted` or
//! `Denied`), after which the worker sends heartbeats, blocked notices
//! and task reports, and receives dispatches through its outbound queue.

use scrapefleet_proto::codec::{Codec, FrameHeader, MessageType, FRAME_HEADER_SIZE};
use scrapefleet_proto::{
    AuthMessage, ControlMessage, Envelope, ProtocolError, TaskMessage, WorkerId,
};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{OrchestratorError, Result};
use crate::registry::WorkerRegistry;

/// Worker-facing TCP server.
pub struct TransportServer {
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    heartbeat_interval: Duration,
}

impl TransportServer {
    /// Creates a new transport server.
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            heartbeat_interval,
        }
    }

    /// Accepts worker connections until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "Worker transport listening"),
            Err(e) => warn!(error = %e, "Worker transport listening on unknown address"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted worker connection");
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                warn!(%peer, error = %e, "Worker connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        if e.kind() == ErrorKind::Interrupted {
                            continue;
                        }
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                () = cancel.cancelled() => {
                    info!("Worker transport stopping");
                    return;
                }
            }
        }
    }

    /// Drives one worker connection from handshake to disconnect.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let (worker_id, token) = match self.handshake(&mut reader, &mut writer).await {
            Ok(identity) => identity,
            Err(e) => {
                // Denial frame already went out where applicable
                debug!(error = %e, "Handshake failed");
                return Ok(());
            }
        };

        let outbound = self.dispatcher.register_connection(&worker_id);
        let writer_task = tokio::spawn(run_writer(writer, outbound));

        let result = self.read_loop(&mut reader, &worker_id, &token).await;

        self.dispatcher.handle_disconnect(&worker_id);
        writer_task.abort();
        info!(worker_id, "Worker disconnected");
        result
    }

    /// Performs the auth handshake.
    ///
    /// The first frame must be an `Auth` `Hello`. Returns the worker's
    /// identity and the token it presented, kept for per-message
    /// revocation checks.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(WorkerId, String)> {
        let (header, payload) = match read_frame(reader).await? {
            Some(frame) => frame,
            None => return Err(OrchestratorError::ConnectionClosed(String::new())),
        };

        if header.message_type != MessageType::Auth {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected auth hello, got {:?}",
                header.message_type
            ))
            .into());
        }

        let envelope: Envelope<AuthMessage> = Codec::decode(&payload)?;
        let (worker_id, token) = match envelope.payload {
            AuthMessage::Hello { worker_id, token } => (worker_id, token),
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "expected hello, got {other:?}"
                ))
                .into());
            }
        };

        match self.registry.authenticate(&worker_id, &token) {
            Ok(held_task) => {
                // A task held over a crash-reconnect goes back to pending
                if let Some(task_id) = held_task {
                    warn!(worker_id, task_id = %task_id, "Releasing task held across reconnect");
                    self.dispatcher.reclaim(task_id);
                }

                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let granted = AuthMessage::Granted {
                    heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
                };
                write_auth_frame(writer, &Envelope::response_to(&envelope.header, granted)).await?;
                info!(worker_id, "Worker authenticated");
                Ok((worker_id, token))
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Authentication denied");
                let denied = AuthMessage::Denied {
                    reason: e.to_string(),
                };
                write_auth_frame(writer, &Envelope::response_to(&envelope.header, denied)).await?;
                Err(e)
            }
        }
    }

    /// Processes inbound frames until the connection closes.
    ///
    /// The presented token is re-verified against the registry before
    /// every message, so regenerating a worker's token severs its live
    /// session at the next frame.
    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        worker_id: &str,
        token: &str,
    ) -> Result<()> {
        loop {
            let (header, payload) = match read_frame(reader).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            if let Err(e) = self.registry.verify_token(worker_id, token) {
                warn!(worker_id, error = %e, "Token no longer valid, closing connection");
                return Err(e);
            }

            match header.message_type {
                MessageType::Control => {
                    let envelope: Envelope<ControlMessage> = Codec::decode(&payload)?;
                    self.handle_control(worker_id, envelope.payload);
                }
                MessageType::Task => {
                    let envelope: Envelope<TaskMessage> = Codec::decode(&payload)?;
                    self.handle_task(worker_id, envelope.payload).await?;
                }
                MessageType::Auth => {
                    return Err(ProtocolError::UnexpectedMessage(
                        "auth message after handshake".to_owned(),
                    )
                    .into());
                }
            }
        }
    }

    fn handle_control(&self, worker_id: &str, message: ControlMessage) {
        match message {
            ControlMessage::Heartbeat { active_tasks } => {
                debug!(worker_id, active_tasks, "Heartbeat");
                self.registry.heartbeat(worker_id);
            }
            ControlMessage::BlockedNotice { duration_ms } => {
                info!(worker_id, duration_ms, "Worker reports itself blocked");
                if let Err(e) = self
                    .registry
                    .mark_blocked(worker_id, Duration::from_millis(duration_ms))
                {
                    warn!(worker_id, error = %e, "Blocked notice not applied");
                }
            }
        }
    }

    async fn handle_task(&self, worker_id: &str, message: TaskMessage) -> Result<()> {
        match message {
            TaskMessage::Completed(result) => {
                self.dispatcher.handle_success(worker_id, result).await;
                Ok(())
            }
            TaskMessage::Failed(failure) => {
                self.dispatcher.handle_failure(worker_id, failure).await;
                Ok(())
            }
            TaskMessage::Dispatch(_) => Err(ProtocolError::UnexpectedMessage(
                "dispatch from worker".to_owned(),
            )
            .into()),
        }
    }
}

/// Drains a worker's outbound queue onto its socket.
async fn run_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Envelope<TaskMessage>>) {
    let mut codec = Codec::with_capacity(8192);
    while let Some(envelope) = outbound.recv().await {
        let frame = match codec.encode(&envelope, MessageType::Task) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Outbound frame encoding failed");
                continue;
            }
        };
        if let Err(e) = writer.write_all(frame).await {
            debug!(error = %e, "Outbound write failed, stopping writer");
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

/// Reads one frame. Returns `None` on clean end-of-stream.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&header_buf)?;
    if !header.is_version_supported() {
        return Err(ProtocolError::UnsupportedVersion(header.version).into());
    }
    header.validate_payload_len()?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

/// Encodes and writes one auth frame. Only the handshake writes outside
/// the writer task.
async fn write_auth_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope<AuthMessage>,
) -> Result<()> {
    let mut codec = Codec::new();
    let frame = codec.encode(envelope, MessageType::Auth)?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
