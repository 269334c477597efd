//! Persistent push connection with exponential-backoff reconnection
//!
//! The connection only moves frames. It never touches reconciliation state,
//! so a reconnect is invisible to the message log: replayed chunks are
//! absorbed by the reconciler's idempotence.

use std::sync::Arc;

use eddy_wire::RawFrame;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    events::ConnectionStatus,
    transport::{EventTransport, RetryConfig, TransportSignal},
};

/// Items delivered to the connection owner, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionItem {
    Frame(RawFrame),
    Status(ConnectionStatus),
}

/// Owner side of an open connection
pub struct ConnectionHandle {
    conversation_id: String,
    rx: mpsc::Receiver<ConnectionItem>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next frame or status change; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<ConnectionItem> {
        self.rx.recv().await
    }
}

/// Opens push connections for conversations
#[derive(Clone)]
pub struct StreamConnection {
    transport: Arc<dyn EventTransport>,
    retry: RetryConfig,
}

impl StreamConnection {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            retry: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Start the connection loop for a conversation
    pub fn open(&self, conversation_id: &str) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&self.transport),
            self.retry.clone(),
            conversation_id.to_string(),
            tx,
            cancel.clone(),
        ));

        ConnectionHandle {
            conversation_id: conversation_id.to_string(),
            rx,
            cancel,
            task,
        }
    }

    /// Stop the connection loop and wait for it to exit
    pub async fn close(handle: ConnectionHandle) {
        let ConnectionHandle {
            conversation_id,
            rx,
            cancel,
            task,
        } = handle;
        cancel.cancel();
        // unread items must not keep the task parked on a full channel
        drop(rx);
        if let Err(e) = task.await {
            tracing::warn!(conversation_id = %conversation_id, "Connection task failed: {}", e);
        }
        tracing::info!(conversation_id = %conversation_id, "Connection closed");
    }
}

/// Hand one item to the owner. `false` once the owner is gone or the
/// connection was cancelled.
async fn deliver(
    tx: &mpsc::Sender<ConnectionItem>,
    cancel: &CancellationToken,
    item: ConnectionItem,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Why one connection attempt ended
struct Failure {
    error: String,
    retryable: bool,
}

impl Failure {
    fn retryable(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }
}

async fn run(
    transport: Arc<dyn EventTransport>,
    retry: RetryConfig,
    conversation_id: String,
    tx: mpsc::Sender<ConnectionItem>,
    cancel: CancellationToken,
) {
    // consecutive failures since the last successful open
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        tracing::info!(conversation_id = %conversation_id, attempt = failures, "Connecting");
        let connecting = ConnectionItem::Status(ConnectionStatus::Connecting { attempt: failures });
        if !deliver(&tx, &cancel, connecting).await {
            break;
        }

        let failure = match transport.connect(&conversation_id).await {
            Ok(mut signals) => loop {
                let signal = tokio::select! {
                    _ = cancel.cancelled() => None,
                    signal = signals.next() => signal,
                };
                let item = match signal {
                    Some(TransportSignal::Open) => {
                        failures = 0;
                        tracing::info!(conversation_id = %conversation_id, "Connection open");
                        ConnectionItem::Status(ConnectionStatus::Open)
                    }
                    Some(TransportSignal::Frame(frame)) => ConnectionItem::Frame(frame),
                    Some(TransportSignal::Error(e)) => break Failure::retryable(e),
                    Some(TransportSignal::Rejected(e)) => {
                        break Failure {
                            error: e,
                            retryable: false,
                        };
                    }
                    None if cancel.is_cancelled() => break Failure::retryable(""),
                    None => break Failure::retryable("stream ended"),
                };
                if !deliver(&tx, &cancel, item).await {
                    break Failure::retryable("");
                }
            },
            Err(e) => Failure {
                retryable: e.is_transient(),
                error: e.to_string(),
            },
        };

        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }

        failures += 1;
        if !failure.retryable || failures >= retry.max_attempts {
            tracing::warn!(
                conversation_id = %conversation_id,
                attempts = failures,
                retryable = failure.retryable,
                error = %failure.error,
                "Giving up on connection"
            );
            let gave_up = ConnectionItem::Status(ConnectionStatus::GaveUp { attempts: failures });
            deliver(&tx, &cancel, gave_up).await;
            return;
        }

        let delay = retry.delay_for_attempt(failures - 1);
        tracing::warn!(
            conversation_id = %conversation_id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %failure.error,
            "Connection lost, reconnecting"
        );
        let reconnecting = ConnectionItem::Status(ConnectionStatus::Reconnecting {
            attempt: failures,
            delay_ms: delay.as_millis() as u64,
            error: failure.error,
        });
        if !deliver(&tx, &cancel, reconnecting).await {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // best effort; the owner may already be gone
    let _ = tx.try_send(ConnectionItem::Status(ConnectionStatus::Closed));
}
