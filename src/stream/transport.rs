//! Push transport to one viewer.
//!
//! The registry only knows [`StreamTransport`]. [`ChannelTransport`] is the
//! in-process implementation: a bounded crossbeam channel whose receiving end
//! ([`StreamSubscription`]) belongs to whoever renders the stream, e.g. an HTTP
//! handler writing SSE frames or the CLI `tail` command.

#![allow(missing_docs)]

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

use crate::core::errors::{BlsError, Result};
use crate::ingest::record::EventRecord;

/// Named event pushed to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Sent once, first, when a connection opens.
    Connected {
        connection_id: String,
        message: String,
    },
    /// A batch of records, newest first.
    Logs(Vec<EventRecord>),
}

impl StreamEvent {
    pub(crate) fn connected(connection_id: &str) -> Self {
        Self::Connected {
            connection_id: connection_id.to_string(),
            message: "log stream connected".to_string(),
        }
    }

    /// Wire event name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Logs(_) => "logs",
        }
    }

    /// Render as a Server-Sent Events frame.
    ///
    /// `connected` carries the plain message; `logs` carries the records as a
    /// JSON array.
    pub fn to_sse_frame(&self) -> Result<String> {
        let data = match self {
            Self::Connected { message, .. } => message.clone(),
            Self::Logs(records) => serde_json::to_string(records)?,
        };
        let mut frame = format!("event: {}\n", self.name());
        for line in data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        Ok(frame)
    }
}

/// Outbound side of one viewer connection.
///
/// `send` may block up to an implementation-defined bound and must return an
/// error rather than block indefinitely. `complete` ends the stream; sends
/// after it fail.
pub trait StreamTransport: Send + Sync {
    fn send(&self, event: StreamEvent) -> Result<()>;

    fn complete(&self) {}
}

// ──────────────────── channel transport ────────────────────

/// Bounded-channel transport with a per-push timeout.
pub struct ChannelTransport {
    connection_id: String,
    tx: Mutex<Option<Sender<StreamEvent>>>,
    push_timeout: Duration,
}

/// Viewer end of a [`ChannelTransport`].
pub struct StreamSubscription {
    connection_id: String,
    rx: Receiver<StreamEvent>,
}

/// Create a connected transport/subscription pair.
pub fn channel_transport(
    connection_id: impl Into<String>,
    capacity: usize,
    push_timeout: Duration,
) -> (ChannelTransport, StreamSubscription) {
    let connection_id = connection_id.into();
    let (tx, rx) = bounded(capacity);
    (
        ChannelTransport {
            connection_id: connection_id.clone(),
            tx: Mutex::new(Some(tx)),
            push_timeout,
        },
        StreamSubscription { connection_id, rx },
    )
}

impl StreamTransport for ChannelTransport {
    fn send(&self, event: StreamEvent) -> Result<()> {
        // Clone out so a slow viewer never holds the lock against `complete`.
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(BlsError::Transport {
                connection_id: self.connection_id.clone(),
                details: "stream already completed".to_string(),
            });
        };
        tx.send_timeout(event, self.push_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BlsError::TransportTimeout {
                    connection_id: self.connection_id.clone(),
                    waited_ms: u64::try_from(self.push_timeout.as_millis()).unwrap_or(u64::MAX),
                },
                SendTimeoutError::Disconnected(_) => BlsError::ChannelClosed {
                    component: "stream-subscription",
                },
            })
    }

    fn complete(&self) {
        self.tx.lock().take();
    }
}

impl StreamSubscription {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Block for the next event. `None` once the stream has completed and drained.
    pub fn recv(&self) -> Option<StreamEvent> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout`. `Ok(None)` on timeout, `Err` once the stream has completed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<StreamEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed()),
        }
    }

    /// Non-blocking variant of [`recv_timeout`](Self::recv_timeout).
    pub fn try_recv(&self) -> Result<Option<StreamEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed()),
        }
    }

    fn closed(&self) -> BlsError {
        BlsError::Transport {
            connection_id: self.connection_id.clone(),
            details: "stream completed".to_string(),
        }
    }
}
