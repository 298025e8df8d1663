//! One registered viewer connection.

#![allow(missing_docs)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::core::errors::{BlsError, Result};
use crate::stream::transport::{StreamEvent, StreamTransport};

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer or an operator asked for it.
    Explicit,
    /// The viewer's end of the transport went away.
    Completed,
    /// A push did not complete within the push timeout.
    TimedOut,
    /// Any other push failure.
    TransportError,
    /// The subsystem is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Classify a failed push.
    pub fn from_push_error(err: &BlsError) -> Self {
        match err {
            BlsError::TransportTimeout { .. } => Self::TimedOut,
            BlsError::ChannelClosed { .. } => Self::Completed,
            _ => Self::TransportError,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A viewer's transport plus its liveness flag.
///
/// Filter and watermark live in the registry's own maps, keyed by the same id.
pub struct Connection {
    id: String,
    transport: Box<dyn StreamTransport>,
    alive: AtomicBool,
    /// Held for the duration of a poll or snapshot push so they never overlap.
    busy: Mutex<()>,
    opened_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(id: String, transport: Box<dyn StreamTransport>) -> Self {
        Self {
            id,
            transport,
            alive: AtomicBool::new(true),
            busy: Mutex::new(()),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Push one event unless the connection has already been closed.
    pub(crate) fn push(&self, event: StreamEvent) -> Result<()> {
        if !self.is_alive() {
            return Err(BlsError::Transport {
                connection_id: self.id.clone(),
                details: "connection closed".to_string(),
            });
        }
        self.transport.send(event)
    }

    /// `None` if another poll or push holds the connection.
    pub(crate) fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        self.busy.try_lock()
    }

    /// Wait for any in-flight poll to finish.
    pub(crate) fn begin(&self) -> MutexGuard<'_, ()> {
        self.busy.lock()
    }

    /// Flip to dead and complete the transport. Returns `false` if it was already dead.
    pub(crate) fn shut(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.transport.complete();
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}
