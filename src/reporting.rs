//! Internal error-reporting queue.
//!
//! Any component that hits a non-fatal internal error hands a message to an
//! [`ErrorReporter`]. The lifecycle's drain task owns the matching
//! [`ErrorDrain`] and logs each message as it arrives.
//!
//! The queue is bounded. Producers never wait: when the buffer is full (slow
//! consumer) or closed (drain already gone) the message is logged locally and
//! discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Cloneable producer side of the error queue.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side of the error queue.
#[derive(Debug)]
pub struct ErrorDrain {
    rx: mpsc::Receiver<String>,
}

impl ErrorReporter {
    /// Create a queue holding at most `capacity` pending messages.
    ///
    /// A zero capacity is raised to 1.
    pub fn channel(capacity: usize) -> (ErrorReporter, ErrorDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ErrorReporter {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            ErrorDrain { rx },
        )
    }

    /// Enqueue `message` without blocking.
    pub fn report(&self, message: impl Into<String>) {
        match self.tx.try_send(message.into()) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %message, "Error queue full, discarding report");
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %message, "Error queue closed, discarding report");
            }
        }
    }

    /// Messages discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ErrorDrain {
    /// Wait for the next message. `None` once every reporter is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Take a message that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new messages. Already queued ones can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
