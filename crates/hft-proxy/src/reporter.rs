//! Error sink shared by every listener, session and the control server.
//!
//! Reporting never fails and never blocks: the counter is atomic and
//! notifications go out on a broadcast channel that drops them when nobody
//! is subscribed.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::error;

/// Capacity of the notification channel; slow observers lag, reporters
/// never wait.
const NOTICE_CAPACITY: usize = 256;

/// A reported error, as delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
    /// The operation that raised the error, e.g. `"ListenerTask::accept"`.
    pub source: &'static str,
}

/// Counts uncleared errors and fans them out to observers.
pub struct ErrorReporter {
    uncleared: AtomicU64,
    notices: broadcast::Sender<ErrorNotice>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            uncleared: AtomicU64::new(0),
            notices,
        }
    }

    /// Record an error raised by `source`.
    pub fn report(&self, source: &'static str, err: impl Display) {
        let message = err.to_string();
        let count = self.uncleared.fetch_add(1, Ordering::Relaxed) + 1;
        error!(source, uncleared = count, "{message}");
        // No receivers is fine.
        let _ = self.notices.send(ErrorNotice { message, source });
    }

    /// Reset the uncleared-error counter to zero.
    pub fn clear(&self) {
        self.uncleared.store(0, Ordering::Relaxed);
    }

    pub fn uncleared(&self) -> u64 {
        self.uncleared.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ErrorNotice> {
        self.notices.subscribe()
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}
