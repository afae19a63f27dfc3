//! Cooperative cancellation
//!
//! Every operation that may suspend (subprocess waits, fsync batches, queue
//! waits) takes a [`CancellationToken`] and checks it at each suspension
//! point. Cancelled operations leave the store consistent: writes either
//! committed fully or their tmp files are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default deadlines for the core operations
pub mod deadlines {
    use std::time::Duration;

    pub const UPSERT: Duration = Duration::from_secs(5);
    pub const QUERY: Duration = Duration::from_secs(2);
    pub const MIGRATION_PER_ITEM: Duration = Duration::from_secs(30);
    pub const LOCK_ACQUIRE: Duration = Duration::from_secs(5);
    /// Transcoder base timeout; add one second per frame on top
    pub const TRANSCODER_BASE: Duration = Duration::from_secs(300);

    /// Transcoder deadline for a batch of `frames` frames
    pub fn transcoder(frames: usize) -> Duration {
        TRANSCODER_BASE + Duration::from_secs(frames as u64)
    }
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// Cheaply cloneable cancellation handle
///
/// A token is cancelled either explicitly via [`CancellationToken::cancel`]
/// or implicitly once its deadline passes. Clones share state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Token that never expires on its own
    pub fn new() -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// Token that self-cancels after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Request cancellation; all clones observe it
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Error out if cancelled; called at suspension points
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }

    /// Remaining time before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
