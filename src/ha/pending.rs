//! Pending activity tracking
//!
//! Counts in-flight rebind and persistence work started by this node so
//! callers can wait for it to settle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Shared counter of in-flight work
#[derive(Clone)]
pub struct PendingTracker {
    count: Arc<watch::Sender<usize>>,
}

/// Held while one unit of work is in flight; releases it on drop
pub struct PendingGuard {
    count: Arc<watch::Sender<usize>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Register one unit of in-flight work
    pub fn begin(&self) -> PendingGuard {
        self.count.send_modify(|n| *n += 1);
        PendingGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Number of units currently in flight
    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until nothing is in flight
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.count.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if settled {
            Ok(())
        } else {
            Err(Error::Timeout(timeout))
        }
    }
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}
