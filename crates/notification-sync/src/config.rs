//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for [`crate::NotificationSync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between reconciliation ticks in milliseconds.
    pub poll_interval_ms: u64,
    /// How long an unconfirmed optimistic read survives a poll snapshot that
    /// still reports the notification unread. At most `poll_interval_ms`, so
    /// the first tick one interval after a mark sees the remote state.
    pub pending_grace_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            pending_grace_ms: 5000,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_millis(self.pending_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be greater than zero"));
        }
        if self.pending_grace_ms > self.poll_interval_ms {
            return Err(Error::config(format!(
                "pending_grace_ms ({}) must not exceed poll_interval_ms ({})",
                self.pending_grace_ms, self.poll_interval_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}
