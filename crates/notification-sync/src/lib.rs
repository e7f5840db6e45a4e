//! Client-side notification synchronization.
//!
//! Keeps a per-user notification cache consistent with a remote store:
//!
//! - optimistic read marks with exact rollback on failure
//! - timer-driven full reconciliation with once-per-id arrival events
//! - an unread counter checked against the store's authoritative count
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use notification_sync::{MemoryNotificationStore, NotificationSync, SyncConfig};
//!
//! let store = Arc::new(MemoryNotificationStore::new());
//! let sync = NotificationSync::new(store, SyncConfig::default())?;
//! let mut events = sync.subscribe();
//!
//! sync.start(Some("user-1")).await;
//! sync.mark_all_as_read();
//! sync.stop();
//! ```

pub mod cache;
pub mod config;
pub mod counter;
mod engine;
pub mod error;
pub mod events;
pub mod model;
mod poller;
pub mod service;
pub mod store;

pub use cache::{EntityState, NotificationCache, ResyncReason};
pub use config::SyncConfig;
pub use counter::UnreadCounter;
pub use error::{Error, Result};
pub use events::SyncEvent;
pub use model::{DeepLink, Notification, NotificationId, NotificationType};
pub use poller::{PollerState, TickOutcome};
pub use service::{NotificationSync, SyncStatus};
pub use store::{MemoryNotificationStore, NotificationStore, StoreOp};
