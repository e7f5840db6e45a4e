//! Remote notification store contract.

mod memory;

pub use memory::{MemoryNotificationStore, StoreOp};

use async_trait::async_trait;

use crate::Result;
use crate::model::{Notification, NotificationId};

/// Authoritative, per-user notification store.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// All notifications of the user, newest first.
    async fn list(&self, user_id: &str) -> Result<Vec<Notification>>;

    /// Number of unread notifications of the user.
    async fn unread_count(&self, user_id: &str) -> Result<u64>;

    /// Mark one notification read. Idempotent; must reject ids the user does
    /// not own.
    async fn mark_read(&self, id: &NotificationId, user_id: &str) -> Result<()>;

    /// Mark every notification of the user read.
    async fn mark_all_read(&self, user_id: &str) -> Result<()>;
}
