//! In-process notification store.
//!
//! Behaves like the remote store (ownership checks, newest-first ordering) and
//! lets callers inject failures or hold operations open to reproduce races.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::NotificationStore;
use crate::model::{Notification, NotificationId};
use crate::{Error, Result};

/// Store operation, used to target failure injection and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    UnreadCount,
    MarkRead,
    MarkAllRead,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<Notification>,
    failing: HashSet<StoreOp>,
    gates: HashMap<StoreOp, Arc<Semaphore>>,
    calls: HashMap<StoreOp, usize>,
    arrive_during_mark_all: Vec<Notification>,
}

impl MemoryState {
    fn insert(&mut self, notification: Notification) {
        self.rows.retain(|n| n.id != notification.id);
        let pos = self
            .rows
            .iter()
            .position(|n| n.created_at < notification.created_at)
            .unwrap_or(self.rows.len());
        self.rows.insert(pos, notification);
    }
}

/// Notification store backed by process memory.
#[derive(Default)]
pub struct MemoryNotificationStore {
    state: Mutex<MemoryState>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifications(notifications: impl IntoIterator<Item = Notification>) -> Self {
        let store = Self::new();
        for n in notifications {
            store.insert(n);
        }
        store
    }

    /// Add or replace a notification, keeping newest-first order.
    pub fn insert(&self, notification: Notification) {
        self.state.lock().insert(notification);
    }

    pub fn remove(&self, id: &NotificationId) {
        self.state.lock().rows.retain(|n| &n.id != id);
    }

    /// Change the read flag directly, as another device would.
    pub fn set_read(&self, id: &NotificationId, value: bool) {
        let mut state = self.state.lock();
        if let Some(n) = state.rows.iter_mut().find(|n| &n.id == id) {
            n.is_read = value;
        }
    }

    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        self.state.lock().rows.iter().find(|n| &n.id == id).cloned()
    }

    /// Make `op` fail (or succeed again).
    pub fn set_failing(&self, op: StoreOp, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Block calls to `op` until released.
    pub fn hold(&self, op: StoreOp) {
        self.state
            .lock()
            .gates
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    /// Let one held call to `op` proceed.
    pub fn release(&self, op: StoreOp) {
        if let Some(gate) = self.state.lock().gates.get(&op) {
            gate.add_permits(1);
        }
    }

    /// Stop holding `op`, letting every waiting call through.
    pub fn open(&self, op: StoreOp) {
        if let Some(gate) = self.state.lock().gates.remove(&op) {
            gate.close();
        }
    }

    /// Notifications that appear right after the next bulk mark is applied.
    pub fn arrive_during_mark_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        self.state
            .lock()
            .arrive_during_mark_all
            .extend(notifications);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        let gate = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            state.gates.get(&op).cloned()
        };

        if let Some(gate) = gate {
            // A closed gate means the operation was opened while waiting.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if self.state.lock().failing.contains(&op) {
            return Err(Error::store(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn list(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.enter(StoreOp::List).await?;
        Ok(self
            .state
            .lock()
            .rows
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.enter(StoreOp::UnreadCount).await?;
        Ok(self
            .state
            .lock()
            .rows
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as u64)
    }

    async fn mark_read(&self, id: &NotificationId, user_id: &str) -> Result<()> {
        self.enter(StoreOp::MarkRead).await?;
        let mut state = self.state.lock();
        let row = state
            .rows
            .iter_mut()
            .find(|n| &n.id == id && n.user_id == user_id)
            .ok_or_else(|| Error::not_found("Notification", id.as_str()))?;
        row.is_read = true;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<()> {
        self.enter(StoreOp::MarkAllRead).await?;
        let mut state = self.state.lock();
        for n in state.rows.iter_mut().filter(|n| n.user_id == user_id) {
            n.is_read = true;
        }
        let arrivals = std::mem::take(&mut state.arrive_during_mark_all);
        for n in arrivals {
            state.insert(n);
        }
        Ok(())
    }
}
