//! Presentation-facing notification sync service.
//!
//! `NotificationSync` owns one user session at a time: `start` performs the
//! initial fetch and launches the poller, `stop` tears both down
//! synchronously. UI surfaces read the list and counter from it and call the
//! mark operations, which return immediately.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EntityState, NotificationCache};
use crate::config::SyncConfig;
use crate::engine::{self, SessionScope, SyncContext};
use crate::events::SyncEvent;
use crate::model::{Notification, NotificationId};
use crate::poller::{Poller, PollerState, TickOutcome};
use crate::store::NotificationStore;
use crate::{Error, Result};

/// Loading and error state of the last full fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub loading: bool,
    pub last_error: Option<String>,
}

struct Session {
    scope: SessionScope,
    poller: Arc<Poller>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Notification synchronization service.
pub struct NotificationSync {
    ctx: SyncContext,
    status: RwLock<SyncStatus>,
    session: Mutex<Option<Session>>,
}

impl NotificationSync {
    /// Create a service over `store`. Fails on invalid configuration.
    pub fn new(store: Arc<dyn NotificationStore>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            ctx: SyncContext {
                store,
                cache: Arc::new(NotificationCache::new()),
                events,
                config,
            },
            status: RwLock::new(SyncStatus {
                loading: true,
                last_error: None,
            }),
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    /// Subscribe to arrival and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Cached notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.ctx.cache.notifications()
    }

    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        self.ctx.cache.get(id)
    }

    pub fn unread_count(&self) -> u64 {
        self.ctx.cache.unread_count()
    }

    pub fn state_of(&self, id: &NotificationId) -> EntityState {
        self.ctx.cache.state_of(id)
    }

    pub fn loading(&self) -> bool {
        self.status.read().loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.read().last_error.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// User of the running session, if any.
    pub fn user_id(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.scope.user_id.to_string())
    }

    /// Whether the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.task.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// Whether a reconciliation tick is running. `Idle` without a session.
    pub fn poller_state(&self) -> PollerState {
        self.session
            .lock()
            .as_ref()
            .map_or(PollerState::Idle, |s| s.poller.state())
    }

    fn current(&self) -> Option<(SessionScope, Arc<Poller>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.scope.clone(), s.poller.clone()))
    }

    /// Start a session for `user_id`, replacing any running session.
    ///
    /// Without a user nothing is started and `loading` is cleared. A failed
    /// initial fetch is recorded in the status; the poller still starts and
    /// recovers on its first successful tick.
    pub async fn start(&self, user_id: Option<&str>) {
        self.stop();

        let Some(user_id) = user_id.map(str::trim).filter(|u| !u.is_empty()) else {
            info!("No active session, notification sync not started");
            self.status.write().loading = false;
            return;
        };

        let epoch = self.ctx.cache.begin_session();
        let scope = SessionScope {
            user_id: Arc::from(user_id),
            epoch,
        };
        let cancel = CancellationToken::new();
        let poller = Arc::new(Poller::new(self.ctx.clone(), scope.clone(), cancel.clone()));

        *self.session.lock() = Some(Session {
            scope,
            poller: poller.clone(),
            cancel: cancel.clone(),
            task: None,
        });
        info!(user_id, "Starting notification sync");

        if let Err(e) = self.fetch_notifications().await {
            debug!(error = %e, "Initial notification fetch failed, poller will retry");
        }

        let mut session = self.session.lock();
        match session.as_mut() {
            Some(s) if s.scope.epoch == epoch && !cancel.is_cancelled() => {
                s.task = Some(poller.spawn());
            }
            _ => debug!("Session ended during initial fetch, poller not started"),
        }
    }

    /// Stop the running session.
    ///
    /// Cancels the poller and clears the cache; results of requests still in
    /// flight are ignored when they arrive.
    pub fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };

        session.cancel.cancel();
        if let Some(task) = session.task {
            task.abort();
        }
        self.ctx.cache.end_session();
        *self.status.write() = SyncStatus::default();

        info!(user_id = %session.scope.user_id, "Stopped notification sync");
    }

    /// Replace the cache with a full fetch from the store.
    pub async fn fetch_notifications(&self) -> Result<()> {
        let (scope, poller) = self.current().ok_or(Error::NoSession)?;
        self.status.write().loading = true;

        match engine::resync_from_remote(&self.ctx, &scope).await {
            Ok(true) => {
                let notifications = self.ctx.cache.notifications();
                poller.seed(notifications.iter().map(|n| &n.id));
                *self.status.write() = SyncStatus::default();
                debug!(
                    count = notifications.len(),
                    unread = self.ctx.cache.unread_count(),
                    "Fetched notifications"
                );
                Ok(())
            }
            Ok(false) => {
                debug!("Discarding notification fetch for ended session");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch notifications");
                if self.ctx.cache.current_epoch() == scope.epoch {
                    *self.status.write() = SyncStatus {
                        loading: false,
                        last_error: Some(e.to_string()),
                    };
                    self.ctx.emit(SyncEvent::FetchFailed {
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Retry after a failed fetch.
    pub async fn retry(&self) -> Result<()> {
        self.fetch_notifications().await
    }

    /// Refresh the counter from the store and return the new value.
    pub async fn fetch_unread_count(&self) -> Result<u64> {
        let (scope, _) = self.current().ok_or(Error::NoSession)?;
        let count = self.ctx.store.unread_count(&scope.user_id).await?;
        self.ctx
            .cache
            .set_authoritative_count(scope.epoch, count, self.ctx.config.pending_grace());
        Ok(self.ctx.cache.unread_count())
    }

    /// Mark one notification read.
    ///
    /// Returns the confirmation task, or `None` when there was nothing to do.
    /// Failures are reported through [`SyncEvent::MarkReadFailed`].
    pub fn mark_as_read(&self, id: &NotificationId) -> Option<JoinHandle<()>> {
        let (scope, _) = self.current()?;
        engine::mark_as_read(&self.ctx, &scope, id)
    }

    /// Mark every notification read.
    ///
    /// Returns the confirmation task, or `None` without a session or while a
    /// previous mark-all is still in flight.
    pub fn mark_all_as_read(&self) -> Option<JoinHandle<()>> {
        let (scope, _) = self.current()?;
        engine::mark_all_as_read(&self.ctx, &scope)
    }

    /// Run a reconciliation tick now.
    pub async fn poll_now(&self) -> TickOutcome {
        match self.current() {
            Some((_, poller)) => poller.tick().await,
            None => TickOutcome::Discarded,
        }
    }
}

impl Drop for NotificationSync {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}
