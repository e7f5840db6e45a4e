//! Reconciliation poller.
//!
//! Periodically pulls a full snapshot from the store and reconciles it with
//! the local cache. Ticks never overlap: a timer fire (or manual poll) that
//! finds a tick in progress is dropped. Results that arrive after the session
//! was stopped are discarded.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EntityState, ReconcileHint, Reconciled, ResyncReason};
use crate::engine::{SessionScope, SyncContext};
use crate::events::SyncEvent;
use crate::model::{Notification, NotificationId};

/// Poller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Ticking,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// New ids were found; `announced` arrival events were emitted.
    Arrivals { announced: usize },
    /// First successful snapshot after a failed initial fetch.
    Seeded,
    Resynced(ResyncReason),
    Unchanged,
    /// Another tick was still running.
    Skipped,
    /// The session ended while the tick was in flight.
    Discarded,
    Failed,
}

#[derive(Debug, Default)]
struct Tracking {
    last_known: HashSet<NotificationId>,
    /// Every id ever announced this session.
    announced: HashSet<NotificationId>,
    seeded: bool,
}

/// Resets the poller to `Idle` when a tick finishes, fails or is dropped.
struct TickGuard<'a> {
    state: &'a Mutex<PollerState>,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = PollerState::Idle;
    }
}

/// Poller bound to one user session.
pub(crate) struct Poller {
    ctx: SyncContext,
    scope: SessionScope,
    cancel: CancellationToken,
    state: Mutex<PollerState>,
    tracking: Mutex<Tracking>,
}

impl Poller {
    pub fn new(ctx: SyncContext, scope: SessionScope, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            scope,
            cancel,
            state: Mutex::new(PollerState::Idle),
            tracking: Mutex::new(Tracking::default()),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }

    /// Record the ids of the initial full fetch as already known.
    ///
    /// Ignored once the poller has seen a snapshot, so ids picked up by a
    /// later manual fetch are still announced by the next tick.
    pub fn seed<'a>(&self, ids: impl IntoIterator<Item = &'a NotificationId>) -> bool {
        let mut tracking = self.tracking.lock();
        if tracking.seeded {
            return false;
        }
        tracking.last_known = ids.into_iter().cloned().collect();
        tracking.seeded = true;
        true
    }

    fn try_begin_tick(&self) -> Option<TickGuard<'_>> {
        let mut state = self.state.lock();
        if *state == PollerState::Ticking {
            return None;
        }
        *state = PollerState::Ticking;
        Some(TickGuard { state: &self.state })
    }

    /// Spawn the timer loop. The first tick fires one interval from now.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        let period = poller.ctx.config.poll_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = poller.cancel.cancelled() => {
                        debug!("Notification poller shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let outcome = poller.tick().await;
                        debug!(?outcome, "Notification poll tick finished");
                    }
                }
            }
        })
    }

    /// Run one reconciliation tick.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.try_begin_tick() else {
            debug!("Poll tick dropped, previous tick still running");
            return TickOutcome::Skipped;
        };

        let user_id = &self.scope.user_id;
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return TickOutcome::Discarded,
            result = async {
                tokio::try_join!(self.ctx.store.list(user_id), self.ctx.store.unread_count(user_id))
            } => result,
        };

        let (snapshot, authoritative) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, "Notification poll failed");
                self.ctx.emit(SyncEvent::PollFailed {
                    error: e.to_string(),
                });
                return TickOutcome::Failed;
            }
        };

        if self.cancel.is_cancelled() {
            return TickOutcome::Discarded;
        }

        self.apply(snapshot, authoritative)
    }

    fn apply(&self, snapshot: Vec<Notification>, authoritative: u64) -> TickOutcome {
        let mut tracking = self.tracking.lock();

        let remote_ids: HashSet<NotificationId> = snapshot.iter().map(|n| n.id.clone()).collect();
        // Ids the user already read here (e.g. picked up by a manual fetch
        // and marked before this tick) are not news, whatever the snapshot
        // says while the confirmation is in flight.
        let new_unread: Vec<Notification> = snapshot
            .iter()
            .filter(|n| !tracking.last_known.contains(&n.id))
            .filter(|n| !n.is_read)
            .filter(|n| {
                !matches!(
                    self.ctx.cache.state_of(&n.id),
                    EntityState::Read | EntityState::ReadPendingConfirm
                )
            })
            .cloned()
            .collect();
        let hint = ReconcileHint {
            has_new_ids: !tracking.seeded
                || remote_ids.iter().any(|id| !tracking.last_known.contains(id)),
            size_changed: remote_ids.len() != tracking.last_known.len(),
        };

        let Some(reconciled) = self.ctx.cache.reconcile(
            self.scope.epoch,
            snapshot,
            authoritative,
            hint,
            self.ctx.config.pending_grace(),
        ) else {
            return TickOutcome::Discarded;
        };

        let was_seeded = tracking.seeded;
        tracking.last_known = remote_ids;
        tracking.seeded = true;

        match reconciled {
            Reconciled::Unchanged => TickOutcome::Unchanged,
            Reconciled::Replaced(ResyncReason::NewArrivals) if !was_seeded => {
                info!(count = tracking.last_known.len(), "Seeded notification poller");
                TickOutcome::Seeded
            }
            Reconciled::Replaced(ResyncReason::NewArrivals) => {
                let mut announced = 0;
                for notification in new_unread {
                    if tracking.announced.insert(notification.id.clone()) {
                        debug!(notification_id = %notification.id, "New notification arrived");
                        self.ctx.emit(SyncEvent::NewArrival { notification });
                        announced += 1;
                    }
                }
                TickOutcome::Arrivals { announced }
            }
            Reconciled::Replaced(reason) => {
                debug!(%reason, "Resynced notifications from snapshot");
                TickOutcome::Resynced(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NotificationCache;
    use crate::config::SyncConfig;
    use crate::engine::{mark_as_read, resync_from_remote};
    use crate::model::fixtures::{notification, read};
    use crate::store::{MemoryNotificationStore, StoreOp};
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        poller: Arc<Poller>,
        ctx: SyncContext,
        scope: SessionScope,
        store: Arc<MemoryNotificationStore>,
        events: broadcast::Receiver<SyncEvent>,
        cancel: CancellationToken,
    }

    async fn harness(rows: Vec<Notification>) -> Harness {
        let store = Arc::new(MemoryNotificationStore::with_notifications(rows));
        let cache = Arc::new(NotificationCache::new());
        let (events, rx) = broadcast::channel(64);
        let ctx = SyncContext {
            store: store.clone(),
            cache: cache.clone(),
            events,
            config: SyncConfig {
                poll_interval_ms: 1000,
                pending_grace_ms: 1000,
                ..Default::default()
            },
        };
        let scope = SessionScope {
            user_id: Arc::from("user-1"),
            epoch: cache.begin_session(),
        };
        assert!(resync_from_remote(&ctx, &scope).await.unwrap());

        let cancel = CancellationToken::new();
        let poller = Arc::new(Poller::new(ctx.clone(), scope.clone(), cancel.clone()));
        poller.seed(cache.notifications().iter().map(|n| &n.id));

        Harness {
            poller,
            ctx,
            scope,
            store,
            events: rx,
            cancel,
        }
    }

    fn id(s: &str) -> NotificationId {
        NotificationId::from(s)
    }

    fn arrivals(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::NewArrival { notification } = event {
                ids.push(notification.id.to_string());
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_tick_announces_new_unread_once() {
        let mut h = harness(vec![notification("A", 0)]).await;
        h.store.insert(notification("B", 1));

        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 1 });
        let ids: Vec<_> = h
            .ctx
            .cache
            .notifications()
            .iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(h.ctx.cache.unread_count(), 2);
        assert_eq!(arrivals(&mut h.events), vec!["B"]);

        assert_eq!(h.poller.tick().await, TickOutcome::Unchanged);
        assert!(arrivals(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_read_arrival_is_not_announced() {
        let mut h = harness(vec![notification("A", 0)]).await;
        h.store.insert(read(notification("B", 1)));

        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 0 });
        assert!(arrivals(&mut h.events).is_empty());
        assert_eq!(h.ctx.cache.len(), 2);
    }

    #[tokio::test]
    async fn test_reappearing_id_is_not_announced_again() {
        let mut h = harness(vec![notification("A", 0)]).await;
        h.store.insert(notification("B", 1));
        h.poller.tick().await;
        assert_eq!(arrivals(&mut h.events), vec!["B"]);

        h.store.remove(&id("B"));
        assert_eq!(
            h.poller.tick().await,
            TickOutcome::Resynced(ResyncReason::SizeChanged)
        );

        h.store.insert(notification("B", 1));
        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 0 });
        assert!(arrivals(&mut h.events).is_empty());
        assert_eq!(h.ctx.cache.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_drift_is_corrected() {
        let h = harness(vec![notification("A", 0), notification("B", 1)]).await;
        // Marked read on another device.
        h.store.set_read(&id("A"), true);

        assert_eq!(
            h.poller.tick().await,
            TickOutcome::Resynced(ResyncReason::Drift)
        );
        assert_eq!(h.ctx.cache.unread_count(), 1);
        assert_eq!(h.ctx.cache.derived_unread(), 1);
    }

    #[tokio::test]
    async fn test_failed_tick_leaves_cache_untouched() {
        let mut h = harness(vec![notification("A", 0)]).await;
        let before = h.ctx.cache.notifications();
        h.store.insert(notification("B", 1));
        h.store.set_failing(StoreOp::List, true);

        assert_eq!(h.poller.tick().await, TickOutcome::Failed);
        assert_eq!(h.ctx.cache.notifications(), before);
        assert_eq!(h.poller.state(), PollerState::Idle);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            SyncEvent::PollFailed { .. }
        ));

        h.store.set_failing(StoreOp::List, false);
        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 1 });
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let h = harness(vec![notification("A", 0)]).await;
        h.store.hold(StoreOp::List);

        let first = {
            let poller = h.poller.clone();
            tokio::spawn(async move { poller.tick().await })
        };
        while h.poller.state() != PollerState::Ticking {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.poller.tick().await, TickOutcome::Skipped);

        h.store.open(StoreOp::List);
        assert_eq!(first.await.unwrap(), TickOutcome::Unchanged);
        assert_eq!(h.poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_result_after_cancel_is_discarded() {
        let h = harness(vec![notification("A", 0)]).await;
        h.store.hold(StoreOp::List);
        h.store.insert(notification("B", 1));

        let tick = {
            let poller = h.poller.clone();
            tokio::spawn(async move { poller.tick().await })
        };
        while h.poller.state() != PollerState::Ticking {
            tokio::task::yield_now().await;
        }

        h.cancel.cancel();
        h.store.open(StoreOp::List);

        assert_eq!(tick.await.unwrap(), TickOutcome::Discarded);
        assert_eq!(h.ctx.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_unseeded_poller_does_not_announce_backlog() {
        let mut h = harness(vec![notification("A", 0), notification("B", 1)]).await;
        let fresh = Poller::new(h.ctx.clone(), h.scope.clone(), CancellationToken::new());

        assert_eq!(fresh.tick().await, TickOutcome::Seeded);
        assert!(arrivals(&mut h.events).is_empty());

        h.store.insert(notification("C", 2));
        assert_eq!(fresh.tick().await, TickOutcome::Arrivals { announced: 1 });
        assert_eq!(arrivals(&mut h.events), vec!["C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_read_wins_within_grace() {
        let h = harness(vec![notification("A", 0)]).await;
        h.store.hold(StoreOp::MarkRead);

        let confirm = mark_as_read(&h.ctx, &h.scope, &id("A")).unwrap();
        h.store.insert(notification("B", 1));

        // Remote still reports A unread; local read must not flicker back.
        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 1 });
        assert!(h.ctx.cache.get(&id("A")).unwrap().is_read);
        assert_eq!(h.ctx.cache.unread_count(), 1);
        assert_eq!(h.poller.tick().await, TickOutcome::Unchanged);

        h.store.open(StoreOp::MarkRead);
        confirm.await.unwrap();
        assert_eq!(h.poller.tick().await, TickOutcome::Unchanged);
        assert_eq!(h.ctx.cache.unread_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locally_read_fetch_is_not_announced() {
        let mut h = harness(vec![notification("A", 0)]).await;
        // A manual fetch picks up C without touching the poller's known ids.
        h.store.insert(notification("C", 2));
        assert!(resync_from_remote(&h.ctx, &h.scope).await.unwrap());
        h.store.hold(StoreOp::MarkRead);

        let _confirm = mark_as_read(&h.ctx, &h.scope, &id("C")).unwrap();
        assert_eq!(
            h.ctx.cache.state_of(&id("C")),
            EntityState::ReadPendingConfirm
        );

        assert_eq!(h.poller.tick().await, TickOutcome::Arrivals { announced: 0 });
        assert!(arrivals(&mut h.events).is_empty());
        assert!(h.ctx.cache.get(&id("C")).unwrap().is_read);
        assert_eq!(h.ctx.cache.unread_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_read_corrects_one_interval_later() {
        let mut h = harness(vec![notification("A", 0)]).await;
        h.store.hold(StoreOp::MarkRead);

        let _confirm = mark_as_read(&h.ctx, &h.scope, &id("A")).unwrap();
        assert_eq!(h.ctx.cache.unread_count(), 0);
        let handle = h.poller.spawn();

        // First tick fires one interval after the mark.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.ctx.cache.unread_count(), 1);
        assert!(!h.ctx.cache.get(&id("A")).unwrap().is_read);
        assert!(arrivals(&mut h.events).is_empty());

        h.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_wins_after_grace() {
        let h = harness(vec![notification("A", 0)]).await;
        h.store.hold(StoreOp::MarkRead);

        let _confirm = mark_as_read(&h.ctx, &h.scope, &id("A")).unwrap();
        assert_eq!(h.ctx.cache.unread_count(), 0);

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(
            h.poller.tick().await,
            TickOutcome::Resynced(ResyncReason::Drift)
        );
        assert!(!h.ctx.cache.get(&id("A")).unwrap().is_read);
        assert_eq!(h.ctx.cache.unread_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_ticks_and_stops() {
        let mut h = harness(vec![notification("A", 0)]).await;
        let handle = h.poller.spawn();

        h.store.insert(notification("B", 1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(arrivals(&mut h.events), vec!["B"]);

        h.cancel.cancel();
        handle.await.unwrap();

        h.store.insert(notification("C", 2));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(arrivals(&mut h.events).is_empty());
        assert_eq!(h.ctx.cache.len(), 2);
    }
}
