//! Optimistic mutation engine.
//!
//! Read-state changes are applied to the cache first and confirmed with the
//! store from a spawned task. Callers never see remote errors; a failed
//! confirmation is rolled back and reported on the event channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::cache::{BulkRollback, Completion, NotificationCache};
use crate::config::SyncConfig;
use crate::events::SyncEvent;
use crate::model::NotificationId;
use crate::store::NotificationStore;

/// Shared handles every sync path works against.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub store: Arc<dyn NotificationStore>,
    pub cache: Arc<NotificationCache>,
    pub events: broadcast::Sender<SyncEvent>,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// User and cache epoch an operation belongs to.
#[derive(Debug, Clone)]
pub(crate) struct SessionScope {
    pub user_id: Arc<str>,
    pub epoch: u64,
}

/// Fetch list and count together and replace the cache with them.
///
/// Returns `false` when the session ended while the fetch was in flight.
pub(crate) async fn resync_from_remote(ctx: &SyncContext, scope: &SessionScope) -> Result<bool> {
    let (snapshot, count) = tokio::try_join!(
        ctx.store.list(&scope.user_id),
        ctx.store.unread_count(&scope.user_id)
    )?;
    Ok(ctx
        .cache
        .resync(scope.epoch, snapshot, count, ctx.config.pending_grace()))
}

/// Mark one notification read.
///
/// No-op (returns `None`) when the notification is unknown, already read or
/// already awaiting confirmation.
pub(crate) fn mark_as_read(
    ctx: &SyncContext,
    scope: &SessionScope,
    id: &NotificationId,
) -> Option<JoinHandle<()>> {
    let ticket = ctx.cache.begin_mark_read(scope.epoch, id)?;
    debug!(notification_id = %id, "Optimistically marked notification read");

    let ctx = ctx.clone();
    let scope = scope.clone();
    Some(tokio::spawn(async move {
        match ctx.store.mark_read(ticket.id(), &scope.user_id).await {
            Ok(()) => {
                if ctx.cache.confirm_read(&ticket) == Completion::Discarded {
                    debug!(notification_id = %ticket.id(), "Read confirmed after session ended");
                    return;
                }
            }
            Err(e) => {
                warn!(notification_id = %ticket.id(), error = %e, "Failed to mark notification read");
                match ctx.cache.rollback_read(&ticket) {
                    Completion::Discarded => return,
                    Completion::Superseded => {
                        debug!(notification_id = %ticket.id(), "Rollback skipped, entry was resynced");
                    }
                    Completion::Applied => {}
                }
                ctx.emit(SyncEvent::MarkReadFailed {
                    id: ticket.id().clone(),
                    error: e.to_string(),
                });
            }
        }
        refresh_unread_count(&ctx, &scope).await;
    }))
}

/// Replace the provisional counter with the authoritative count once a
/// mutation round-trip has completed.
async fn refresh_unread_count(ctx: &SyncContext, scope: &SessionScope) {
    match ctx.store.unread_count(&scope.user_id).await {
        Ok(count) => {
            ctx.cache
                .set_authoritative_count(scope.epoch, count, ctx.config.pending_grace());
        }
        Err(e) => {
            // The next poll tick corrects the counter.
            warn!(error = %e, "Failed to refresh unread count");
        }
    }
}

/// Mark every notification read.
///
/// No-op (returns `None`) while another bulk mark is in flight.
pub(crate) fn mark_all_as_read(ctx: &SyncContext, scope: &SessionScope) -> Option<JoinHandle<()>> {
    let bulk = ctx.cache.begin_mark_all(scope.epoch)?;
    debug!(marked = bulk.marked(), "Optimistically marked all notifications read");

    let ctx = ctx.clone();
    let scope = scope.clone();
    Some(tokio::spawn(async move {
        match ctx.store.mark_all_read(&scope.user_id).await {
            Ok(()) => {
                if ctx.cache.confirm_mark_all(&bulk) == Completion::Discarded {
                    return;
                }
                verify_after_mark_all(&ctx, &scope).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to mark all notifications read");
                match ctx.cache.rollback_mark_all(&bulk) {
                    BulkRollback::Discarded => return,
                    BulkRollback::Restored => {}
                    BulkRollback::Stale => {
                        info!("Cache changed during mark-all, resyncing instead of restoring");
                        if let Err(e) = resync_from_remote(&ctx, &scope).await {
                            warn!(error = %e, "Resync after failed mark-all failed");
                        }
                    }
                }
                ctx.emit(SyncEvent::MarkAllReadFailed {
                    error: e.to_string(),
                });
            }
        }
    }))
}

/// Check the authoritative count after a successful bulk mark. Anything
/// nonzero means notifications arrived during the round-trip, so the zeroed
/// local state cannot be trusted.
async fn verify_after_mark_all(ctx: &SyncContext, scope: &SessionScope) {
    match ctx.store.unread_count(&scope.user_id).await {
        Ok(0) => {
            ctx.cache
                .set_authoritative_count(scope.epoch, 0, ctx.config.pending_grace());
        }
        Ok(remaining) => {
            info!(remaining, "Unread notifications remain after mark-all, resyncing");
            if let Err(e) = resync_from_remote(ctx, scope).await {
                warn!(error = %e, "Resync after mark-all failed");
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to verify unread count after mark-all");
        }
    }
}
