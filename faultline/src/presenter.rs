//! Headless presenter: renders sync events as log lines.
//!
//! Each event is turned into a [`Toast`], the same transient message a
//! graphical client would show, and logged at a level matching its severity.

use notification_sync::SyncEvent;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Error,
}

/// Transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    /// Route to open when the toast is clicked.
    pub route: Option<String>,
}

/// Map an event to the toast shown for it. Background poll failures have
/// none.
pub fn toast(event: &SyncEvent) -> Option<Toast> {
    if !event.is_user_visible() {
        return None;
    }

    let route = match event {
        SyncEvent::NewArrival { notification } => {
            notification.deep_link().map(|link| link.href())
        }
        _ => None,
    };

    Some(Toast {
        level: if event.is_error() {
            ToastLevel::Error
        } else {
            ToastLevel::Info
        },
        message: event.toast_message(),
        route,
    })
}

/// Consumes sync events until cancelled or the channel closes.
pub struct LogPresenter;

impl LogPresenter {
    pub fn spawn(
        mut rx: broadcast::Receiver<SyncEvent>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Presenter shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => present(&event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Presenter lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Sync event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

fn present(event: &SyncEvent) {
    match toast(event) {
        Some(Toast {
            level: ToastLevel::Info,
            message,
            route,
        }) => info!(event = event.event_type(), route = ?route, "{}", message),
        Some(Toast {
            level: ToastLevel::Error,
            message,
            ..
        }) => error!(event = event.event_type(), "{}", message),
        None => debug!(event = event.event_type(), ?event, "Background sync event"),
    }
}
