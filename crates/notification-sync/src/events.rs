//! Events emitted to the presentation layer.
//!
//! The engine never shows anything itself; toasts, badges and banners are
//! driven from these events.

use serde::Serialize;

use crate::model::{Notification, NotificationId};

/// Event published on the sync service's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A previously unseen unread notification. Sent at most once per id for
    /// the lifetime of a session.
    NewArrival { notification: Notification },
    /// An optimistic read was rolled back.
    MarkReadFailed { id: NotificationId, error: String },
    /// An optimistic mark-all was rolled back.
    MarkAllReadFailed { error: String },
    /// A full fetch failed; the previous state is kept.
    FetchFailed { error: String },
    /// A reconciliation tick failed; polling continues.
    PollFailed { error: String },
}

impl SyncEvent {
    /// Snake-case event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewArrival { .. } => "new_arrival",
            Self::MarkReadFailed { .. } => "mark_read_failed",
            Self::MarkAllReadFailed { .. } => "mark_all_read_failed",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::PollFailed { .. } => "poll_failed",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::NewArrival { .. })
    }

    /// Whether the user should see this event (poll failures are background
    /// noise and only logged).
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::PollFailed { .. })
    }

    /// Short text for a transient toast.
    pub fn toast_message(&self) -> String {
        match self {
            Self::NewArrival { notification } => {
                format!("{}: {}", notification.title, notification.message)
            }
            Self::MarkReadFailed { .. } => "Could not mark notification as read".to_string(),
            Self::MarkAllReadFailed { .. } => {
                "Could not mark all notifications as read".to_string()
            }
            Self::FetchFailed { .. } => "Could not load notifications".to_string(),
            Self::PollFailed { .. } => "Notification refresh failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::notification;

    #[test]
    fn test_event_classification() {
        let arrival = SyncEvent::NewArrival {
            notification: notification("a", 0),
        };
        assert_eq!(arrival.event_type(), "new_arrival");
        assert!(!arrival.is_error());
        assert_eq!(arrival.toast_message(), "Fault a: Spindle overheating");

        let poll = SyncEvent::PollFailed {
            error: "timeout".to_string(),
        };
        assert!(poll.is_error());
        assert!(!poll.is_user_visible());
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::MarkReadFailed {
            id: NotificationId::from("n-1"),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "mark_read_failed");
        assert_eq!(json["id"], "n-1");
    }
}
