//! Notification entity as delivered by the remote store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Base used to resolve relative deep links. Only the path and query are kept.
const LINK_BASE: &str = "https://faultline.invalid/";

/// Query parameter carrying the related maintenance record in a deep link.
const FAULT_QUERY_PARAM: &str = "faultId";

/// Remote-assigned notification identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of event that produced the notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewFault,
    FaultResolved,
    #[default]
    #[serde(other)]
    Other,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewFault => "new_fault",
            Self::FaultResolved => "fault_resolved",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user notification.
///
/// Everything except `is_read` is immutable once the store assigns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: String,
    pub factory_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub related_fault_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Parsed form of [`Notification::link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepLink {
    /// Route path, e.g. `/faults`.
    pub route: String,
    /// Maintenance record the link points at, if any.
    pub fault_id: Option<String>,
}

impl DeepLink {
    /// Route with the fault id carried as a percent-encoded query parameter.
    pub fn href(&self) -> String {
        let Some(fault_id) = &self.fault_id else {
            return self.route.clone();
        };
        let Ok(mut url) = Url::parse(LINK_BASE).and_then(|base| base.join(&self.route)) else {
            return self.route.clone();
        };

        url.query_pairs_mut()
            .clear()
            .append_pair(FAULT_QUERY_PARAM, fault_id);
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        }
    }
}

impl Notification {
    /// Resolve the deep link into a route and related fault.
    ///
    /// Falls back to `related_fault_id` when the link carries no `faultId`
    /// parameter. Returns `None` when there is no usable link.
    pub fn deep_link(&self) -> Option<DeepLink> {
        let raw = self.link.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }

        let base = Url::parse(LINK_BASE).ok()?;
        let url = base.join(raw).ok()?;

        let fault_id = url
            .query_pairs()
            .find(|(key, _)| key == FAULT_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .or_else(|| self.related_fault_id.clone());

        Some(DeepLink {
            route: url.path().to_string(),
            fault_id,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// Build an unread notification created `minute` minutes past a fixed hour.
    pub fn notification(id: &str, minute: u32) -> Notification {
        Notification {
            id: NotificationId::from(id),
            user_id: "user-1".to_string(),
            factory_id: "factory-1".to_string(),
            kind: NotificationType::NewFault,
            title: format!("Fault {id}"),
            message: "Spindle overheating".to_string(),
            link: Some(format!("/faults?faultId=fault-{id}")),
            related_fault_id: Some(format!("fault-{id}")),
            is_read: false,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap(),
        }
    }

    pub fn read(mut n: Notification) -> Notification {
        n.is_read = true;
        n
    }
}
