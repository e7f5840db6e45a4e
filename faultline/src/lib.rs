//! Headless notification client for the faultline maintenance tracker.
//!
//! Wires the REST-backed store into [`notification_sync::NotificationSync`]
//! and renders its events through the log.

pub mod config;
pub mod logging;
pub mod presenter;
pub mod rest_store;

pub use config::AppConfig;
pub use presenter::{LogPresenter, Toast, ToastLevel};
pub use rest_store::RestNotificationStore;
