use std::path::PathBuf;
use std::sync::Arc;

use faultline::logging::{self, LOG_RETENTION_DAYS};
use faultline::{AppConfig, LogPresenter, RestNotificationStore};
use notification_sync::NotificationSync;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    if let Some(dir) = config.log_dir.as_deref() {
        let dir = PathBuf::from(dir);
        tokio::spawn(async move {
            if let Err(e) = logging::cleanup_old_logs(&dir, LOG_RETENTION_DAYS).await {
                warn!(error = %e, "Failed to cleanup old logs");
            }
        });
    }

    let store = Arc::new(RestNotificationStore::new(&config)?);
    let sync = NotificationSync::new(store, config.sync.clone())?;

    let cancellation_token = CancellationToken::new();
    let presenter = LogPresenter::spawn(sync.subscribe(), cancellation_token.clone());

    sync.start(config.user_id.as_deref()).await;

    if sync.user_id().is_some() {
        info!(
            notifications = sync.notifications().len(),
            unread = sync.unread_count(),
            "faultline notification client running, press Ctrl+C to exit"
        );
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
    } else {
        warn!("FAULTLINE_USER_ID is not set, nothing to sync");
    }

    sync.stop();
    cancellation_token.cancel();
    if let Err(e) = presenter.await {
        warn!(error = %e, "Presenter task failed");
    }

    Ok(())
}
