//! Logging setup: console output plus an optional daily rolling file.

use std::path::Path;

use chrono::Utc;
use notification_sync::{Error, Result};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "faultline=info,notification_sync=info";

/// Days a rolled log file is kept.
pub const LOG_RETENTION_DAYS: i64 = 7;

const LOG_FILE_PREFIX: &str = "faultline.log";

/// Timestamps in the local timezone with millisecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// When `log_dir` is set, logs are also written to `faultline.log.YYYY-MM-DD`
/// in that directory. The returned guard flushes the file writer and must be
/// held until shutdown.
pub fn init_logging(log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer().with_ansi(true).with_timer(LocalTimer);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::config(format!("cannot create log dir {dir}: {e}")))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(LocalTimer)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter())
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to initialize logging: {e}")))?;

    Ok(guard)
}

/// Delete rolled log files older than `retention_days`.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_file_date)
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

fn rolled_file_date(name: &str) -> Option<chrono::NaiveDate> {
    let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("faultline=info"));
        assert!(DEFAULT_LOG_FILTER.contains("notification_sync=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_rolled_file_date() {
        assert_eq!(
            rolled_file_date("faultline.log.2024-05-01"),
            chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(rolled_file_date("faultline.log"), None);
        assert_eq!(rolled_file_date("other.log.2024-05-01"), None);
        assert_eq!(rolled_file_date("faultline.log.yesterday"), None);
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        std::fs::write(dir.path().join("faultline.log.2000-01-01"), "old").unwrap();
        std::fs::write(dir.path().join(format!("faultline.log.{today}")), "new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!dir.path().join("faultline.log.2000-01-01").exists());
        assert!(dir.path().join(format!("faultline.log.{today}")).exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_init_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        // Another test may already own the global subscriber; the directory
        // is created either way.
        let _ = init_logging(log_dir.to_str());
        assert!(log_dir.is_dir());
    }
}
