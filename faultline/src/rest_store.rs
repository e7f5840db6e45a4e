//! Notification store backed by the platform's REST API.

use std::time::Duration;

use async_trait::async_trait;
use notification_sync::{Error, Notification, NotificationId, NotificationStore, Result};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::config::AppConfig;

const TABLE_PATH: &str = "rest/v1/notifications";
const PREFER: HeaderName = HeaderName::from_static("prefer");
const API_KEY: HeaderName = HeaderName::from_static("apikey");

/// REST-backed [`NotificationStore`].
pub struct RestNotificationStore {
    client: Client,
    table_url: Url,
}

impl RestNotificationStore {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let mut base = Url::parse(&config.api_url)
            .map_err(|e| Error::config(format!("invalid API URL '{}': {e}", config.api_url)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let table_url = base
            .join(TABLE_PATH)
            .map_err(|e| Error::config(format!("invalid API URL '{}': {e}", config.api_url)))?;

        let token = config.access_token.as_deref().unwrap_or(&config.api_key);
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .default_headers(build_headers(&config.api_key, token)?)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, table_url })
    }

    fn endpoint(&self, filters: &[(&str, &str)]) -> Url {
        table_url_with(&self.table_url, filters)
    }

    async fn send(&self, request: reqwest::RequestBuilder, op: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::store(format!("{op} request failed: {e}")))?;
        check_status(response, op).await
    }
}

fn build_headers(api_key: &str, token: &str) -> Result<HeaderMap> {
    let value = |raw: String| {
        HeaderValue::from_str(&raw).map_err(|_| Error::config("credentials contain invalid characters"))
    };

    let mut headers = HeaderMap::new();
    headers.insert(API_KEY, value(api_key.to_string())?);
    headers.insert(AUTHORIZATION, value(format!("Bearer {token}"))?);
    Ok(headers)
}

fn table_url_with(table_url: &Url, filters: &[(&str, &str)]) -> Url {
    let mut url = table_url.clone();
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in filters {
            pairs.append_pair(key, value);
        }
    }
    url
}

async fn check_status(response: Response, op: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!("{} failed: {} - {}", op, status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Unauthorized(format!("{status} - {body}")))
        }
        _ => Err(Error::store(format!("{op} failed: {status} - {body}"))),
    }
}

/// Total from a `Content-Range` header such as `0-4/5` or `*/0`.
fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.parse().ok()
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl NotificationStore for RestNotificationStore {
    async fn list(&self, user_id: &str) -> Result<Vec<Notification>> {
        let user = eq(user_id);
        let url = self.endpoint(&[
            ("select", "*"),
            ("user_id", &user),
            ("order", "created_at.desc"),
        ]);

        let response = self.send(self.client.get(url), "list").await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::store(format!("list response failed: {e}")))?;
        let notifications: Vec<Notification> = serde_json::from_slice(&body)?;

        debug!(count = notifications.len(), "Listed notifications");
        Ok(notifications)
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let user = eq(user_id);
        let url = self.endpoint(&[
            ("select", "id"),
            ("user_id", &user),
            ("is_read", "eq.false"),
        ]);

        let request = self
            .client
            .head(url)
            .header(PREFER, "count=exact");
        let response = self.send(request, "unread count").await?;

        response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| Error::store("unread count response has no usable Content-Range"))
    }

    async fn mark_read(&self, id: &NotificationId, user_id: &str) -> Result<()> {
        let (id_filter, user) = (eq(id.as_str()), eq(user_id));
        let url = self.endpoint(&[("id", &id_filter), ("user_id", &user)]);

        let request = self
            .client
            .patch(url)
            .header(PREFER, "return=representation")
            .json(&json!({ "is_read": true }));
        let response = self.send(request, "mark read").await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::store(format!("mark read response failed: {e}")))?;
        let updated: Vec<serde_json::Value> = serde_json::from_slice(&body)?;

        // The row filter includes the owner, so nothing updated means the id
        // is unknown or belongs to someone else.
        if updated.is_empty() {
            return Err(Error::not_found("notification", id.as_str()));
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<()> {
        let user = eq(user_id);
        let url = self.endpoint(&[("user_id", &user), ("is_read", "eq.false")]);

        let request = self
            .client
            .patch(url)
            .header(PREFER, "return=minimal")
            .json(&json!({ "is_read": true }));
        self.send(request, "mark all read").await?;

        debug!(user_id, "Marked all notifications read");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notification_sync::SyncConfig;

    fn config(api_url: &str) -> AppConfig {
        AppConfig {
            api_url: api_url.to_string(),
            api_key: "anon-key".to_string(),
            access_token: None,
            user_id: None,
            http_timeout_secs: 5,
            log_dir: None,
            sync: SyncConfig::default(),
        }
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-4/5"), Some(5));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range(" 0-24/3573 "), Some(3573));
        assert_eq!(parse_content_range("0-4/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_table_url() {
        let store = RestNotificationStore::new(&config("https://example.supabase.co")).unwrap();
        assert_eq!(
            store.table_url.as_str(),
            "https://example.supabase.co/rest/v1/notifications"
        );

        let store =
            RestNotificationStore::new(&config("https://proxy.local/platform")).unwrap();
        assert_eq!(
            store.table_url.as_str(),
            "https://proxy.local/platform/rest/v1/notifications"
        );
    }

    #[test]
    fn test_endpoint_filters() {
        let store = RestNotificationStore::new(&config("https://example.supabase.co")).unwrap();
        let url = store.endpoint(&[("user_id", "eq.user 1"), ("order", "created_at.desc")]);
        assert_eq!(
            url.as_str(),
            "https://example.supabase.co/rest/v1/notifications?user_id=eq.user+1&order=created_at.desc"
        );
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = RestNotificationStore::new(&config("not a url")).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_headers_fall_back_to_api_key() {
        let headers = build_headers("anon-key", "anon-key").unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer anon-key");

        assert!(build_headers("bad\nkey", "token").is_err());
    }
}
