//! HTTP binding of the external write API.
//!
//! Maps each translated write onto a REST call against the legacy system:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | INSERT | `POST   {base}/{entity}` with `{"id": ..., ...fields}` |
//! | UPDATE | `PATCH  {base}/{entity}/{id}` with the changed fields |
//! | DELETE | `DELETE {base}/{entity}/{id}` |
//!
//! Every request carries an `Idempotency-Key` header so the legacy side can
//! drop replays.

use crate::error::{Result, SyncQueueError};
use crate::external::{BoxFuture, ExternalApi, ExternalError};
use crate::item::Operation;
use crate::mapper::ExternalWrite;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const IDEMPOTENCY_KEY: &str = "idempotency-key";
const MAX_LOG_BODY_CHARS: usize = 512;

/// `reqwest`-based [`ExternalApi`].
#[derive(Debug, Clone)]
pub struct HttpExternalApi {
    client: reqwest::Client,
    base_url: Url,
    headers: HeaderMap,
}

impl HttpExternalApi {
    /// Create a client for the legacy API rooted at `base_url`.
    ///
    /// `timeout` bounds each request at the transport level; the processor
    /// applies its own per-call timeout on top.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncQueueError::Config(format!("Invalid external API URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncQueueError::Config(format!(
                "External API URL '{}' cannot be a base",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncQueueError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client,
            base_url,
            headers,
        })
    }

    /// Authenticate every request with `Authorization: Bearer {token}`.
    pub fn with_bearer_token(mut self, token: &str) -> Result<Self> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncQueueError::Config("Invalid access token format".to_string()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    fn request_parts(&self, write: &ExternalWrite) -> std::result::Result<(Method, Url, Option<Value>), ExternalError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ExternalError::Validation(format!("cannot extend URL {}", self.base_url)))?;
            segments.pop_if_empty().push(&write.entity);
            if write.operation != Operation::Insert {
                segments.push(&write.external_id);
            }
        }

        let (method, body) = match write.operation {
            Operation::Insert => {
                let mut fields = write.fields.clone();
                fields
                    .entry("id".to_string())
                    .or_insert_with(|| Value::String(write.external_id.clone()));
                (Method::POST, Some(Value::Object(fields)))
            }
            Operation::Update => (Method::PATCH, Some(Value::Object(write.fields.clone()))),
            Operation::Delete => (Method::DELETE, None),
        };

        Ok((method, url, body))
    }

    async fn send(&self, write: ExternalWrite) -> std::result::Result<(), ExternalError> {
        let (method, url, body) = self.request_parts(&write)?;
        let key = HeaderValue::from_str(&write.idempotency_key())
            .map_err(|e| ExternalError::Validation(format!("invalid idempotency key: {}", e)))?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(self.headers.clone())
            .header(IDEMPOTENCY_KEY, key);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExternalError::Transient(format!("{} {}: {}", method, url, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(%method, %url, %status, sequence = write.sequence, "External write applied");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!(%method, %url, %status, body = %preview, "External write rejected");
        Err(ExternalError::from_status(status.as_u16(), preview))
    }
}

impl ExternalApi for HttpExternalApi {
    fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()> {
        Box::pin(self.send(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(operation: Operation) -> ExternalWrite {
        ExternalWrite {
            sequence: 9,
            entity: "Listing".into(),
            external_id: "L 1".into(),
            operation,
            fields: json!({"Name": "Loft"}).as_object().cloned().unwrap(),
        }
    }

    fn api() -> HttpExternalApi {
        HttpExternalApi::new("https://legacy.example.com/api/v2/", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_insert_posts_to_collection() {
        let (method, url, body) = api().request_parts(&write(Operation::Insert)).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url.as_str(), "https://legacy.example.com/api/v2/Listing");
        let body = body.unwrap();
        assert_eq!(body["Name"], "Loft");
        assert_eq!(body["id"], "L 1");
    }

    #[test]
    fn test_update_patches_resource() {
        let (method, url, body) = api().request_parts(&write(Operation::Update)).unwrap();
        assert_eq!(method, Method::PATCH);
        assert_eq!(url.as_str(), "https://legacy.example.com/api/v2/Listing/L%201");
        assert!(body.unwrap().get("id").is_none());
    }

    #[test]
    fn test_delete_has_no_body() {
        let (method, url, body) = api().request_parts(&write(Operation::Delete)).unwrap();
        assert_eq!(method, Method::DELETE);
        assert!(url.path().ends_with("/Listing/L%201"));
        assert!(body.is_none());
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpExternalApi::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncQueueError::Config(_)));

        let err = HttpExternalApi::new("mailto:ops@example.com", Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("cannot be a base"));
    }

    #[test]
    fn test_bearer_token_validation() {
        assert!(api().with_bearer_token("abc123").is_ok());
        assert!(api().with_bearer_token("bad\ntoken").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments
        let api = HttpExternalApi::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        let err = api.write(write(Operation::Update)).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
