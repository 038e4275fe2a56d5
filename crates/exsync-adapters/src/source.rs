use std::sync::Arc;

use async_trait::async_trait;
use exsync_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::AdapterError;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MATTERS_RESOURCE: &str = "matters";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("http status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid page body: {0}")]
    Decode(String),
}

impl From<FetchError> for TransportError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unauthorized { .. } => Self::Unauthorized,
            FetchError::HttpStatus { status, .. } => Self::Status(status),
            other => Self::Request(other.to_string()),
        }
    }
}

/// A paginated fetch that failed even after one token refresh.
#[derive(Debug, Error)]
#[error("fetching {resource} page {page} failed: {message}")]
pub struct ExternalSourceError {
    pub resource: String,
    pub page: usize,
    pub message: String,
}

/// One page request against the upstream practice-management API.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    async fn get_page(
        &self,
        resource: &str,
        page: usize,
        page_size: usize,
        access_token: &str,
    ) -> Result<JsonValue, TransportError>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current access token, fetching one if none is cached.
    async fn access_token(&self) -> Result<String, AdapterError>;

    /// Discard the current token and obtain a fresh one.
    async fn refresh(&self) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, AdapterError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, AdapterError> {
        Err(AdapterError::Message(
            "static access token cannot be refreshed".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth refresh-token grant with the current access token cached in memory.
#[derive(Debug)]
pub struct OAuthRefreshToken {
    fetcher: HttpFetcher,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    current: RwLock<Option<String>>,
}

impl OAuthRefreshToken {
    pub fn new(
        fetcher: HttpFetcher,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        initial_access_token: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            current: RwLock::new(initial_access_token),
        }
    }
}

#[async_trait]
impl TokenProvider for OAuthRefreshToken {
    async fn access_token(&self) -> Result<String, AdapterError> {
        if let Some(token) = self.current.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, AdapterError> {
        let mut current = self.current.write().await;
        let response = self
            .fetcher
            .post_form(
                &self.token_url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", self.refresh_token.as_str()),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                ],
            )
            .await?;
        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|err| AdapterError::Message(format!("token response: {err}")))?;
        info!("refreshed upstream access token");
        *current = Some(parsed.access_token.clone());
        Ok(parsed.access_token)
    }
}

/// [`SourceTransport`] over the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpSourceTransport {
    fetcher: HttpFetcher,
    base_url: String,
}

impl HttpSourceTransport {
    pub fn new(fetcher: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceTransport for HttpSourceTransport {
    async fn get_page(
        &self,
        resource: &str,
        page: usize,
        page_size: usize,
        access_token: &str,
    ) -> Result<JsonValue, TransportError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), resource);
        let query = [("page", page.to_string()), ("page_size", page_size.to_string())];
        let response = self
            .fetcher
            .get_bytes(&url, &query, Some(access_token))
            .await?;
        serde_json::from_slice(&response.body).map_err(|err| TransportError::Decode(err.to_string()))
    }
}

// Upstream pages arrive either as a bare array or wrapped in an envelope.
fn page_records(body: JsonValue) -> Result<Vec<JsonValue>, TransportError> {
    match body {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => ["value", "data", "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| TransportError::Decode("page object has no record array".to_string())),
        other => Err(TransportError::Decode(format!(
            "expected array or object, got {other}"
        ))),
    }
}

/// Paginated client for the upstream practice-management system.
#[derive(Clone)]
pub struct PracticeSourceClient {
    transport: Arc<dyn SourceTransport>,
    tokens: Arc<dyn TokenProvider>,
    page_size: usize,
}

impl PracticeSourceClient {
    pub fn new(transport: Arc<dyn SourceTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            transport,
            tokens,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every record of `resource`, following pages while each one comes back full.
    ///
    /// A 401 triggers exactly one token refresh and one retry of the same page;
    /// any further failure aborts the whole resource.
    pub async fn fetch_all(&self, resource: &str) -> Result<Vec<JsonValue>, ExternalSourceError> {
        let fail = |page: usize, message: String| ExternalSourceError {
            resource: resource.to_string(),
            page,
            message,
        };

        let mut token = self
            .tokens
            .access_token()
            .await
            .map_err(|err| fail(1, err.to_string()))?;
        let mut records = Vec::new();
        let mut page = 1usize;

        loop {
            let body = match self
                .transport
                .get_page(resource, page, self.page_size, &token)
                .await
            {
                Ok(body) => body,
                Err(TransportError::Unauthorized) => {
                    warn!(resource, page, "access token rejected; refreshing once");
                    token = self
                        .tokens
                        .refresh()
                        .await
                        .map_err(|err| fail(page, err.to_string()))?;
                    self.transport
                        .get_page(resource, page, self.page_size, &token)
                        .await
                        .map_err(|err| fail(page, err.to_string()))?
                }
                Err(err) => return Err(fail(page, err.to_string())),
            };

            let batch = page_records(body).map_err(|err| fail(page, err.to_string()))?;
            let full_page = batch.len() >= self.page_size;
            debug!(resource, page, records = batch.len(), "fetched page");
            records.extend(batch);

            if !full_page {
                break;
            }
            page += 1;
        }

        info!(resource, pages = page, records = records.len(), "fetched resource");
        Ok(records)
    }

    pub async fn fetch_matters(&self) -> Result<Vec<JsonValue>, ExternalSourceError> {
        self.fetch_all(MATTERS_RESOURCE).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<JsonValue, TransportError>>>,
        calls: Mutex<Vec<(usize, String)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<JsonValue, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::default(),
            }
        }

        fn calls(&self) -> Vec<(usize, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceTransport for ScriptedTransport {
        async fn get_page(
            &self,
            _resource: &str,
            page: usize,
            _page_size: usize,
            access_token: &str,
        ) -> Result<JsonValue, TransportError> {
            self.calls.lock().unwrap().push((page, access_token.to_string()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!([])))
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn access_token(&self) -> Result<String, AdapterError> {
            Ok("token-0".to_string())
        }

        async fn refresh(&self) -> Result<String, AdapterError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }
    }

    fn client(transport: Arc<ScriptedTransport>, tokens: Arc<CountingTokens>) -> PracticeSourceClient {
        PracticeSourceClient::new(transport, tokens).with_page_size(2)
    }

    #[tokio::test]
    async fn follows_pages_while_they_are_full() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(json!([{"id": 1}, {"id": 2}])),
            Ok(json!({"value": [{"id": 3}, {"id": 4}]})),
            Ok(json!({"data": [{"id": 5}]})),
        ]));
        let tokens = Arc::new(CountingTokens::default());

        let records = client(transport.clone(), tokens).fetch_matters().await.unwrap();

        assert_eq!(records.len(), 5);
        let pages: Vec<usize> = transport.calls().into_iter().map(|(page, _)| page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_page_after_full_page_ends_pagination() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(json!([{"id": 1}, {"id": 2}])),
            Ok(json!([])),
        ]));
        let records = client(transport.clone(), Arc::new(CountingTokens::default()))
            .fetch_all("contacts")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_and_retries_same_page() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(json!([{"id": 1}, {"id": 2}])),
            Err(TransportError::Unauthorized),
            Ok(json!([{"id": 3}])),
        ]));
        let tokens = Arc::new(CountingTokens::default());

        let records = client(transport.clone(), tokens.clone())
            .fetch_matters()
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.calls(),
            vec![
                (1, "token-0".to_string()),
                (2, "token-0".to_string()),
                (2, "token-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn second_unauthorized_is_an_external_source_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Unauthorized),
            Err(TransportError::Unauthorized),
        ]));
        let tokens = Arc::new(CountingTokens::default());

        let err = client(transport.clone(), tokens.clone())
            .fetch_matters()
            .await
            .unwrap_err();

        assert_eq!(err.resource, "matters");
        assert_eq!(err.page, 1);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn server_errors_are_not_retried_by_the_client() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Status(503))]));
        let err = client(transport.clone(), Arc::new(CountingTokens::default()))
            .fetch_matters()
            .await
            .unwrap_err();
        assert!(err.message.contains("503"));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn static_token_cannot_refresh() {
        let tokens = StaticToken::new("abc");
        assert_eq!(tokens.access_token().await.unwrap(), "abc");
        let err = tokens.refresh().await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn page_envelopes_are_unwrapped() {
        assert_eq!(page_records(json!({"items": [1, 2]})).unwrap().len(), 2);
        assert!(page_records(json!({"count": 0})).is_err());
        assert!(page_records(json!("nope")).is_err());
    }
}
