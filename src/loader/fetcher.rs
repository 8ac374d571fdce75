//! Resource fetching
//!
//! The loader fetches remote resources through [`ResourceFetcher`].
//! [`HttpFetcher`] is the reqwest implementation: a plain `GET` of the
//! request's source URL.

use crate::shared::error::{CoreError, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// What to load
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Identity used for deduplication and caching
    pub item_id: String,
    /// Where to fetch it from, e.g. a URL
    pub source: String,
}

impl LoadRequest {
    /// Create a request
    pub fn new(item_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            source: source.into(),
        }
    }
}

/// Fetches the bytes of a remote resource
#[async_trait]
pub trait ResourceFetcher: Send + Sync + std::fmt::Debug {
    /// Fetch one resource
    async fn fetch(&self, request: &LoadRequest) -> Result<Bytes>;
}

/// [`ResourceFetcher`] over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Fetcher with a default client
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetcher with a preconfigured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &LoadRequest) -> Result<Bytes> {
        let response = self
            .client
            .get(&request.source)
            .send()
            .await
            .map_err(|e| TransportError::from(e).into_core(&request.item_id))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::transient(format!(
                "{} returned {}",
                request.source, status
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::not_found(request.source.clone()));
        }
        if !status.is_success() {
            return Err(CoreError::Rejected {
                message: format!("{} returned {}", request.source, status),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| TransportError::from(e).into_core(&request.item_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/1.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new();
        let request = LoadRequest::new("img1", format!("{}/img/1.png", server.uri()));
        let bytes = fetcher.fetch(&request).await.unwrap();
        assert_eq!(bytes.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new();
        let fetch = |p: &str| LoadRequest::new("x", format!("{}{}", server.uri(), p));

        assert!(matches!(
            fetcher.fetch(&fetch("/missing")).await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            fetcher.fetch(&fetch("/busy")).await,
            Err(CoreError::TransientNetwork { .. })
        ));
        assert!(matches!(
            fetcher.fetch(&fetch("/forbidden")).await,
            Err(CoreError::Rejected { .. })
        ));
    }
}
