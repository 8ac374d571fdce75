//! HTTP transport
//!
//! Delivers operations as `POST {server}/sync/{kind}` with the operation id in
//! an `Idempotency-Key` header, and probes with `GET {server}/health`.
//! Reachability is inferred from request outcomes and published as
//! `Connected`/`Disconnected` signals. Push events come from whatever
//! subscription layer the embedding application runs; it forwards them
//! through [`HttpTransport::push`].

use super::{SyncRequest, SyncResponse, Transport, TransportSignal};
use crate::shared::error::{ConflictReason, TransportError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Transport`] over plain HTTP with reqwest
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    server_url: String,
    signals: broadcast::Sender<TransportSignal>,
    reachable: AtomicBool,
}

impl HttpTransport {
    /// Create a transport for `server_url`
    pub fn new(server_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Rejected(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, server_url))
    }

    /// Create a transport with a preconfigured client
    pub fn with_client(client: Client, server_url: impl Into<String>) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            signals,
            reachable: AtomicBool::new(false),
        }
    }

    /// Get the full URL for an API endpoint
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    /// Forward a server push event to subscribers
    pub fn push(&self, event: impl Into<String>, payload: serde_json::Value) {
        let _ = self.signals.send(TransportSignal::Push {
            event: event.into(),
            payload,
        });
    }

    fn mark_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        if was != reachable {
            let signal = if reachable {
                TransportSignal::Connected
            } else {
                TransportSignal::Disconnected
            };
            tracing::info!("[HttpTransport] {:?}", signal);
            let _ = self.signals.send(signal);
        }
    }

    fn observe<T>(&self, result: &Result<T, TransportError>) {
        match result {
            Err(TransportError::Transient(_)) | Err(TransportError::Timeout(_)) => {
                self.mark_reachable(false)
            }
            _ => self.mark_reachable(true),
        }
    }

    async fn classify(response: reqwest::Response) -> Result<SyncResponse, TransportError> {
        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            if body.is_empty() {
                return Ok(SyncResponse::default());
            }
            return serde_json::from_slice(&body)
                .map_err(|e| TransportError::Rejected(format!("malformed response body: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => {
                let server_revision = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("revision").and_then(|r| r.as_u64()));
                TransportError::Conflict(ConflictReason::ConcurrentModification { server_revision })
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                TransportError::Conflict(ConflictReason::EntityMissing)
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                TransportError::Transient(format!("{} - {}", status, body))
            }
            s if s.is_server_error() => TransportError::Transient(format!("{} - {}", status, body)),
            _ => TransportError::Rejected(format!("{} - {}", status, body)),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let url = self.api_url(&format!("/sync/{}", request.kind.as_str()));
        tracing::debug!(
            "[HttpTransport] POST {} op={} attempt={}",
            url,
            request.operation_id,
            request.attempt
        );

        let result = match self
            .client
            .post(&url)
            .header("Idempotency-Key", request.operation_id.to_string())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => Self::classify(response).await,
            Err(e) => Err(TransportError::from(e)),
        };
        self.observe(&result);
        result
    }

    async fn ping(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let result = match self.client.get(self.api_url("/health")).send().await {
            Ok(response) if response.status().is_success() => Ok(started.elapsed()),
            Ok(response) if response.status().is_server_error() => Err(TransportError::Transient(
                format!("health check returned {}", response.status()),
            )),
            Ok(response) => Err(TransportError::Rejected(format!(
                "health check returned {}",
                response.status()
            ))),
            Err(e) => Err(TransportError::from(e)),
        };
        self.observe(&result);
        result
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::queue::OperationKind;
    use uuid::Uuid;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(kind: OperationKind) -> SyncRequest {
        SyncRequest {
            operation_id: Uuid::new_v4(),
            kind,
            entity_key: "msg:1".to_string(),
            payload: serde_json::json!({"text": "hi"}),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/update"))
            .and(header_exists("Idempotency-Key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"payload": {"ok": true}, "revision": 4})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        let mut signals = transport.signals();
        let response = transport.send(request(OperationKind::Update)).await.unwrap();

        assert_eq!(response.revision, Some(4));
        assert_eq!(response.payload["ok"], true);
        assert_eq!(signals.try_recv().unwrap(), TransportSignal::Connected);
    }

    #[tokio::test]
    async fn test_conflict_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/delete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sync/update"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(serde_json::json!({"revision": 9})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        assert_eq!(
            transport.send(request(OperationKind::Delete)).await,
            Err(TransportError::Conflict(ConflictReason::EntityMissing))
        );
        assert_eq!(
            transport.send(request(OperationKind::Update)).await,
            Err(TransportError::Conflict(ConflictReason::ConcurrentModification {
                server_revision: Some(9)
            }))
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        let result = transport.send(request(OperationKind::Create)).await;
        assert!(matches!(result, Err(TransportError::Transient(_))));
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        let result = transport.send(request(OperationKind::Create)).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_emits_disconnect() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        transport.mark_reachable(true);
        let mut signals = transport.signals();

        let result = transport.ping().await;
        assert!(result.is_err());
        assert_eq!(signals.try_recv().unwrap(), TransportSignal::Disconnected);
    }

    #[tokio::test]
    async fn test_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/", server.uri())).unwrap();
        assert!(transport.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_push_forwarding() {
        let transport = HttpTransport::new("http://localhost").unwrap();
        let mut signals = transport.signals();
        transport.push("reactions_updated", serde_json::json!({"message_id": "m1"}));
        assert!(matches!(
            signals.try_recv().unwrap(),
            TransportSignal::Push { event, .. } if event == "reactions_updated"
        ));
    }
}
