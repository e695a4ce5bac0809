// packages/engine/src/analysis/http_provider.rs
//! HTTP JSON analysis provider
//!
//! POSTs each [`AnalysisRequest`] as JSON to a configured endpoint and expects
//! an [`AnalysisResult`] back. Status mapping:
//!
//! - `2xx` → parsed result
//! - `429` → `RateLimited`
//! - `5xx` and connection failures → transient provider error
//! - other `4xx` and malformed bodies → permanent provider error

use super::provider::{AnalysisError, AnalysisProvider, AnalysisRequest, AnalysisResult};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Analysis provider backed by an HTTP endpoint
pub struct HttpJsonProvider {
    endpoint: Uri,
    api_key: Option<String>,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpJsonProvider {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self> {
        let endpoint: Uri = endpoint
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid provider endpoint {}: {}", endpoint, e)))?;
        if endpoint.scheme_str() != Some("http") {
            return Err(EngineError::Config(format!(
                "provider endpoint {} must use http://",
                endpoint
            )));
        }

        let http_client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            endpoint,
            api_key,
            http_client,
        })
    }

    async fn send(&self, method: Method, body: Bytes) -> std::result::Result<(StatusCode, Bytes), AnalysisError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| AnalysisError::permanent(format!("request build error: {}", e)))?;

        let response = self
            .http_client
            .request(request)
            .await
            .map_err(|e| AnalysisError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AnalysisError::transient(format!("response body error: {}", e)))?
            .to_bytes();

        Ok((status, body))
    }
}

fn classify_status(status: StatusCode, body: &[u8]) -> AnalysisError {
    let detail = String::from_utf8_lossy(body);
    let message = format!("{} {}", status.as_u16(), detail.trim());
    if status == StatusCode::TOO_MANY_REQUESTS {
        AnalysisError::RateLimited
    } else if status.is_server_error() {
        AnalysisError::transient(message)
    } else {
        AnalysisError::permanent(message)
    }
}

#[async_trait]
impl AnalysisProvider for HttpJsonProvider {
    fn name(&self) -> &str {
        "http-json"
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResult, AnalysisError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| AnalysisError::permanent(format!("encode error: {}", e)))?;

        debug!(batch = %request.batch_id, "POST {} ({} events)", self.endpoint, request.events.len());
        let (status, body) = self.send(Method::POST, Bytes::from(body)).await?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_slice(&body)
            .map_err(|e| AnalysisError::permanent(format!("malformed analysis result: {}", e)))
    }

    async fn health_check(&self) -> std::result::Result<(), AnalysisError> {
        let (status, body) = self.send(Method::GET, Bytes::new()).await?;
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(classify_status(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Serves the given status codes in order, then repeats the last one
    async fn scripted_server(statuses: Vec<u16>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(statuses);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let hits = Arc::clone(&hits);
                let statuses = Arc::clone(&statuses);
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        let status = statuses[n.min(statuses.len() - 1)];
                        let body = if status == 200 {
                            r#"{"risk_score":0.9,"classification":"port_scan","recommendation":"Block source"}"#
                        } else {
                            "unavailable"
                        };
                        async move {
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            batch_id: "b-1".to_string(),
            events: vec![],
        }
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(HttpJsonProvider::new("ftp://example", None).is_err());
        assert!(HttpJsonProvider::new("not a uri", None).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, b""),
            AnalysisError::RateLimited
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, b"").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, b"").is_transient());
    }

    #[tokio::test]
    async fn test_analyze_maps_statuses() {
        let addr = scripted_server(vec![503, 429, 200]).await;
        let provider = HttpJsonProvider::new(&format!("http://{}/analyze", addr), None).unwrap();

        let first = provider.analyze(&request()).await.unwrap_err();
        assert!(first.is_transient());
        assert!(matches!(
            provider.analyze(&request()).await,
            Err(AnalysisError::RateLimited)
        ));

        let result = provider.analyze(&request()).await.unwrap();
        assert_eq!(result.classification, "port_scan");
        assert!(provider.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = HttpJsonProvider::new(&format!("http://{}/analyze", addr), None).unwrap();
        let err = provider.analyze(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
