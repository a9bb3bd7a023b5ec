//! Metrics relay.
//!
//! Exposes kubelet cAdvisor metrics without handing scrapers node
//! credentials. Requests look like `/api/v1/nodes/<ip>:<port>/...`; the
//! port and trailing path are ignored and the request is forwarded to
//! `https://<ip>:10250/metrics/cadvisor` with the service account token
//! attached. Kubelets serve self-signed certificates on their node IPs,
//! so upstream certificate validation is disabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use log::{debug, info, warn};
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::RelayError;
use crate::types::KUBELET_PORT;

const CADVISOR_PATH: &str = "/metrics/cadvisor";
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_ORIGIN_HOST: &str = "x-origin-host";

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Node address taken from a relay path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub address: String,
    /// Caller-supplied port; kept for logging, never used upstream.
    pub port: String,
}

impl NodeTarget {
    /// Parses `/api/v1/nodes/<address>:<port>[/...]`.
    pub fn from_path(path: &str) -> Result<Self, RelayError> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 5 {
            return Err(RelayError::BadPath(format!("{path}: too few segments")));
        }
        let parts: Vec<&str> = segments[4].split(':').collect();
        match parts.as_slice() {
            [address, port] if !address.is_empty() => Ok(Self {
                address: address.to_string(),
                port: port.to_string(),
            }),
            _ => Err(RelayError::BadPath(format!(
                "{path}: expected <ip>:<port>, got {:?}",
                segments[4]
            ))),
        }
    }

    pub fn origin_host(&self) -> String {
        format!("{}:{}", self.address, KUBELET_PORT)
    }

    pub fn upstream_url(&self, query: Option<&str>) -> Result<Url, RelayError> {
        let mut url = Url::parse(&format!("https://{}{}", self.origin_host(), CADVISOR_PATH))
            .map_err(|e| RelayError::Target(format!("{}: {}", self.address, e)))?;
        url.set_query(query);
        Ok(url)
    }
}

/// Source of the bearer token presented to kubelets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenReader: Send + Sync {
    async fn read_token(&self) -> Result<String, RelayError>;
}

/// Reads the token file on every call so rotated tokens are picked up.
pub struct FileTokenReader {
    path: String,
}

impl FileTokenReader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenReader for FileTokenReader {
    async fn read_token(&self) -> Result<String, RelayError> {
        let token = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RelayError::Token(format!("{}: {}", self.path, e)))?;
        Ok(token)
    }
}

#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP client used for the kubelet hop.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsUpstream: Send + Sync {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError>;
}

pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetricsUpstream for ReqwestUpstream {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        let response = self
            .client
            .request(req.method, req.url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Clone)]
pub struct RelayState {
    tokens: Arc<dyn TokenReader>,
    upstream: Arc<dyn MetricsUpstream>,
}

impl RelayState {
    pub fn new(tokens: impl TokenReader + 'static, upstream: impl MetricsUpstream + 'static) -> Self {
        Self {
            tokens: Arc::new(tokens),
            upstream: Arc::new(upstream),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/api/v1/nodes/", any(proxy_node_metrics))
        .route("/api/v1/nodes/*rest", any(proxy_node_metrics))
        .with_state(state)
}

/// Serves the relay until `shutdown` flips.
pub async fn serve(config: &Config, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let state = RelayState::new(
        FileTokenReader::new(config.token_path.clone()),
        ReqwestUpstream::new(config.upstream_timeout())?,
    );
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Starting HTTP server on {}", config.listen_addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn proxy_node_metrics(
    State(state): State<RelayState>,
    request: Request,
) -> Result<Response, RelayError> {
    let (parts, body) = request.into_parts();
    let target = NodeTarget::from_path(parts.uri.path())?;
    let url = target.upstream_url(parts.uri.query())?;
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| RelayError::Body(e.to_string()))?;

    let token = state.tokens.read_token().await.map_err(|e| {
        warn!("Token read failed: {}", e);
        e
    })?;
    let headers = upstream_headers(&parts.headers, &target, &token)?;

    debug!(
        "Relaying {} {} (caller port {}) to {}",
        parts.method, parts.uri, target.port, url
    );
    let upstream = state
        .upstream
        .send(UpstreamRequest {
            method: parts.method,
            url,
            headers,
            body,
        })
        .await
        .map_err(|e| {
            warn!("Upstream {} failed: {}", target.origin_host(), e);
            e
        })?;

    let mut response = (upstream.status, Body::from(upstream.body)).into_response();
    *response.headers_mut() = strip_hop_by_hop(upstream.headers);
    Ok(response)
}

fn upstream_headers(
    inbound: &HeaderMap,
    target: &NodeTarget,
    token: &str,
) -> Result<HeaderMap, RelayError> {
    let mut headers = strip_hop_by_hop(inbound.clone());
    headers.remove(header::HOST);

    if let Some(host) = inbound.get(header::HOST) {
        headers.append(HeaderName::from_static(X_FORWARDED_HOST), host.clone());
    }
    let origin = HeaderValue::from_str(&target.origin_host())
        .map_err(|e| RelayError::Target(e.to_string()))?;
    headers.append(HeaderName::from_static(X_ORIGIN_HOST), origin);

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
        .map_err(|_| RelayError::Token("token is not a valid header value".into()))?;
    headers.insert(header::AUTHORIZATION, bearer);
    Ok(headers)
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header(header::HOST, "relay.monitoring:31112")
            .header(header::AUTHORIZATION, "Bearer caller")
            .header(header::ACCEPT, "text/plain")
            .body(Body::empty())
            .unwrap()
    }

    fn token(value: &'static str) -> MockTokenReader {
        let mut tokens = MockTokenReader::new();
        tokens
            .expect_read_token()
            .returning(move || Ok(value.to_string()));
        tokens
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn parses_node_paths() {
        assert_eq!(
            NodeTarget::from_path("/api/v1/nodes/10.0.0.5:31112/anything").unwrap(),
            NodeTarget {
                address: "10.0.0.5".into(),
                port: "31112".into(),
            }
        );
        assert!(NodeTarget::from_path("/api/v1/nodes/10.0.0.5:31112").is_ok());
        for bad in [
            "/api/v1/nodes",
            "/api/v1/nodes/bad",
            "/api/v1/nodes/",
            "/api/v1/nodes/10.0.0.5/metrics",
            "/api/v1/nodes/a:b:c/metrics",
            "/api/v1/nodes/:10250/metrics",
        ] {
            assert!(
                matches!(NodeTarget::from_path(bad), Err(RelayError::BadPath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn upstream_url_ignores_caller_port() {
        let target = NodeTarget::from_path("/api/v1/nodes/10.0.0.5:31112/x").unwrap();
        assert_eq!(
            target.upstream_url(None).unwrap().as_str(),
            "https://10.0.0.5:10250/metrics/cadvisor"
        );
        assert_eq!(
            target.upstream_url(Some("timeout=5s")).unwrap().as_str(),
            "https://10.0.0.5:10250/metrics/cadvisor?timeout=5s"
        );
    }

    #[tokio::test]
    async fn forwards_to_cadvisor_with_token() {
        let mut upstream = MockMetricsUpstream::new();
        upstream
            .expect_send()
            .withf(|req| {
                req.method == Method::GET
                    && req.url.as_str() == "https://10.0.0.5:10250/metrics/cadvisor"
                    && req.headers[header::AUTHORIZATION] == "Bearer sa-token"
                    && req.headers[X_FORWARDED_HOST] == "relay.monitoring:31112"
                    && req.headers[X_ORIGIN_HOST] == "10.0.0.5:10250"
                    && req.headers[header::ACCEPT] == "text/plain"
                    && !req.headers.contains_key(header::HOST)
            })
            .times(1)
            .returning(|_| {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
                Ok(UpstreamResponse {
                    status: StatusCode::OK,
                    headers,
                    body: Bytes::from_static(b"container_cpu_usage_seconds_total 1\n"),
                })
            });
        let app = router(RelayState::new(token("sa-token\n"), upstream));

        let response = app
            .oneshot(request("/api/v1/nodes/10.0.0.5:31112/anything"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert!(!response.headers().contains_key(header::CONNECTION));
        assert_eq!(
            body_string(response).await,
            "container_cpu_usage_seconds_total 1\n"
        );
    }

    #[tokio::test]
    async fn malformed_path_is_rejected_before_upstream() {
        let mut tokens = MockTokenReader::new();
        tokens.expect_read_token().never();
        let mut upstream = MockMetricsUpstream::new();
        upstream.expect_send().never();
        let app = router(RelayState::new(tokens, upstream));

        for uri in ["/api/v1/nodes/bad", "/api/v1/nodes/", "/api/v1/nodes/10.0.0.5/metrics"] {
            let response = app.clone().oneshot(request(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn token_failure_is_a_server_error() {
        let mut tokens = MockTokenReader::new();
        tokens
            .expect_read_token()
            .returning(|| Err(RelayError::Token("permission denied".into())));
        let mut upstream = MockMetricsUpstream::new();
        upstream.expect_send().never();
        let app = router(RelayState::new(tokens, upstream));

        let response = app
            .oneshot(request("/api/v1/nodes/10.0.0.5:31112/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.contains("permission denied"));
    }

    #[tokio::test]
    async fn upstream_status_is_relayed() {
        let mut upstream = MockMetricsUpstream::new();
        upstream.expect_send().returning(|_| {
            Ok(UpstreamResponse {
                status: StatusCode::UNAUTHORIZED,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"Unauthorized"),
            })
        });
        let app = router(RelayState::new(token("expired"), upstream));

        let response = app
            .oneshot(request("/api/v1/nodes/10.0.0.7:1/metrics/cadvisor"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Unauthorized");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let mut upstream = MockMetricsUpstream::new();
        upstream
            .expect_send()
            .returning(|_| Err(RelayError::Upstream("connection refused".into())));
        let app = router(RelayState::new(token("t"), upstream));

        let response = app
            .oneshot(request("/api/v1/nodes/10.0.0.7:1/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn file_token_is_read_on_every_call() {
        let path = std::env::temp_dir().join(format!("relay-token-{}", std::process::id()));
        let reader = FileTokenReader::new(path.to_string_lossy().to_string());

        tokio::fs::write(&path, "first\n").await.unwrap();
        assert_eq!(reader.read_token().await.unwrap(), "first\n");
        tokio::fs::write(&path, "second").await.unwrap();
        assert_eq!(reader.read_token().await.unwrap(), "second");
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(matches!(
            reader.read_token().await,
            Err(RelayError::Token(_))
        ));
    }
}
