//! Pooled HTTP client for upstream backends
//!
//! Requests are forwarded to the backend's configured url with their
//! original headers, including `Host`.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid upstream url '{0}'")]
    InvalidTarget(String),
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Upper bound for a readiness probe
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    /// Separate client for bodiless probes
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `base_url`, keeping method, path, query and headers
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        base_url: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = upstream_uri(base_url, path)?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        // HTTP/2 clients send the host as :authority only
        if !parts.headers.contains_key(hyper::header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                builder = builder.header(hyper::header::HOST, authority.as_str());
            }
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Whether the backend answers `path` as ready.
    ///
    /// A 2xx is ready; so is a 404, since serving one means the backend is up
    /// but has no health endpoint.
    pub async fn probe(&self, base_url: &str, path: &str) -> bool {
        let Ok(uri) = upstream_uri(base_url, path) else {
            return false;
        };
        let req = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_probe();
        match tokio::time::timeout(self.config.probe_timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                status.is_success() || status == hyper::StatusCode::NOT_FOUND
            }
            _ => false,
        }
    }
}

/// Join a backend url and a request path.
///
/// A path on the backend url is kept as a prefix; a url without a scheme
/// is treated as plain HTTP.
pub fn upstream_uri(base_url: &str, path_and_query: &str) -> Result<Uri, PoolError> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(PoolError::InvalidTarget(base_url.to_string()));
    }
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    let path = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    };

    let uri: Uri = format!("{}{}", base, path)
        .parse()
        .map_err(|_| PoolError::InvalidTarget(base_url.to_string()))?;
    if uri.authority().is_none() {
        return Err(PoolError::InvalidTarget(base_url.to_string()));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_probe();

        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_probes(), 1);
    }

    #[test]
    fn test_upstream_uri() {
        assert_eq!(
            upstream_uri("http://a:80", "/x?y=1").unwrap().to_string(),
            "http://a:80/x?y=1"
        );
        assert_eq!(
            upstream_uri("http://a:80/", "/").unwrap().to_string(),
            "http://a:80/"
        );
        assert_eq!(
            upstream_uri("http://a:80/app", "/health").unwrap().to_string(),
            "http://a:80/app/health"
        );
        assert_eq!(
            upstream_uri("10.0.0.5:8080", "/").unwrap().to_string(),
            "http://10.0.0.5:8080/"
        );
        assert!(upstream_uri("", "/").is_err());
        assert!(upstream_uri("http://bad host", "/").is_err());
    }

    #[tokio::test]
    async fn test_probe_unreachable_backend() {
        let pool = ConnectionPool::new(PoolConfig {
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        });

        assert!(!pool.probe("http://127.0.0.1:1", "/health").await);
        assert_eq!(pool.stats().get_probes(), 1);
    }
}
