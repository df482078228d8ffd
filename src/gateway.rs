use crate::driver::SharedControlPlane;
use crate::error::{json_error_response, waiting_page_response, GatewayErrorCode};
use crate::lifecycle::{now_millis, LifecycleManager};
use crate::pool::{upstream_uri, ConnectionPool};
use crate::registry::{normalize_host, ManagedBackend, Registry, Snapshot};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Built-in page served while a backend starts
pub const DEFAULT_WAITING_PAGE: &str = include_str!("../assets/waiting.html");

/// Maximum size of a backend's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

const UPGRADE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every gateway connection
pub struct GatewayContext {
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub plane: SharedControlPlane,
    pub pool: Arc<ConnectionPool>,
    pub waiting_page: Bytes,
    /// Readiness path probed during the cold-start grace window
    pub health_path: String,
}

impl GatewayContext {
    pub fn new(
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        plane: SharedControlPlane,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            plane,
            pool,
            waiting_page: Bytes::from_static(DEFAULT_WAITING_PAGE.as_bytes()),
            health_path: "/health".to_string(),
        }
    }

    pub fn with_waiting_page(mut self, page: Bytes) -> Self {
        self.waiting_page = page;
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    fn waiting_page(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        waiting_page_response(self.waiting_page.clone())
    }

    /// Stamp activity after a successful upstream response
    fn record_access(&self, name: &str) {
        let now = now_millis();
        self.lifecycle.touch(name, now);
        if self.lifecycle.should_log_access(name, now) {
            info!(backend = name, "Backend accessed, timeout reset");
        }
    }
}

/// Read the waiting page override, falling back to the built-in page
pub fn load_waiting_page(path: Option<&str>) -> anyhow::Result<Bytes> {
    match path {
        Some(path) => {
            let page = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read waiting page {}: {}", path, e))?;
            Ok(Bytes::from(page))
        }
        None => Ok(Bytes::from_static(DEFAULT_WAITING_PAGE.as_bytes())),
    }
}

/// The host-routed reverse proxy
pub struct Gateway {
    bind_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Gateway {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<GatewayContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Spinnerr Proxy running");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, ctx).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, ctx: Arc<GatewayContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request.
///
/// Activity is stamped as soon as the host resolves. A cold backend gets
/// the waiting page at once while its start runs in the background; upstream
/// failures also fall back to the waiting page.
pub async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(host) = extract_host(&req) else {
        return Ok(json_error_response(
            GatewayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    let snapshot = ctx.registry.snapshot();
    let Some(backend) = snapshot.resolve_host(&host) else {
        debug!(host = %host, "No backend routed for host");
        let mut response = json_error_response(GatewayErrorCode::UnknownHost, "Container not found");
        if is_upgrade_request(&req) {
            response
                .headers_mut()
                .insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
        }
        return Ok(response);
    };

    let name = backend.name().to_string();
    let now = now_millis();
    ctx.lifecycle.touch(&name, now);
    debug!(backend = %name, method = %req.method(), uri = %req.uri(), "Incoming request");

    if !ctx.plane.is_running(&backend.id).await {
        activate(&ctx, &snapshot, backend);
        return Ok(ctx.waiting_page());
    }

    let url = backend.record.url.clone();
    if ctx.lifecycle.in_grace_window(&name, now) && !ctx.pool.probe(&url, &ctx.health_path).await {
        debug!(backend = %name, "Backend not ready yet");
        return Ok(ctx.waiting_page());
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, name, url).await;
    }

    match ctx.pool.send_request(req, &url).await {
        Ok(response) => {
            ctx.record_access(&name);
            Ok(response)
        }
        Err(e) => {
            if ctx.lifecycle.in_grace_window(&name, now_millis()) {
                debug!(backend = %name, error = %e, "Backend still starting");
            } else {
                warn!(backend = %name, url = %url, error = %e, "Proxy error");
            }
            Ok(ctx.waiting_page())
        }
    }
}

/// Dispatch starts for a cold backend, or for its whole group
fn activate(ctx: &GatewayContext, snapshot: &Snapshot, backend: &ManagedBackend) {
    match snapshot.group_of(backend.name()) {
        Some(group) => {
            let mut dispatched = 0;
            for member in snapshot.members(group).filter(|m| m.record.active) {
                if ctx
                    .lifecycle
                    .dispatch_start(Arc::clone(&ctx.plane), member.name(), member.id.clone())
                {
                    dispatched += 1;
                }
            }
            if dispatched > 0 {
                info!(backend = %backend.name(), group = %group.name, dispatched, "Starting group");
            }
        }
        None if backend.record.active => {
            if ctx
                .lifecycle
                .dispatch_start(Arc::clone(&ctx.plane), backend.name(), backend.id.clone())
            {
                info!(backend = %backend.name(), "Starting backend");
            }
        }
        None => {
            debug!(backend = %backend.name(), "Backend inactive, not starting");
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Normalized request host from `Host`, or the URI authority for HTTP/2
fn extract_host(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let host = normalize_host(raw);
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Keeps log lines and lookups free of injected content
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '[' | ']' | ':'))
    {
        return None;
    }
    Some(host)
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request with every original header, `Host` included
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse a response head; returns status, headers and the head length
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers, head_end))
}

/// Response head relayed to the client; headers hyper cannot carry are dropped
fn upgrade_response(
    status: StatusCode,
    headers: &[(String, String)],
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let switching = status == StatusCode::SWITCHING_PROTOCOLS;
    let mut response = Response::builder().status(status);
    for (header, value) in headers {
        let Ok(name) = HeaderName::from_bytes(header.as_bytes()) else {
            continue;
        };
        if switching && (name == CONTENT_LENGTH || name == TRANSFER_ENCODING) {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name, hv);
        }
    }
    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .ok()
}

/// Upgrades are tunneled over plain TCP only
fn is_tls_url(url: &str) -> bool {
    upstream_uri(url, "/")
        .map(|uri| uri.scheme_str() == Some("https"))
        .unwrap_or(false)
}

/// `host:port` to dial for a plain http backend url
fn upstream_addr(url: &str) -> Option<String> {
    let uri = upstream_uri(url, "/").ok()?;
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Tunnel a WebSocket (or other HTTP/1.1 upgrade) to a warm backend
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    name: String,
    url: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if is_tls_url(&url) {
        debug!(backend = %name, url = %url, "TLS upstream upgrades are not supported");
        return Ok(ctx.waiting_page());
    }

    let Some(addr) = upstream_addr(&url) else {
        error!(backend = %name, url = %url, "Invalid backend url for upgrade");
        return Ok(ctx.waiting_page());
    };

    let connect = tokio::time::timeout(UPGRADE_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;
    let mut backend_stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(backend = %name, addr = %addr, error = %e, "Upgrade connect failed");
            return Ok(ctx.waiting_page());
        }
        Err(_) => {
            debug!(backend = %name, addr = %addr, "Upgrade connect timed out");
            return Ok(ctx.waiting_page());
        }
    };

    if let Err(e) = backend_stream.write_all(&build_upgrade_request(&req)).await {
        warn!(backend = %name, error = %e, "Failed to send upgrade request");
        return Ok(ctx.waiting_page());
    }

    let head = match read_upgrade_head(&mut backend_stream).await {
        Ok(head) => head,
        Err(e) => {
            warn!(backend = %name, error = %e, "Failed to read upgrade response");
            return Ok(ctx.waiting_page());
        }
    };
    let Some((status, response_headers, head_len)) = parse_upgrade_response(&head) else {
        warn!(backend = %name, "Invalid upgrade response from backend");
        return Ok(ctx.waiting_page());
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(backend = %name, status = %status, "Backend declined upgrade");
        return Ok(upgrade_response(status, &response_headers).unwrap_or_else(|| ctx.waiting_page()));
    }

    let Some(response) = upgrade_response(status, &response_headers) else {
        warn!(backend = %name, "Unusable upgrade response from backend");
        return Ok(ctx.waiting_page());
    };

    ctx.record_access(&name);

    // Frames the backend sent along with its 101
    let leftover = head[head_len..].to_vec();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tunnel(upgraded, backend_stream, leftover, &name).await;
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "Failed to upgrade client connection");
            }
        }
        ctx.lifecycle.touch(&name, now_millis());
    });

    Ok(response)
}

async fn tunnel(client: Upgraded, mut backend: TcpStream, leftover: Vec<u8>, name: &str) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(backend = name, error = %e, "Tunnel closed before it started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(backend = name, to_backend, to_client, "Tunnel closed");
        }
        Err(e) => {
            debug!(backend = name, error = %e, "Tunnel closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request_keeps_host() {
        let req = Request::builder()
            .uri("/socket?room=1")
            .header("Host", "app.example")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req)).unwrap();

        assert!(raw.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("host: app.example\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
        assert_eq!(raw.matches("host:").count(), 1);
    }

    #[test]
    fn test_parse_upgrade_response_with_trailing_frame() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x02hi";
        let (status, headers, head_len) = parse_upgrade_response(data).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(&data[head_len..], b"\x81\x02hi");
    }

    #[test]
    fn test_parse_upgrade_response_incomplete() {
        assert!(parse_upgrade_response(b"HTTP/1.1 101 Switching").is_none());
    }

    #[test]
    fn test_is_tls_url() {
        assert!(is_tls_url("https://a"));
        assert!(is_tls_url("https://a:8443"));
        assert!(!is_tls_url("http://a"));
        assert!(!is_tls_url(""));
    }

    #[test]
    fn test_upgrade_response_drops_invalid_headers() {
        let headers = vec![
            ("Upgrade".to_string(), "websocket".to_string()),
            ("Bad Header".to_string(), "x".to_string()),
            ("Content-Length".to_string(), "0".to_string()),
        ];
        let response = upgrade_response(StatusCode::SWITCHING_PROTOCOLS, &headers).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().len(), 1);
        assert_eq!(response.headers()["upgrade"], "websocket");
    }

    #[test]
    fn test_declined_upgrade_keeps_content_length() {
        let headers = vec![
            ("Content-Length".to_string(), "0".to_string()),
            ("X-Bad\u{7f}".to_string(), "y".to_string()),
        ];
        let response = upgrade_response(StatusCode::FORBIDDEN, &headers).unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["content-length"], "0");
        assert_eq!(response.headers().len(), 1);
    }

    #[test]
    fn test_upstream_addr() {
        assert_eq!(upstream_addr("http://a:8080").as_deref(), Some("a:8080"));
        assert_eq!(upstream_addr("http://a").as_deref(), Some("a:80"));
        assert_eq!(upstream_addr("").as_deref(), None);
    }

    #[test]
    fn test_load_waiting_page() {
        let builtin = load_waiting_page(None).unwrap();
        assert!(!builtin.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waiting.html");
        std::fs::write(&path, "<p>hold on</p>").unwrap();
        let custom = load_waiting_page(path.to_str()).unwrap();
        assert_eq!(&custom[..], b"<p>hold on</p>");

        assert!(load_waiting_page(Some("/nonexistent/waiting.html")).is_err());
    }
}
