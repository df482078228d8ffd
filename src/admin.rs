use crate::driver::{check_multiple, BackendId, SharedControlPlane};
use crate::lifecycle::LifecycleManager;
use crate::pool::PoolStats;
use crate::registry::Registry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What the status endpoints read from
pub struct StatusContext {
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub plane: SharedControlPlane,
    pub pool_stats: Option<Arc<PoolStats>>,
    pub max_concurrent_checks: usize,
}

/// Read-only status API on the UI port
pub struct StatusServer {
    bind_addr: SocketAddr,
    ctx: Arc<StatusContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StatusServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<StatusContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Status server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_status_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Status connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept status connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_status_connection<S>(stream: S, ctx: Arc<StatusContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { handle_status_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Status connection error: {}", e))?;

    Ok(())
}

pub async fn handle_status_request<B>(
    req: Request<B>,
    ctx: Arc<StatusContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Status API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/api/status") => json_response(StatusCode::OK, status_json(&ctx).await.to_string()),

        (&Method::GET, "/api/discover") => {
            let names: Vec<String> = ctx.plane.list_all().await.into_iter().collect();
            let body = serde_json::json!({
                "count": names.len(),
                "backends": names,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn status_json(ctx: &StatusContext) -> serde_json::Value {
    let snapshot = ctx.registry.snapshot();
    let ids: Vec<BackendId> = snapshot.backends().iter().map(|b| b.id.clone()).collect();
    let running = check_multiple(ctx.plane.as_ref(), &ids, ctx.max_concurrent_checks).await;

    let backends: Vec<serde_json::Value> = snapshot
        .backends()
        .iter()
        .map(|b| {
            let name = b.name();
            serde_json::json!({
                "name": name,
                "host": b.record.host,
                "kind": b.id.kind(),
                "active": b.record.active,
                "running": running.get(&b.id).copied().unwrap_or(false),
                "group": snapshot.group_of(name).map(|g| g.name.as_str()),
                "lastActivity": ctx.lifecycle.last_activity(name),
                "stopping": ctx.lifecycle.is_stopping(name),
                "starting": ctx.lifecycle.is_starting(name),
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "count": backends.len(),
        "backends": backends,
    });
    if let Some(stats) = &ctx.pool_stats {
        body["pool"] = serde_json::json!({
            "totalRequests": stats.get_total_requests(),
            "probes": stats.get_probes(),
        });
    }
    body
}
