use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use spinnerr::admin::{StatusContext, StatusServer, PKG_NAME, VERSION};
use spinnerr::config::Config;
use spinnerr::docker::DockerDriver;
use spinnerr::driver::{Driver, SharedControlPlane};
use spinnerr::gateway::{load_waiting_page, Gateway, GatewayContext};
use spinnerr::lifecycle::LifecycleManager;
use spinnerr::pool::{ConnectionPool, PoolConfig};
use spinnerr::reactor::ConfigReactor;
use spinnerr::reaper::IdleReaper;
use spinnerr::registry::{Registry, Snapshot};
use spinnerr::scheduler::Scheduler;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spinnerr=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load settings; the file is optional
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("spinnerr.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control plane
    let driver = Arc::new(Driver::new(DockerDriver::connect(&config.docker), config.proxmox.clone()));
    let plane: SharedControlPlane = driver.clone();

    // Shared state
    let lifecycle = LifecycleManager::new(
        config.lifecycle.start_grace(),
        config.lifecycle.access_log_interval(),
    );
    let registry = Registry::new(Snapshot::empty());

    let reactor = Arc::new(
        ConfigReactor::new(
            config.server.document_path(),
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            config.lifecycle.reload_interval(),
        )
        .with_driver(Arc::clone(&driver)),
    );

    match reactor.load_initial() {
        Ok(result) => info!(
            path = %reactor.path().display(),
            backends = result.added.len(),
            groups = registry.snapshot().groups().len(),
            schedules = registry.snapshot().schedules().len(),
            "Document loaded"
        ),
        Err(e) => error!(
            path = %reactor.path().display(),
            error = %e,
            "Failed to load document, starting with no backends"
        ),
    }

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        ..PoolConfig::default()
    };

    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let pool = Arc::new(ConnectionPool::new(pool_config));
    let waiting_page = load_waiting_page(config.server.waiting_page.as_deref())?;

    let gateway_ctx = Arc::new(
        GatewayContext::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Arc::clone(&plane),
            Arc::clone(&pool),
        )
        .with_waiting_page(waiting_page)
        .with_health_path(config.lifecycle.health_path.clone()),
    );

    // Load TLS configuration if enabled
    let tls_acceptor = if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    // HTTP gateway
    let http_addr = bind_addr(&config.server.bind, config.server.port)?;
    let http_gateway = Gateway::new(http_addr, Arc::clone(&gateway_ctx), shutdown_rx.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_gateway.run().await {
            error!(error = %e, "HTTP gateway error");
        }
    });

    // HTTPS gateway
    let https_port = config.server.https_port();
    let https_handle = match tls_acceptor {
        Some(acceptor) if https_port > 0 => {
            let https_addr = bind_addr(&config.server.bind, https_port)?;
            let https_gateway =
                Gateway::new(https_addr, Arc::clone(&gateway_ctx), shutdown_rx.clone()).with_tls(acceptor);
            Some(tokio::spawn(async move {
                if let Err(e) = https_gateway.run().await {
                    error!(error = %e, "HTTPS gateway error");
                }
            }))
        }
        _ => None,
    };

    // Status server
    let status_handle = match config.server.ui_port {
        Some(ui_port) => {
            let status_addr = bind_addr(&config.server.bind, ui_port)?;
            let status_ctx = Arc::new(StatusContext {
                registry: Arc::clone(&registry),
                lifecycle: Arc::clone(&lifecycle),
                plane: Arc::clone(&plane),
                pool_stats: Some(pool.stats()),
                max_concurrent_checks: config.lifecycle.max_concurrent_checks,
            });
            let status_server = StatusServer::new(status_addr, status_ctx, shutdown_rx.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = status_server.run().await {
                    error!(error = %e, "Status server error");
                }
            }))
        }
        None => None,
    };

    // Background loops
    let reaper = IdleReaper::new(
        Arc::clone(&registry),
        Arc::clone(&lifecycle),
        Arc::clone(&plane),
        &config.lifecycle,
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::clone(&lifecycle),
        Arc::clone(&plane),
        &config.lifecycle,
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let reactor_handle = tokio::spawn(Arc::clone(&reactor).run(shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout); backends are left as they are
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        if let Some(handle) = status_handle {
            let _ = handle.await;
        }
        let _ = reaper_handle.await;
        let _ = scheduler_handle.await;
        let _ = reactor_handle.await;
    })
    .await;

    lifecycle.clear();
    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting Spinnerr");
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        https_port = if https_port > 0 { Some(https_port) } else { None },
        ui_port = config.server.ui_port,
        tls = config.server.tls_enabled(),
        document = %config.server.document,
        "Server configuration"
    );
    info!(
        socket = %config.docker.socket,
        proxy_url = ?config.docker.proxy_url,
        timeout_secs = config.docker.timeout_secs,
        "Docker settings"
    );
    info!(
        reaper_interval_secs = config.lifecycle.reaper_interval_secs,
        reload_interval_ms = config.lifecycle.reload_interval_ms,
        start_grace_secs = config.lifecycle.start_grace_secs,
        default_idle_timeout_secs = config.lifecycle.default_idle_timeout_secs,
        health_path = %config.lifecycle.health_path,
        "Lifecycle settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
