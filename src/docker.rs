//! Docker control plane for container backends
//!
//! Talks to the engine either through the local socket or through a
//! socket proxy over HTTP. Queries are bounded by a short timeout and
//! resolve to "not running" on any failure.

use crate::config::DockerConfig;
use crate::driver::{DriverError, Transition};
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::models::ContainerState;
use bollard::Docker;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the Docker engine is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerTransport {
    /// Local Unix socket
    Socket(String),
    /// Docker socket proxy reached over HTTP
    HttpProxy(String),
}

impl DockerTransport {
    /// The socket wins when it exists; the proxy URL is the fallback
    pub fn select(config: &DockerConfig) -> Option<Self> {
        if Path::new(&config.socket).exists() {
            return Some(DockerTransport::Socket(config.socket.clone()));
        }
        config
            .proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| DockerTransport::HttpProxy(normalize_proxy_url(url)))
    }
}

/// `tcp://host:port` proxies are plain HTTP endpoints
fn normalize_proxy_url(url: &str) -> String {
    match url.strip_prefix("tcp://") {
        Some(rest) => format!("http://{}", rest),
        None => url.trim_end_matches('/').to_string(),
    }
}

pub struct DockerDriver {
    client: Option<Docker>,
    timeout: Duration,
    stop_grace: Duration,
}

impl DockerDriver {
    /// Build a driver for whichever transport is available.
    ///
    /// Connections are lazy, so this never blocks on the engine. With no
    /// transport every query answers "not running".
    pub fn connect(config: &DockerConfig) -> Self {
        let timeout = config.timeout();
        let stop_grace = Duration::from_secs(config.stop_grace_secs);
        // The client-level timeout must cover a graceful stop; queries are
        // bounded separately by `timeout`.
        let client_timeout = (timeout + stop_grace).as_secs();

        let transport = DockerTransport::select(config);
        let client = match &transport {
            Some(DockerTransport::Socket(path)) => {
                info!(path = %path, "Using Docker socket");
                Docker::connect_with_socket(path, client_timeout, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| warn!(path = %path, error = %e, "Cannot connect to Docker socket"))
                    .ok()
            }
            Some(DockerTransport::HttpProxy(url)) => {
                info!(url = %url, "Using Docker proxy");
                Docker::connect_with_http(url, client_timeout, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| warn!(url = %url, error = %e, "Cannot connect to Docker proxy"))
                    .ok()
            }
            None => {
                warn!(
                    socket = %config.socket,
                    "No Docker socket or proxy found, mount the socket or set DOCKER_PROXY_URL"
                );
                None
            }
        };

        Self {
            client,
            timeout,
            stop_grace,
        }
    }

    /// A driver with no engine behind it
    pub fn disconnected(timeout: Duration) -> Self {
        Self {
            client: None,
            timeout,
            stop_grace: Duration::from_secs(10),
        }
    }

    /// Docker waits `stop_grace` before killing, so a stop may take that long
    /// on top of the request timeout
    pub fn stop_limit(&self) -> Duration {
        self.timeout.saturating_add(self.stop_grace)
    }

    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(DriverError::from),
            Err(_) => Err(DriverError::RequestTimeout(limit)),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DriverError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DriverError::NotConfigured(name.to_string()))?;
        let info = self
            .bounded(self.timeout, client.inspect_container(name, None))
            .await?;
        Ok(info.state)
    }

    /// Check if a container is running
    pub async fn is_running(&self, name: &str) -> bool {
        match self.inspect(name).await {
            Ok(state) => state.and_then(|s| s.running).unwrap_or(false),
            Err(e) => {
                debug!(container = name, error = %e, "Container inspect failed");
                false
            }
        }
    }

    /// Container start time in epoch milliseconds
    pub async fn started_at(&self, name: &str) -> Result<i64, DriverError> {
        let started = self
            .inspect(name)
            .await?
            .and_then(|s| s.started_at)
            .ok_or_else(|| DriverError::Malformed(format!("{} has no start time", name)))?;
        parse_started_at(&started)
    }

    /// Names of all containers, running or not
    pub async fn list_names(&self) -> BTreeSet<String> {
        let Some(client) = self.client.as_ref() else {
            return BTreeSet::new();
        };
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        match self
            .bounded(self.timeout, client.list_containers(Some(options)))
            .await
        {
            Ok(containers) => containers
                .into_iter()
                .flat_map(|c| c.names.unwrap_or_default())
                .map(|name| name.trim_start_matches('/').to_string())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list containers");
                BTreeSet::new()
            }
        }
    }

    pub async fn start(&self, name: &str) -> Result<Transition, DriverError> {
        if self.is_running(name).await {
            debug!(container = name, "Container already running");
            return Ok(Transition::Unchanged);
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DriverError::NotConfigured(name.to_string()))?;

        match self
            .bounded(
                self.timeout,
                client.start_container(name, None::<StartContainerOptions<String>>),
            )
            .await
        {
            Ok(()) => {
                info!(container = name, "Started Docker container");
                Ok(Transition::Changed)
            }
            Err(DriverError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })) => Ok(Transition::Unchanged),
            Err(e) => Err(e),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<Transition, DriverError> {
        if !self.is_running(name).await {
            debug!(container = name, "Container already stopped");
            return Ok(Transition::Unchanged);
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DriverError::NotConfigured(name.to_string()))?;
        let options = StopContainerOptions {
            t: i64::try_from(self.stop_grace.as_secs()).unwrap_or(i64::MAX),
        };

        match self
            .bounded(self.stop_limit(), client.stop_container(name, Some(options)))
            .await
        {
            Ok(()) => {
                info!(container = name, "Stopped Docker container");
                Ok(Transition::Changed)
            }
            Err(DriverError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            })) => {
                debug!(container = name, "Container was already stopped");
                Ok(Transition::Unchanged)
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse Docker's RFC 3339 `StartedAt` into epoch milliseconds
fn parse_started_at(raw: &str) -> Result<i64, DriverError> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| DriverError::Malformed(format!("invalid start time '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_started_at() {
        assert_eq!(
            parse_started_at("2024-01-01T00:00:00Z").unwrap(),
            1_704_067_200_000
        );
        assert_eq!(
            parse_started_at("2024-01-01T00:00:01.123456789Z").unwrap(),
            1_704_067_201_123
        );
        assert!(parse_started_at("yesterday").is_err());
    }

    #[test]
    fn test_normalize_proxy_url() {
        assert_eq!(normalize_proxy_url("tcp://docker-proxy:2375"), "http://docker-proxy:2375");
        assert_eq!(normalize_proxy_url("http://docker-proxy:2375/"), "http://docker-proxy:2375");
    }

    #[test]
    fn test_select_prefers_existing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        std::fs::write(&socket, b"").unwrap();

        let config = DockerConfig {
            socket: socket.to_string_lossy().to_string(),
            proxy_url: Some("tcp://proxy:2375".to_string()),
            ..Default::default()
        };
        assert_eq!(
            DockerTransport::select(&config),
            Some(DockerTransport::Socket(config.socket.clone()))
        );
    }

    #[test]
    fn test_select_falls_back_to_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            socket: dir.path().join("missing.sock").to_string_lossy().to_string(),
            proxy_url: Some("tcp://proxy:2375".to_string()),
            ..Default::default()
        };
        assert_eq!(
            DockerTransport::select(&config),
            Some(DockerTransport::HttpProxy("http://proxy:2375".to_string()))
        );

        let config = DockerConfig {
            proxy_url: None,
            ..config
        };
        assert_eq!(DockerTransport::select(&config), None);
    }

    #[test]
    fn test_stop_limit_includes_grace() {
        let dir = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            socket: dir.path().join("missing.sock").to_string_lossy().to_string(),
            proxy_url: None,
            timeout_secs: 3,
            stop_grace_secs: 10,
        };
        assert_eq!(DockerDriver::connect(&config).stop_limit(), Duration::from_secs(13));

        let config = DockerConfig {
            stop_grace_secs: 0,
            ..config
        };
        assert_eq!(DockerDriver::connect(&config).stop_limit(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_disconnected_driver_is_quiet() {
        let driver = DockerDriver::disconnected(Duration::from_secs(3));

        assert!(!driver.is_running("web").await);
        assert!(driver.list_names().await.is_empty());
        assert!(driver.started_at("web").await.is_err());
        // Already stopped, so nothing is sent
        assert_eq!(driver.stop("web").await.unwrap(), Transition::Unchanged);
        assert!(matches!(
            driver.start("web").await,
            Err(DriverError::NotConfigured(_))
        ));
    }
}
