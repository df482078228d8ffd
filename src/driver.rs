//! Control-plane abstraction over Docker containers and Proxmox LXC guests

use crate::config::ProxmoxConfig;
use crate::docker::DockerDriver;
use crate::document::PveCredentials;
use crate::proxmox::ProxmoxDriver;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identity of a backend on its control plane, parsed once at load time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendId {
    /// Docker container, addressed by name
    Docker(String),
    /// Proxmox LXC guest, written as `name:vmid@node`
    Lxc { name: String, vmid: u32, node: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("backend name is empty")]
    Empty,
    #[error("'{0}' is missing the '{1}' separator")]
    MissingSeparator(String, char),
    #[error("'{0}' has an invalid vmid")]
    InvalidVmid(String),
    #[error("'{0}' has no node")]
    MissingNode(String),
}

impl BackendId {
    /// Parse a backend name; names containing both `:` and `@` are LXC guests
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.trim().is_empty() {
            return Err(IdError::Empty);
        }
        if raw.contains(':') && raw.contains('@') {
            return Self::parse_lxc(raw);
        }
        Ok(BackendId::Docker(raw.to_string()))
    }

    /// Extract `(vmid, node)` from a synthetic `name:vmid@node` id
    pub fn parse_lxc(raw: &str) -> Result<Self, IdError> {
        let (name, rest) = raw
            .rsplit_once(':')
            .ok_or_else(|| IdError::MissingSeparator(raw.to_string(), ':'))?;
        let (vmid, node) = rest
            .split_once('@')
            .ok_or_else(|| IdError::MissingSeparator(raw.to_string(), '@'))?;
        let vmid = vmid
            .trim()
            .parse::<u32>()
            .map_err(|_| IdError::InvalidVmid(raw.to_string()))?;
        let node = node.trim();
        if node.is_empty() {
            return Err(IdError::MissingNode(raw.to_string()));
        }

        Ok(BackendId::Lxc {
            name: name.to_string(),
            vmid,
            node: node.to_string(),
        })
    }

    pub fn lxc(name: &str, vmid: u32, node: &str) -> Self {
        BackendId::Lxc {
            name: name.to_string(),
            vmid,
            node: node.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendId::Docker(_) => "docker",
            BackendId::Lxc { .. } => "lxc",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::Docker(name) => f.write_str(name),
            BackendId::Lxc { name, vmid, node } => write!(f, "{}:{}@{}", name, vmid, node),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no control plane configured for {0}")]
    NotConfigured(String),
    #[error("control plane did not answer within {0:?}")]
    RequestTimeout(Duration),
    #[error("{id} did not become {expected} after {attempts} checks")]
    Timeout {
        id: String,
        expected: &'static str,
        attempts: u32,
    },
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("proxmox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("proxmox returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected control plane response: {0}")]
    Malformed(String),
}

/// Outcome of an idempotent start or stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A command was issued and the backend reached the target state
    Changed,
    /// The backend was already in the target state; nothing was sent
    Unchanged,
}

/// Query and command interface of a control plane.
///
/// Queries never fail loudly: an unreachable control plane answers "not
/// running". Start and stop are no-ops when the backend is already in the
/// target state.
pub trait ControlPlane: Send + Sync {
    fn is_running<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, bool>;

    /// Every backend id the control plane knows about
    fn list_all(&self) -> BoxFuture<'_, BTreeSet<String>>;

    /// When the backend was last started, epoch milliseconds
    fn started_at<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<i64, DriverError>>;

    fn start<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>>;

    fn stop<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>>;
}

pub type SharedControlPlane = Arc<dyn ControlPlane>;

/// Run `check` up to `attempts` times, sleeping `interval` between tries.
///
/// Returns the attempt that succeeded. Dropping the future cancels the poll.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut check: F) -> Option<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if check().await {
            return Some(attempt);
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}

/// Check many backends with at most `max_concurrent` queries in flight
pub async fn check_multiple(
    plane: &dyn ControlPlane,
    ids: &[BackendId],
    max_concurrent: usize,
) -> HashMap<BackendId, bool> {
    futures::stream::iter(ids.iter().cloned())
        .map(|id| async move {
            let running = plane.is_running(&id).await;
            (id, running)
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await
}

/// The production control plane: Docker plus an optional Proxmox endpoint.
///
/// Proxmox credentials live in the watched document, so the Proxmox driver
/// is swapped in place whenever they change.
pub struct Driver {
    docker: DockerDriver,
    proxmox: RwLock<Option<Arc<ProxmoxDriver>>>,
    proxmox_config: ProxmoxConfig,
}

impl Driver {
    pub fn new(docker: DockerDriver, proxmox_config: ProxmoxConfig) -> Self {
        Self {
            docker,
            proxmox: RwLock::new(None),
            proxmox_config,
        }
    }

    pub fn proxmox(&self) -> Option<Arc<ProxmoxDriver>> {
        self.proxmox.read().clone()
    }

    /// Install (or clear) Proxmox credentials; returns true when the driver changed
    pub fn set_credentials(&self, credentials: Option<&PveCredentials>) -> bool {
        let credentials = credentials.filter(|c| c.is_complete());
        let current = self.proxmox();

        match (current, credentials) {
            (None, None) => false,
            (Some(_), None) => {
                *self.proxmox.write() = None;
                info!("Proxmox credentials removed, LXC backends disabled");
                true
            }
            (Some(existing), Some(creds)) if existing.credentials() == creds => false,
            (_, Some(creds)) => match ProxmoxDriver::new(creds, &self.proxmox_config) {
                Ok(driver) => {
                    info!(host = %creds.hostname, node = %creds.node, "Proxmox control plane configured");
                    *self.proxmox.write() = Some(Arc::new(driver));
                    true
                }
                Err(e) => {
                    error!(error = %e, "Failed to build Proxmox client, LXC backends disabled");
                    *self.proxmox.write() = None;
                    true
                }
            },
        }
    }
}

impl ControlPlane for Driver {
    fn is_running<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, bool> {
        async move {
            match id {
                BackendId::Docker(name) => self.docker.is_running(name).await,
                BackendId::Lxc { vmid, node, .. } => match self.proxmox() {
                    Some(pve) => pve.is_running(*vmid, node).await,
                    None => {
                        debug!(backend = %id, "No Proxmox credentials, treating as not running");
                        false
                    }
                },
            }
        }
        .boxed()
    }

    fn list_all(&self) -> BoxFuture<'_, BTreeSet<String>> {
        async move {
            let mut names = self.docker.list_names().await;
            if let Some(pve) = self.proxmox() {
                match pve.list_guests().await {
                    Ok(ids) => names.extend(ids),
                    Err(e) => warn!(error = %e, "Failed to list LXC guests"),
                }
            }
            names
        }
        .boxed()
    }

    fn started_at<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<i64, DriverError>> {
        async move {
            match id {
                BackendId::Docker(name) => self.docker.started_at(name).await,
                BackendId::Lxc { vmid, node, .. } => {
                    let pve = self
                        .proxmox()
                        .ok_or_else(|| DriverError::NotConfigured(id.to_string()))?;
                    pve.started_at(*vmid, node).await
                }
            }
        }
        .boxed()
    }

    fn start<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>> {
        async move {
            match id {
                BackendId::Docker(name) => self.docker.start(name).await,
                BackendId::Lxc { vmid, node, .. } => {
                    let pve = self
                        .proxmox()
                        .ok_or_else(|| DriverError::NotConfigured(id.to_string()))?;
                    pve.start(*vmid, node).await
                }
            }
        }
        .boxed()
    }

    fn stop<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>> {
        async move {
            match id {
                BackendId::Docker(name) => self.docker.stop(name).await,
                BackendId::Lxc { vmid, node, .. } => {
                    let pve = self
                        .proxmox()
                        .ok_or_else(|| DriverError::NotConfigured(id.to_string()))?;
                    pve.stop(*vmid, node).await
                }
            }
        }
        .boxed()
    }
}
