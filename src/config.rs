use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings for the gateway.
///
/// Loaded from an optional TOML file and then overridden from the
/// environment (`PORT`, `UI_PORT`, `DOCKER_PROXY_URL`, `DOCKER_SOCKET`,
/// `SPINNERR_DOCUMENT`). Backends, groups, schedules and credentials are not
/// part of this file; they live in the JSON document watched by the reactor.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub proxmox: ProxmoxConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Gateway port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port of the read-only status server, disabled when unset
    pub ui_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path of the JSON document holding backends, groups and schedules
    #[serde(default = "default_document_path")]
    pub document: String,

    /// Optional HTML file served instead of the built-in waiting page
    pub waiting_page: Option<String>,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// HTTPS port (default: 443 when TLS is enabled)
    pub tls_port: Option<u16>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Maximum idle upstream connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(443)
    }

    pub fn document_path(&self) -> PathBuf {
        PathBuf::from(&self.document)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            ui_port: None,
            bind: default_bind_address(),
            document: default_document_path(),
            waiting_page: None,
            tls: false,
            tls_port: None,
            tls_cert: None,
            tls_key: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Docker control-plane selection.
///
/// The local socket wins when it exists; otherwise the proxy URL is used.
#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// Docker socket proxy, e.g. `tcp://docker-proxy:2375`
    pub proxy_url: Option<String>,

    #[serde(default = "default_docker_timeout")]
    pub timeout_secs: u64,

    /// Seconds Docker waits after SIGTERM before killing a container
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl DockerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            proxy_url: None,
            timeout_secs: default_docker_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxmoxConfig {
    #[serde(default = "default_proxmox_timeout")]
    pub timeout_secs: u64,

    /// How many times start/stop poll the guest state before giving up
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl ProxmoxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxmox_timeout(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_reload_interval")]
    pub reload_interval_ms: u64,

    /// Window after a dispatched start during which upstream errors are quiet
    #[serde(default = "default_start_grace")]
    pub start_grace_secs: u64,

    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,

    /// Idle timeout used when a backend or group leaves it unset
    #[serde(default = "default_idle_timeout")]
    pub default_idle_timeout_secs: u64,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_access_log_interval")]
    pub access_log_interval_secs: u64,
}

impl LifecycleConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }

    pub fn access_log_interval(&self) -> Duration {
        Duration::from_secs(self.access_log_interval_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: default_reaper_interval(),
            reload_interval_ms: default_reload_interval(),
            start_grace_secs: default_start_grace(),
            max_concurrent_checks: default_max_concurrent_checks(),
            default_idle_timeout_secs: default_idle_timeout(),
            health_path: default_health_path(),
            access_log_interval_secs: default_access_log_interval(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_document_path() -> String {
    "/app/config/config.json".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_docker_timeout() -> u64 {
    3
}

fn default_stop_grace() -> u64 {
    10
}

fn default_proxmox_timeout() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reaper_interval() -> u64 {
    10
}

fn default_reload_interval() -> u64 {
    500
}

fn default_start_grace() -> u64 {
    30
}

fn default_max_concurrent_checks() -> usize {
    10
}

pub(crate) fn default_idle_timeout() -> u64 {
    60
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_access_log_interval() -> u64 {
    5
}

impl Config {
    /// Load settings from `path`, falling back to defaults when the file is
    /// absent, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(port) = lookup("UI_PORT") {
            let port = port.trim();
            self.server.ui_port = if port.is_empty() {
                None
            } else {
                Some(
                    port.parse()
                        .map_err(|e| anyhow::anyhow!("Invalid UI_PORT '{}': {}", port, e))?,
                )
            };
        }
        if let Some(url) = lookup("DOCKER_PROXY_URL").filter(|u| !u.trim().is_empty()) {
            self.docker.proxy_url = Some(url.trim().to_string());
        }
        if let Some(socket) = lookup("DOCKER_SOCKET").filter(|s| !s.trim().is_empty()) {
            self.docker.socket = socket.trim().to_string();
        }
        if let Some(document) = lookup("SPINNERR_DOCUMENT").filter(|d| !d.trim().is_empty()) {
            self.server.document = document.trim().to_string();
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.ui_port.is_some_and(|p| p == self.server.port) {
            errors.push(format!(
                "server.ui_port must differ from server.port ({})",
                self.server.port
            ));
        }
        if self.lifecycle.reaper_interval_secs == 0 {
            errors.push("lifecycle.reaper_interval_secs must be greater than 0".to_string());
        }
        if self.lifecycle.reload_interval_ms == 0 {
            errors.push("lifecycle.reload_interval_ms must be greater than 0".to_string());
        }
        if self.lifecycle.max_concurrent_checks == 0 {
            errors.push("lifecycle.max_concurrent_checks must be greater than 0".to_string());
        }
        if self.proxmox.poll_attempts == 0 {
            errors.push("proxmox.poll_attempts must be greater than 0".to_string());
        }
        if !self.lifecycle.health_path.starts_with('/') {
            errors.push(format!(
                "lifecycle.health_path must start with '/': {}",
                self.lifecycle.health_path
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
ui_port = 8081
bind = "127.0.0.1"
document = "/tmp/spinnerr.json"

[docker]
proxy_url = "tcp://docker-proxy:2375"

[proxmox]
poll_attempts = 10

[lifecycle]
reaper_interval_secs = 5
health_path = "/healthz"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.ui_port, Some(8081));
        assert_eq!(config.server.document_path(), PathBuf::from("/tmp/spinnerr.json"));
        assert_eq!(config.docker.proxy_url.as_deref(), Some("tcp://docker-proxy:2375"));
        assert_eq!(config.docker.timeout(), Duration::from_secs(3));
        assert_eq!(config.proxmox.poll_attempts, 10);
        assert_eq!(config.lifecycle.reaper_interval(), Duration::from_secs(5));
        assert_eq!(config.lifecycle.health_path, "/healthz");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.ui_port, None);
        assert_eq!(config.docker.socket, "/var/run/docker.sock");
        assert_eq!(config.docker.timeout_secs, 3);
        assert_eq!(config.proxmox.timeout_secs, 5);
        assert_eq!(config.proxmox.poll_attempts, 30);
        assert_eq!(config.proxmox.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.lifecycle.reaper_interval_secs, 10);
        assert_eq!(config.lifecycle.reload_interval(), Duration::from_millis(500));
        assert_eq!(config.lifecycle.start_grace(), Duration::from_secs(30));
        assert_eq!(config.lifecycle.max_concurrent_checks, 10);
        assert_eq!(config.lifecycle.default_idle_timeout_secs, 60);
        assert_eq!(config.lifecycle.access_log_interval(), Duration::from_secs(5));
        assert_eq!(config.server.https_port(), 0);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "8000"),
            ("UI_PORT", "8001"),
            ("DOCKER_PROXY_URL", "tcp://proxy:2375"),
            ("SPINNERR_DOCUMENT", "/data/config.json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.ui_port, Some(8001));
        assert_eq!(config.docker.proxy_url.as_deref(), Some("tcp://proxy:2375"));
        assert_eq!(config.server.document, "/data/config.json");
        assert_eq!(config.docker.socket, "/var/run/docker.sock");
    }

    #[test]
    fn test_invalid_port_env_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "PORT").then(|| "eighty".to_string()));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid PORT"));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = Config::default();
        config.server.ui_port = Some(config.server.port);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("ui_port must differ"));
    }

    #[test]
    fn test_tls_port() {
        let mut server = ServerConfig::default();
        server.tls = true;
        assert_eq!(server.https_port(), 443);
        server.tls_port = Some(8443);
        assert_eq!(server.https_port(), 8443);
        assert!(!server.has_tls_files());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.lifecycle.health_path, "/health");
    }
}
