//! Proxmox VE control plane for LXC guests
//!
//! Uses API tokens over HTTPS. Proxmox hosts usually run with self-signed
//! certificates, so verification is off. Start and stop return as soon as
//! the task is queued; the driver then polls guest status until it matches.

use crate::config::ProxmoxConfig;
use crate::document::PveCredentials;
use crate::driver::{poll_until, DriverError, Transition};
use crate::lifecycle::duration_millis;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_API_PORT: u64 = 8006;

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

/// `GET /nodes/{node}/lxc/{vmid}/status/current`
#[derive(Debug, Clone, Deserialize)]
pub struct GuestStatus {
    pub status: String,
    /// Seconds since the guest booted, 0 when stopped
    #[serde(default)]
    pub uptime: u64,
}

impl GuestStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// One entry of `GET /nodes/{node}/lxc`
#[derive(Debug, Deserialize)]
struct GuestEntry {
    #[serde(default)]
    name: Option<String>,
    vmid: Value,
}

pub struct ProxmoxDriver {
    client: reqwest::Client,
    base_url: String,
    credentials: PveCredentials,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl ProxmoxDriver {
    pub fn new(credentials: &PveCredentials, config: &ProxmoxConfig) -> Result<Self, DriverError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&auth_header(credentials))
            .map_err(|_| DriverError::Malformed("token contains invalid characters".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: api_base_url(credentials),
            credentials: credentials.clone(),
            poll_attempts: config.poll_attempts,
            poll_interval: config.poll_interval(),
        })
    }

    pub fn credentials(&self) -> &PveCredentials {
        &self.credentials
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, DriverError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| DriverError::Malformed(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn post(&self, path: &str) -> Result<(), DriverError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    pub async fn status(&self, vmid: u32, node: &str) -> Result<GuestStatus, DriverError> {
        self.get(&format!("/nodes/{}/lxc/{}/status/current", node, vmid))
            .await
    }

    pub async fn is_running(&self, vmid: u32, node: &str) -> bool {
        match self.status(vmid, node).await {
            Ok(status) => status.is_running(),
            Err(e) => {
                debug!(vmid, node, error = %e, "LXC status check failed");
                false
            }
        }
    }

    /// Boot time derived from the guest's uptime, epoch milliseconds
    pub async fn started_at(&self, vmid: u32, node: &str) -> Result<i64, DriverError> {
        let status = self.status(vmid, node).await?;
        if !status.is_running() {
            return Err(DriverError::Malformed(format!(
                "guest {} on {} is {}",
                vmid, node, status.status
            )));
        }
        let now = chrono::Utc::now().timestamp_millis();
        Ok(now.saturating_sub(duration_millis(Duration::from_secs(status.uptime))))
    }

    /// Synthetic `name:vmid@node` ids of every guest on the configured node
    pub async fn list_guests(&self) -> Result<Vec<String>, DriverError> {
        let node = &self.credentials.node;
        let entries: Vec<GuestEntry> = self.get(&format!("/nodes/{}/lxc", node)).await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let vmid = match &entry.vmid {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                }?;
                let name = entry.name.unwrap_or_else(|| vmid.to_string());
                Some(format!("{}:{}@{}", name, vmid, node))
            })
            .collect())
    }

    pub async fn start(&self, vmid: u32, node: &str) -> Result<Transition, DriverError> {
        self.transition(vmid, node, true).await
    }

    pub async fn stop(&self, vmid: u32, node: &str) -> Result<Transition, DriverError> {
        self.transition(vmid, node, false).await
    }

    async fn transition(&self, vmid: u32, node: &str, want_running: bool) -> Result<Transition, DriverError> {
        let (action, expected) = if want_running {
            ("start", "running")
        } else {
            ("stop", "stopped")
        };

        if self.is_running(vmid, node).await == want_running {
            debug!(vmid, node, "LXC guest already {}", expected);
            return Ok(Transition::Unchanged);
        }

        self.post(&format!("/nodes/{}/lxc/{}/status/{}", node, vmid, action))
            .await?;
        debug!(vmid, node, action, "LXC task queued, waiting for guest");

        let confirmed = poll_until(self.poll_attempts, self.poll_interval, move || async move {
            self.is_running(vmid, node).await == want_running
        })
        .await;

        match confirmed {
            Some(attempt) => {
                info!(vmid, node, attempt, "LXC guest {}", expected);
                Ok(Transition::Changed)
            }
            None => {
                warn!(vmid, node, attempts = self.poll_attempts, "LXC guest did not become {}", expected);
                Err(DriverError::Timeout {
                    id: format!("{}@{}", vmid, node),
                    expected,
                    attempts: self.poll_attempts,
                })
            }
        }
    }
}

/// `https://host:port/api2/json`, tolerating a scheme or port in the hostname
fn api_base_url(credentials: &PveCredentials) -> String {
    let host = credentials.hostname.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');

    if host.contains(':') && !host.starts_with('[') {
        return format!("https://{}/api2/json", host);
    }
    let port = credentials.port.filter(|p| *p > 0).unwrap_or(DEFAULT_API_PORT);
    format!("https://{}:{}/api2/json", host, port)
}

fn auth_header(credentials: &PveCredentials) -> String {
    format!(
        "PVEAPIToken={}!{}={}",
        credentials.user.trim(),
        credentials.token_id.trim(),
        credentials.token.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> PveCredentials {
        PveCredentials {
            hostname: "pve.lan".to_string(),
            port: None,
            node: "pve1".to_string(),
            user: "root@pam".to_string(),
            token_id: "spinnerr".to_string(),
            token: "abc-123".to_string(),
        }
    }

    #[test]
    fn test_api_base_url() {
        let mut c = creds();
        assert_eq!(api_base_url(&c), "https://pve.lan:8006/api2/json");

        c.port = Some(443);
        assert_eq!(api_base_url(&c), "https://pve.lan:443/api2/json");

        c.hostname = "https://pve.lan/".to_string();
        assert_eq!(api_base_url(&c), "https://pve.lan:443/api2/json");

        c.hostname = "10.0.0.5:8007".to_string();
        assert_eq!(api_base_url(&c), "https://10.0.0.5:8007/api2/json");
    }

    #[test]
    fn test_auth_header() {
        assert_eq!(auth_header(&creds()), "PVEAPIToken=root@pam!spinnerr=abc-123");
    }

    #[test]
    fn test_status_parsing() {
        let body = r#"{"data":{"status":"running","uptime":120,"vmid":105,"name":"web"}}"#;
        let parsed: ApiEnvelope<GuestStatus> = serde_json::from_str(body).unwrap();
        assert!(parsed.data.is_running());
        assert_eq!(parsed.data.uptime, 120);

        let body = r#"{"data":{"status":"stopped"}}"#;
        let parsed: ApiEnvelope<GuestStatus> = serde_json::from_str(body).unwrap();
        assert!(!parsed.data.is_running());
        assert_eq!(parsed.data.uptime, 0);
    }

    #[test]
    fn test_guest_list_parsing() {
        let body = r#"{"data":[{"vmid":"105","name":"web"},{"vmid":106}]}"#;
        let parsed: ApiEnvelope<Vec<GuestEntry>> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].name.as_deref(), Some("web"));
        assert!(parsed.data[1].name.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_reads_as_stopped() {
        let mut c = creds();
        c.hostname = "127.0.0.1".to_string();
        c.port = Some(1);
        let config = ProxmoxConfig {
            timeout_secs: 1,
            poll_attempts: 2,
            poll_interval_ms: 10,
        };
        let driver = ProxmoxDriver::new(&c, &config).unwrap();

        assert!(!driver.is_running(105, "pve1").await);
        assert!(driver.started_at(105, "pve1").await.is_err());
        // Already in the target state, so no command is sent
        assert_eq!(driver.stop(105, "pve1").await.unwrap(), Transition::Unchanged);
        assert!(driver.start(105, "pve1").await.is_err());
    }
}
