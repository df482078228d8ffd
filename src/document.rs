//! The persisted JSON document shared with the admin UI.
//!
//! The admin collaborator rewrites this file at any time; the gateway only
//! reads it. Numeric fields are accepted either as JSON numbers or as
//! numeric strings because the UI posts form values verbatim.

use crate::groups::GroupMembers;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub containers: Vec<BackendRecord>,

    /// Display order for the admin UI
    #[serde(default)]
    pub order: Vec<String>,

    #[serde(default)]
    pub groups: Vec<GroupRecord>,

    /// Display order for the admin UI
    #[serde(default)]
    pub group_order: Vec<String>,

    #[serde(default)]
    pub schedules: Vec<ScheduleRecord>,

    #[serde(default)]
    pub api_keys: ApiKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecord {
    /// Docker container name, or `name:vmid@node` for a Proxmox LXC guest
    pub name: String,

    /// Virtual host routed to this backend
    pub host: String,

    /// Upstream base URL, e.g. `http://whoami:80`
    pub url: String,

    #[serde(default)]
    pub active: bool,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub idle_timeout: Option<u64>,

    /// When the backend was last switched to active, epoch milliseconds
    #[serde(default, deserialize_with = "lenient_epoch_millis")]
    pub activated_at: Option<i64>,
}

impl BackendRecord {
    pub fn new(name: &str, host: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            url: url.to_string(),
            active: true,
            idle_timeout: None,
            activated_at: None,
        }
    }

    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout = Some(secs);
        self
    }

    /// Idle timeout, with unset or zero meaning `default_secs`
    pub fn idle_timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(non_zero_or(self.idle_timeout, default_secs))
    }

    pub fn activated_at_ms(&self) -> i64 {
        self.activated_at.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub name: String,

    /// One backend name or an ordered list of them
    #[serde(default)]
    pub container: GroupMembers,

    #[serde(default)]
    pub active: bool,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub idle_timeout: Option<u64>,
}

impl GroupRecord {
    pub fn idle_timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(non_zero_or(self.idle_timeout, default_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Container,
    Group,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,

    pub target_type: TargetType,

    pub target: String,

    #[serde(default)]
    pub timers: Vec<TimerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecord {
    /// Weekdays, 0 = Sunday through 6 = Saturday
    #[serde(default, deserialize_with = "lenient_days")]
    pub days: Vec<u8>,

    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub stop_time: String,

    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub pve: Option<PveCredentials>,
}

/// Proxmox VE API token credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PveCredentials {
    #[serde(default)]
    pub hostname: String,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub port: Option<u64>,

    #[serde(default)]
    pub node: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub token_id: String,

    #[serde(default)]
    pub token: String,
}

impl PveCredentials {
    /// All fields needed to talk to the API are present
    pub fn is_complete(&self) -> bool {
        [&self.hostname, &self.node, &self.user, &self.token_id, &self.token]
            .iter()
            .all(|field| !field.trim().is_empty())
    }
}

impl std::fmt::Debug for PveCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PveCredentials")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("node", &self.node)
            .field("user", &self.user)
            .field("token_id", &self.token_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Document {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Load the document, writing an empty one first when none exists yet.
    ///
    /// Returns the document and whether it was freshly created.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> Result<(Self, bool), DocumentError> {
        let path = path.as_ref();
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }

        let io_err = |source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let document = Document::default();
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, json).map_err(io_err)?;
        info!(path = %path.display(), "Wrote default document");
        Ok((document, true))
    }
}

fn non_zero_or(value: Option<u64>, default: u64) -> u64 {
    match value {
        Some(v) if v > 0 => v,
        _ => default,
    }
}

fn value_to_u64<E: de::Error>(value: &Value) -> Result<Option<u64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| E::custom(format!("expected a non-negative number, got {}", n))),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| E::custom(format!("expected a number, got \"{}\"", s))),
        other => Err(E::custom(format!("expected a number, got {}", other))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    value_to_u64(&value.unwrap_or(Value::Null))
}

fn lenient_epoch_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Ok(Some(ms));
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.timestamp_millis()))
                .map_err(|_| de::Error::custom(format!("invalid timestamp \"{}\"", s)))
        }
        Some(other) => Err(de::Error::custom(format!("invalid timestamp {}", other))),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(de::Error::custom(format!("expected an id, got {}", other))),
    }
}

fn lenient_days<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut days = Vec::with_capacity(values.len());
    for value in &values {
        match value_to_u64::<D::Error>(value)? {
            Some(day) if day <= 6 => days.push(day as u8),
            Some(day) => return Err(de::Error::custom(format!("weekday out of range: {}", day))),
            None => {}
        }
    }
    Ok(days)
}
