//! Live view of the document used for routing and lifecycle decisions
//!
//! A [`Snapshot`] is built once per reload and never mutated; the reactor
//! swaps in a new one atomically so readers always see a consistent set of
//! backends, groups and schedules.

use crate::document::{BackendRecord, Document, GroupRecord, PveCredentials, ScheduleRecord};
use crate::driver::BackendId;
use crate::groups::{self, GroupConflict};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A backend record together with its parsed control-plane identity
#[derive(Debug, Clone)]
pub struct ManagedBackend {
    pub record: BackendRecord,
    pub id: BackendId,
}

impl ManagedBackend {
    pub fn name(&self) -> &str {
        &self.record.name
    }
}

#[derive(Debug, Default)]
pub struct Snapshot {
    backends: Vec<ManagedBackend>,
    by_name: HashMap<String, usize>,
    by_host: HashMap<String, usize>,
    groups: Vec<GroupRecord>,
    schedules: Vec<ScheduleRecord>,
    credentials: Option<PveCredentials>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot, rejecting overlapping active group membership.
    ///
    /// Records with a malformed id are skipped with a warning. When two
    /// records share a name or a host, the first one wins.
    pub fn from_document(document: &Document) -> Result<Self, GroupConflict> {
        groups::validate(&document.groups)?;

        let mut snapshot = Snapshot {
            groups: document.groups.clone(),
            schedules: document.schedules.clone(),
            credentials: document.api_keys.pve.clone(),
            ..Default::default()
        };

        for record in &document.containers {
            let id = match BackendId::parse(&record.name) {
                Ok(id) => id,
                Err(e) => {
                    warn!(backend = %record.name, error = %e, "Skipping backend with invalid name");
                    continue;
                }
            };
            if snapshot.by_name.contains_key(&record.name) {
                warn!(backend = %record.name, "Duplicate backend name, keeping the first");
                continue;
            }

            let index = snapshot.backends.len();
            let host = normalize_host(&record.host);
            if !host.is_empty() {
                if let Some(&existing) = snapshot.by_host.get(&host) {
                    warn!(
                        host = %host,
                        backend = %record.name,
                        routed_to = %snapshot.backends[existing].record.name,
                        "Host already routed to another backend"
                    );
                } else {
                    snapshot.by_host.insert(host, index);
                }
            }
            snapshot.by_name.insert(record.name.clone(), index);
            snapshot.backends.push(ManagedBackend {
                record: record.clone(),
                id,
            });
        }

        Ok(snapshot)
    }

    /// Backend routed for a `Host` header value
    pub fn resolve_host(&self, host: &str) -> Option<&ManagedBackend> {
        self.by_host
            .get(&normalize_host(host))
            .map(|&index| &self.backends[index])
    }

    pub fn backend(&self, name: &str) -> Option<&ManagedBackend> {
        self.by_name.get(name).map(|&index| &self.backends[index])
    }

    pub fn backends(&self) -> &[ManagedBackend] {
        &self.backends
    }

    /// The active group a backend belongs to, if any
    pub fn group_of(&self, name: &str) -> Option<&GroupRecord> {
        groups::resolve(&self.groups, name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupRecord> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn groups(&self) -> &[GroupRecord] {
        &self.groups
    }

    pub fn schedules(&self) -> &[ScheduleRecord] {
        &self.schedules
    }

    pub fn credentials(&self) -> Option<&PveCredentials> {
        self.credentials.as_ref()
    }

    /// Known backends among a group's members, in declared order
    pub fn members<'a>(&'a self, group: &'a GroupRecord) -> impl Iterator<Item = &'a ManagedBackend> {
        group.container.iter().filter_map(|name| self.backend(name))
    }
}

/// Lowercase host without a `:port` suffix
pub fn normalize_host(raw: &str) -> String {
    let host = raw.trim();
    let host = if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Holder of the current snapshot
pub struct Registry {
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new(snapshot: Snapshot) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        std::mem::replace(&mut *self.current.write(), Arc::new(snapshot))
    }
}
