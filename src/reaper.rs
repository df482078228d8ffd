//! Periodic idle reaper
//!
//! Stops ungrouped backends and whole groups once they have been idle for
//! their timeout. A backend counts as idle only when its last request, its
//! control-plane start time and its `activatedAt` stamp are all older than
//! the timeout, so a backend started out-of-band is not stopped right away.

use crate::config::LifecycleConfig;
use crate::document::GroupRecord;
use crate::driver::{check_multiple, BackendId, SharedControlPlane, Transition};
use crate::lifecycle::{duration_millis, now_millis, EpochMillis, LifecycleManager};
use crate::registry::{ManagedBackend, Registry, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stopped: Vec<String>,
    /// Idle backends left alone because a stop was already running
    pub skipped_in_flight: Vec<String>,
}

pub struct IdleReaper {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    plane: SharedControlPlane,
    interval: Duration,
    default_idle_timeout: u64,
    max_concurrent: usize,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        plane: SharedControlPlane,
        config: &LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            lifecycle,
            plane,
            interval: config.reaper_interval(),
            default_idle_timeout: config.default_idle_timeout_secs,
            max_concurrent: config.max_concurrent_checks,
        })
    }

    /// Sweep every interval until shutdown.
    ///
    /// Each sweep runs in its own task so a panic is logged and the next tick
    /// still happens.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Idle reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let reaper = Arc::clone(&self);
                    match tokio::spawn(async move { reaper.sweep(now_millis()).await }).await {
                        Ok(report) if !report.stopped.is_empty() => {
                            info!(stopped = ?report.stopped, "Idle sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Idle sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self, now: EpochMillis) -> SweepReport {
        let snapshot = self.registry.snapshot();
        let mut report = SweepReport::default();

        self.sweep_backends(&snapshot, now, &mut report).await;
        self.sweep_groups(&snapshot, now, &mut report).await;

        report
    }

    /// Last request time; restores the entry when it is missing
    fn last_activity(&self, name: &str, now: EpochMillis) -> EpochMillis {
        match self.lifecycle.last_activity(name) {
            Some(at) => at,
            None => {
                self.lifecycle.touch(name, now);
                now
            }
        }
    }

    async fn sweep_backends(&self, snapshot: &Snapshot, now: EpochMillis, report: &mut SweepReport) {
        let mut candidates: Vec<(&ManagedBackend, i64)> = Vec::new();

        for backend in snapshot.backends() {
            let name = backend.name();
            if !backend.record.active || snapshot.group_of(name).is_some() {
                continue;
            }
            let timeout = duration_millis(backend.record.idle_timeout(self.default_idle_timeout));
            if now.saturating_sub(self.last_activity(name, now)) <= timeout
                || now.saturating_sub(backend.record.activated_at_ms()) <= timeout
            {
                continue;
            }
            if self.lifecycle.is_stopping(name) {
                report.skipped_in_flight.push(name.to_string());
                continue;
            }
            candidates.push((backend, timeout));
        }
        if candidates.is_empty() {
            return;
        }

        let ids: Vec<BackendId> = candidates.iter().map(|(b, _)| b.id.clone()).collect();
        let running = check_multiple(self.plane.as_ref(), &ids, self.max_concurrent).await;

        for (backend, timeout) in candidates {
            if !running.get(&backend.id).copied().unwrap_or(false) {
                continue;
            }
            if !self.idle_since_start(backend, timeout, now).await {
                continue;
            }

            info!(
                backend = %backend.name(),
                timeout_secs = timeout / 1000,
                "Idle timeout reached, stopping"
            );
            self.stop(backend, report).await;
        }
    }

    async fn sweep_groups(&self, snapshot: &Snapshot, now: EpochMillis, report: &mut SweepReport) {
        for group in snapshot.groups().iter().filter(|g| g.active) {
            let members: Vec<&ManagedBackend> = snapshot.members(group).collect();
            if members.is_empty() {
                continue;
            }
            if !self.group_is_idle(group, &members, now, report).await {
                continue;
            }

            info!(
                group = %group.name,
                members = members.len(),
                "Group idle timeout reached, stopping all members"
            );
            for member in members {
                self.stop(member, report).await;
            }
        }
    }

    /// Every member running, idle by activity and idle since its start
    async fn group_is_idle(
        &self,
        group: &GroupRecord,
        members: &[&ManagedBackend],
        now: EpochMillis,
        report: &mut SweepReport,
    ) -> bool {
        let timeout = duration_millis(group.idle_timeout(self.default_idle_timeout));

        // One fresh member keeps the whole group alive
        if members
            .iter()
            .any(|m| now.saturating_sub(self.last_activity(m.name(), now)) <= timeout)
        {
            return false;
        }
        if let Some(member) = members.iter().find(|m| self.lifecycle.is_stopping(m.name())) {
            debug!(group = %group.name, backend = %member.name(), "Group member already stopping");
            report.skipped_in_flight.push(member.name().to_string());
            return false;
        }

        let ids: Vec<BackendId> = members.iter().map(|m| m.id.clone()).collect();
        let running = check_multiple(self.plane.as_ref(), &ids, self.max_concurrent).await;
        if !ids.iter().all(|id| running.get(id).copied().unwrap_or(false)) {
            return false;
        }

        for member in members {
            if !self.idle_since_start(member, timeout, now).await {
                return false;
            }
        }
        true
    }

    /// Whether the control plane started the backend more than `timeout` ago.
    ///
    /// An unreadable start time keeps the backend alive.
    async fn idle_since_start(&self, backend: &ManagedBackend, timeout: i64, now: EpochMillis) -> bool {
        let name = backend.name();
        let started = match self.plane.started_at(&backend.id).await {
            Ok(started) => started,
            Err(e) => {
                warn!(backend = %name, error = %e, "Cannot read start time, keeping backend running");
                return false;
            }
        };

        let idle = now.saturating_sub(started) > timeout;
        if self.lifecycle.first_start_time_check(name) {
            info!(backend = %name, "Idle since last request, checking start time");
            if !idle {
                info!(
                    backend = %name,
                    timeout_secs = timeout / 1000,
                    "Started recently, will stop once the timeout has passed since start"
                );
            }
        }
        idle
    }

    async fn stop(&self, backend: &ManagedBackend, report: &mut SweepReport) {
        let name = backend.name();
        match self
            .lifecycle
            .stop_guarded(self.plane.as_ref(), name, &backend.id)
            .await
        {
            None => {
                debug!(backend = %name, "Stop already in flight");
                report.skipped_in_flight.push(name.to_string());
            }
            Some(Ok(Transition::Changed)) => {
                info!(backend = %name, "Stopped idle backend");
                report.stopped.push(name.to_string());
            }
            Some(Ok(Transition::Unchanged)) => {
                debug!(backend = %name, "Backend was already stopped");
            }
            Some(Err(e)) => {
                warn!(backend = %name, error = %e, "Failed to stop idle backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{BackendRecord, Document};
    use crate::driver::{ControlPlane, DriverError};
    use crate::groups::GroupMembers;
    use crate::registry::Snapshot;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap, HashSet};

    const NOW: EpochMillis = 10_000_000;

    /// Control plane with scripted state that records stop commands
    #[derive(Default)]
    struct ScriptedPlane {
        running: Mutex<HashSet<String>>,
        started_at: Mutex<HashMap<String, i64>>,
        stops: Mutex<Vec<String>>,
    }

    impl ScriptedPlane {
        fn with_running(names: &[&str], started_at: i64) -> Arc<Self> {
            let plane = Self::default();
            for name in names {
                plane.running.lock().insert(name.to_string());
                plane.started_at.lock().insert(name.to_string(), started_at);
            }
            Arc::new(plane)
        }

        fn stops(&self) -> Vec<String> {
            self.stops.lock().clone()
        }
    }

    impl ControlPlane for ScriptedPlane {
        fn is_running<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, bool> {
            async move { self.running.lock().contains(&id.to_string()) }.boxed()
        }

        fn list_all(&self) -> BoxFuture<'_, BTreeSet<String>> {
            async move { self.running.lock().iter().cloned().collect() }.boxed()
        }

        fn started_at<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<i64, DriverError>> {
            async move {
                self.started_at
                    .lock()
                    .get(&id.to_string())
                    .copied()
                    .ok_or_else(|| DriverError::Malformed("no start time".to_string()))
            }
            .boxed()
        }

        fn start<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>> {
            async move {
                let inserted = self.running.lock().insert(id.to_string());
                Ok(if inserted { Transition::Changed } else { Transition::Unchanged })
            }
            .boxed()
        }

        fn stop<'a>(&'a self, id: &'a BackendId) -> BoxFuture<'a, Result<Transition, DriverError>> {
            async move {
                if !self.running.lock().remove(&id.to_string()) {
                    return Ok(Transition::Unchanged);
                }
                self.stops.lock().push(id.to_string());
                Ok(Transition::Changed)
            }
            .boxed()
        }
    }

    fn reaper(document: Document, plane: Arc<ScriptedPlane>) -> (Arc<IdleReaper>, Arc<LifecycleManager>) {
        let registry = Registry::new(Snapshot::from_document(&document).unwrap());
        let lifecycle = LifecycleManager::new(Duration::from_secs(30), Duration::from_secs(5));
        let reaper = IdleReaper::new(
            registry,
            Arc::clone(&lifecycle),
            plane,
            &LifecycleConfig::default(),
        );
        (reaper, lifecycle)
    }

    fn backend(name: &str, idle_timeout: u64) -> BackendRecord {
        BackendRecord::new(name, &format!("{}.example", name), "http://127.0.0.1:1")
            .with_idle_timeout(idle_timeout)
    }

    fn group(name: &str, members: &[&str], idle_timeout: u64) -> GroupRecord {
        GroupRecord {
            name: name.to_string(),
            container: GroupMembers::Many(members.iter().map(|m| m.to_string()).collect()),
            active: true,
            idle_timeout: Some(idle_timeout),
        }
    }

    #[tokio::test]
    async fn test_idle_backend_stopped_once() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 61_000);

        let report = reaper.sweep(NOW).await;
        assert_eq!(report.stopped, vec!["A"]);

        let report = reaper.sweep(NOW + 10_000).await;
        assert!(report.stopped.is_empty());
        assert_eq!(plane.stops(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_huge_idle_timeout_never_expires() {
        let plane = ScriptedPlane::with_running(&["A"], 0);
        let doc = Document {
            containers: vec![backend("A", 10_000_000_000_000_000)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
        assert!(plane.stops().is_empty());
    }

    #[tokio::test]
    async fn test_recent_activity_keeps_backend() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 59_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
        assert!(plane.stops().is_empty());
    }

    #[tokio::test]
    async fn test_recent_start_keeps_backend() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 5_000);
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 120_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());

        // Once the timeout has also passed since the start
        assert_eq!(reaper.sweep(NOW + 60_000).await.stopped, vec!["A"]);
    }

    #[tokio::test]
    async fn test_unknown_start_time_keeps_backend() {
        let plane = ScriptedPlane::with_running(&["A"], 0);
        plane.started_at.lock().clear();
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 120_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_recent_activation_keeps_backend() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let mut record = backend("A", 60);
        record.activated_at = Some(NOW - 30_000);
        let doc = Document {
            containers: vec![record],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 120_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_and_stopped_backends_ignored() {
        let plane = ScriptedPlane::with_running(&["B"], NOW - 600_000);
        let mut inactive = backend("B", 60);
        inactive.active = false;
        let doc = Document {
            containers: vec![backend("A", 60), inactive],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 120_000);
        lifecycle.touch("B", NOW - 120_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
        assert!(plane.stops().is_empty());
    }

    #[tokio::test]
    async fn test_stop_in_flight_is_skipped() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 120_000);
        let _guard = lifecycle.try_begin_stop("A").unwrap();

        let report = reaper.sweep(NOW).await;
        assert!(report.stopped.is_empty());
        assert_eq!(report.skipped_in_flight, vec!["A"]);
        assert!(plane.stops().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_sibling_keeps_group_alive() {
        let plane = ScriptedPlane::with_running(&["A", "B"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60), backend("B", 60)],
            groups: vec![group("stack", &["A", "B"], 120)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        // A alone would be past its own timeout, but it is grouped
        lifecycle.touch("A", NOW - 300_000);
        lifecycle.touch("B", NOW - 10_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
        assert!(plane.stops().is_empty());
    }

    #[tokio::test]
    async fn test_idle_group_stopped_together() {
        let plane = ScriptedPlane::with_running(&["A", "B"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60), backend("B", 60)],
            groups: vec![group("stack", &["A", "B", "ghost"], 120)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 300_000);
        lifecycle.touch("B", NOW - 121_000);

        let report = reaper.sweep(NOW).await;
        assert_eq!(report.stopped, vec!["A", "B"]);
        assert_eq!(plane.stops(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_group_with_stopped_member_is_kept() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60), backend("B", 60)],
            groups: vec![group("stack", &["A", "B"], 120)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));
        lifecycle.touch("A", NOW - 300_000);
        lifecycle.touch("B", NOW - 300_000);

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_missing_activity_is_restored() {
        let plane = ScriptedPlane::with_running(&["A"], NOW - 600_000);
        let doc = Document {
            containers: vec![backend("A", 60)],
            ..Default::default()
        };
        let (reaper, lifecycle) = reaper(doc, Arc::clone(&plane));

        assert!(reaper.sweep(NOW).await.stopped.is_empty());
        assert_eq!(lifecycle.last_activity("A"), Some(NOW));
    }
}
