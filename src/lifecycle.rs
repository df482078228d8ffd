//! Runtime lifecycle state shared by the gateway, reaper and scheduler
//!
//! Everything here is in-memory and resets on restart. Guards are advisory:
//! they keep one start and one stop in flight per backend, while the control
//! plane's own idempotence absorbs whatever race is left.

use crate::driver::{BackendId, ControlPlane, DriverError, SharedControlPlane, Transition};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type EpochMillis = i64;

pub fn now_millis() -> EpochMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds in `duration`, saturating at `EpochMillis::MAX`
pub fn duration_millis(duration: Duration) -> EpochMillis {
    EpochMillis::try_from(duration.as_millis()).unwrap_or(EpochMillis::MAX)
}

/// Holds a backend name in a guard set until dropped
pub struct NameGuard {
    set: Arc<DashSet<String>>,
    name: String,
}

impl NameGuard {
    fn acquire(set: &Arc<DashSet<String>>, name: &str) -> Option<Self> {
        if !set.insert(name.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.set.remove(&self.name);
    }
}

/// Per-backend runtime state.
///
/// Keyed by the backend's document name. The gateway stamps activity and
/// dispatches starts, the reaper and scheduler stop through the same guard,
/// and the reactor seeds activity for new names without touching the rest.
pub struct LifecycleManager {
    last_activity: DashMap<String, EpochMillis>,
    stopping: Arc<DashSet<String>>,
    starting: Arc<DashSet<String>>,
    /// When a start was last dispatched, for the cold-start grace window
    recently_started: DashMap<String, EpochMillis>,
    /// Names whose "checking start time" message was already logged
    start_time_logged: DashSet<String>,
    last_access_log: DashMap<String, EpochMillis>,
    start_grace: Duration,
    access_log_interval: Duration,
}

impl LifecycleManager {
    pub fn new(start_grace: Duration, access_log_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_activity: DashMap::new(),
            stopping: Arc::new(DashSet::new()),
            starting: Arc::new(DashSet::new()),
            recently_started: DashMap::new(),
            start_time_logged: DashSet::new(),
            last_access_log: DashMap::new(),
            start_grace,
            access_log_interval,
        })
    }

    /// Record traffic for a backend
    pub fn touch(&self, name: &str, now: EpochMillis) {
        self.last_activity.insert(name.to_string(), now);
    }

    pub fn last_activity(&self, name: &str) -> Option<EpochMillis> {
        self.last_activity.get(name).map(|v| *v)
    }

    /// Seed activity for names not seen before; returns how many were new
    pub fn seed<'a, I>(&self, names: I, now: EpochMillis) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut added = 0;
        for name in names {
            if !self.last_activity.contains_key(name) {
                self.last_activity.insert(name.to_string(), now);
                added += 1;
            }
        }
        added
    }

    pub fn try_begin_stop(&self, name: &str) -> Option<NameGuard> {
        NameGuard::acquire(&self.stopping, name)
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.stopping.contains(name)
    }

    pub fn try_begin_start(&self, name: &str) -> Option<NameGuard> {
        NameGuard::acquire(&self.starting, name)
    }

    pub fn is_starting(&self, name: &str) -> bool {
        self.starting.contains(name)
    }

    pub fn mark_started(&self, name: &str, now: EpochMillis) {
        self.recently_started.insert(name.to_string(), now);
    }

    /// Whether a start was dispatched within the grace window.
    ///
    /// Expired entries are dropped on the way.
    pub fn in_grace_window(&self, name: &str, now: EpochMillis) -> bool {
        let started = match self.recently_started.get(name) {
            Some(entry) => *entry,
            None => return false,
        };
        let grace = duration_millis(self.start_grace);
        if now.saturating_sub(started) < grace {
            return true;
        }
        self.recently_started
            .remove_if(name, |_, at| now.saturating_sub(*at) >= grace);
        false
    }

    /// True the first time it is asked for a name since the last stop
    pub fn first_start_time_check(&self, name: &str) -> bool {
        self.start_time_logged.insert(name.to_string())
    }

    pub fn reset_start_time_check(&self, name: &str) {
        self.start_time_logged.remove(name);
    }

    /// Throttle for the per-backend access log line
    pub fn should_log_access(&self, name: &str, now: EpochMillis) -> bool {
        let interval = duration_millis(self.access_log_interval);
        let mut entry = self.last_access_log.entry(name.to_string()).or_insert(i64::MIN);
        if *entry == i64::MIN || now.saturating_sub(*entry) > interval {
            *entry = now;
            return true;
        }
        false
    }

    /// Drop all runtime state
    pub fn clear(&self) {
        self.last_activity.clear();
        self.stopping.clear();
        self.starting.clear();
        self.recently_started.clear();
        self.start_time_logged.clear();
        self.last_access_log.clear();
    }

    /// Start a backend in the background unless a start is already in flight.
    ///
    /// The guard is taken before this returns, so a burst of callers
    /// produces a single dispatch. Returns whether a start was dispatched.
    pub fn dispatch_start(self: &Arc<Self>, plane: SharedControlPlane, name: &str, id: BackendId) -> bool {
        let Some(guard) = self.try_begin_start(name) else {
            debug!(backend = name, "Start already in flight");
            return false;
        };

        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = lifecycle.run_start(plane.as_ref(), &guard, &id).await {
                warn!(backend = guard.name(), error = %e, "Failed to start backend");
            }
        });
        true
    }

    /// Start a backend and wait for the outcome; `None` when a start is
    /// already in flight
    pub async fn start_guarded(
        &self,
        plane: &dyn ControlPlane,
        name: &str,
        id: &BackendId,
    ) -> Option<Result<Transition, DriverError>> {
        let guard = self.try_begin_start(name)?;
        Some(self.run_start(plane, &guard, id).await)
    }

    async fn run_start(
        &self,
        plane: &dyn ControlPlane,
        guard: &NameGuard,
        id: &BackendId,
    ) -> Result<Transition, DriverError> {
        let name = guard.name();
        if plane.is_running(id).await {
            debug!(backend = name, "Backend already running, skipping start");
            return Ok(Transition::Unchanged);
        }

        self.mark_started(name, now_millis());
        let transition = plane.start(id).await?;
        if transition == Transition::Changed {
            info!(backend = name, kind = id.kind(), "Backend started");
        }
        Ok(transition)
    }

    /// Stop a backend through the stopping guard; `None` when a stop is
    /// already in flight.
    ///
    /// The guard is released after the attempt whatever its outcome.
    pub async fn stop_guarded(
        &self,
        plane: &dyn ControlPlane,
        name: &str,
        id: &BackendId,
    ) -> Option<Result<Transition, DriverError>> {
        let _guard = self.try_begin_stop(name)?;
        let result = plane.stop(id).await;

        self.reset_start_time_check(name);
        if matches!(result, Ok(Transition::Changed)) {
            self.recently_started.remove(name);
        }
        Some(result)
    }
}
