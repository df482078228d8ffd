//! Calendar start/stop windows
//!
//! Evaluated once per wall-clock minute in local time. A timer starts its
//! target at `startTime` and stops it at `stopTime` on the listed weekdays,
//! whatever the traffic.

use crate::config::LifecycleConfig;
use crate::document::{ScheduleRecord, TargetType};
use crate::driver::{SharedControlPlane, Transition};
use crate::lifecycle::{now_millis, LifecycleManager};
use crate::registry::{ManagedBackend, Registry, Snapshot};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Wake slightly after the minute boundary so the clock has rolled over
const MINUTE_SKEW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledAction {
    Start,
    Stop,
}

/// A timer edge that falls on the evaluated minute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueAction {
    pub schedule_id: String,
    pub target_type: TargetType,
    pub target: String,
    pub action: ScheduledAction,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

/// Parse `H:MM` or `HH:MM`
pub fn parse_hhmm(raw: &str) -> Option<(u32, u32)> {
    let (hour, minute) = raw.trim().split_once(':')?;
    if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Timer edges due at `weekday` (0 = Sunday) `hour:minute`.
///
/// Inactive timers and timers with unparsable times never fire.
pub fn due_actions(schedules: &[ScheduleRecord], weekday: u8, hour: u32, minute: u32) -> Vec<DueAction> {
    let mut due = Vec::new();

    for schedule in schedules {
        for timer in schedule.timers.iter().filter(|t| t.active) {
            if !timer.days.contains(&weekday) {
                continue;
            }
            let edges = [
                (ScheduledAction::Start, &timer.start_time),
                (ScheduledAction::Stop, &timer.stop_time),
            ];
            for (action, time) in edges {
                if parse_hhmm(time) == Some((hour, minute)) {
                    due.push(DueAction {
                        schedule_id: schedule.id.clone(),
                        target_type: schedule.target_type,
                        target: schedule.target.clone(),
                        action,
                    });
                }
            }
        }
    }

    due
}

/// Time until just after the next minute boundary
pub fn until_next_minute(now: &NaiveDateTime) -> Duration {
    let into_minute = Duration::from_secs(now.second() as u64)
        + Duration::from_nanos(now.nanosecond().min(999_999_999) as u64);
    Duration::from_secs(60).saturating_sub(into_minute) + MINUTE_SKEW
}

fn minute_key(now: &NaiveDateTime) -> i64 {
    now.date().num_days_from_ce() as i64 * 1440 + (now.hour() * 60 + now.minute()) as i64
}

pub struct Scheduler {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    plane: SharedControlPlane,
    max_concurrent: usize,
    last_minute: Mutex<Option<i64>>,
    /// Malformed timers already reported
    warned: Mutex<HashSet<String>>,
}

impl Scheduler {
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
            max_concurrent: config.max_concurrent_checks,
            last_minute: Mutex::new(None),
            warned: Mutex::new(HashSet::new()),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Scheduler started");

        loop {
            let wait = until_next_minute(&Local::now().naive_local());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let scheduler = Arc::clone(&self);
                    let now = Local::now().naive_local();
                    if let Err(e) = tokio::spawn(async move { scheduler.tick(now).await }).await {
                        error!(error = %e, "Schedule evaluation failed");
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

    /// Evaluate `now` unless its minute was already handled
    pub async fn tick(&self, now: NaiveDateTime) -> Option<ScheduleReport> {
        let key = minute_key(&now);
        {
            let mut last = self.last_minute.lock();
            if *last == Some(key) {
                return None;
            }
            *last = Some(key);
        }
        Some(self.evaluate(now).await)
    }

    pub async fn evaluate(&self, now: NaiveDateTime) -> ScheduleReport {
        let snapshot = self.registry.snapshot();
        self.report_malformed(&snapshot);

        let weekday = now.weekday().num_days_from_sunday() as u8;
        let due = due_actions(snapshot.schedules(), weekday, now.hour(), now.minute());
        if due.is_empty() {
            return ScheduleReport::default();
        }

        let mut work: Vec<(ManagedBackend, ScheduledAction)> = Vec::new();
        for action in &due {
            info!(
                schedule = %action.schedule_id,
                target = %action.target,
                action = ?action.action,
                "Schedule due"
            );
            for backend in resolve_targets(&snapshot, action) {
                work.push((backend.clone(), action.action));
            }
        }

        let outcomes: Vec<(String, ScheduledAction, bool)> = futures::stream::iter(work)
            .map(|(backend, action)| async move {
                let changed = self.apply(&backend, action).await;
                (backend.name().to_string(), action, changed)
            })
            .buffer_unordered(self.max_concurrent.max(1))
            .collect()
            .await;

        let mut report = ScheduleReport::default();
        for (name, action, changed) in outcomes {
            if !changed {
                continue;
            }
            match action {
                ScheduledAction::Start => report.started.push(name),
                ScheduledAction::Stop => report.stopped.push(name),
            }
        }
        report.started.sort();
        report.stopped.sort();
        report
    }

    /// Run one action; true when the backend changed state
    async fn apply(&self, backend: &ManagedBackend, action: ScheduledAction) -> bool {
        let name = backend.name();
        let plane = self.plane.as_ref();

        let result = match action {
            ScheduledAction::Start => {
                // A full idle window before the reaper may step in
                self.lifecycle.touch(name, now_millis());
                self.lifecycle.start_guarded(plane, name, &backend.id).await
            }
            ScheduledAction::Stop => self.lifecycle.stop_guarded(plane, name, &backend.id).await,
        };

        match result {
            None => {
                debug!(backend = %name, action = ?action, "Scheduled action already in flight");
                false
            }
            Some(Ok(Transition::Changed)) => {
                info!(backend = %name, action = ?action, "Scheduled action applied");
                true
            }
            Some(Ok(Transition::Unchanged)) => {
                debug!(backend = %name, action = ?action, "Backend already in scheduled state");
                false
            }
            Some(Err(e)) => {
                warn!(backend = %name, action = ?action, error = %e, "Scheduled action failed");
                false
            }
        }
    }

    fn report_malformed(&self, snapshot: &Snapshot) {
        for schedule in snapshot.schedules() {
            for (index, timer) in schedule.timers.iter().enumerate() {
                for time in [&timer.start_time, &timer.stop_time] {
                    if time.trim().is_empty() || parse_hhmm(time).is_some() {
                        continue;
                    }
                    let key = format!("{}/{}/{}", schedule.id, index, time);
                    if self.warned.lock().insert(key) {
                        warn!(schedule = %schedule.id, timer = index, time = %time, "Ignoring timer with invalid time");
                    }
                }
            }
        }
    }
}

fn resolve_targets<'a>(snapshot: &'a Snapshot, action: &DueAction) -> Vec<&'a ManagedBackend> {
    match action.target_type {
        TargetType::Container => match snapshot.backend(&action.target) {
            Some(backend) => vec![backend],
            None => {
                warn!(schedule = %action.schedule_id, target = %action.target, "Scheduled backend not found");
                Vec::new()
            }
        },
        TargetType::Group => match snapshot.group(&action.target) {
            Some(group) => snapshot.members(group).collect(),
            None => {
                warn!(schedule = %action.schedule_id, target = %action.target, "Scheduled group not found");
                Vec::new()
            }
        },
        TargetType::Unknown => {
            warn!(schedule = %action.schedule_id, "Schedule has an unknown target type");
            Vec::new()
        }
    }
}
