//! Per-activity error state for tablet background work.
//!
//! Rotation, flush, compaction and pull activities never propagate failures
//! into the single-writer apply path. They catch the error at their own
//! boundary and report it here; the supervisor records the failure, logs it
//! and arms a backoff deadline that callers consult before retrying.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Kind of background activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActivityKind {
    Rotation,
    Flush,
    Compaction,
    Pull,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Rotation => write!(f, "rotation"),
            ActivityKind::Flush => write!(f, "flush"),
            ActivityKind::Compaction => write!(f, "compaction"),
            ActivityKind::Pull => write!(f, "pull"),
        }
    }
}

/// Lifecycle state of one activity on one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Idle,
    Running,
    Failed,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Idle => write!(f, "IDLE"),
            ActivityState::Running => write!(f, "RUNNING"),
            ActivityState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Error state of an activity, as visible to monitoring.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub kind: ActivityKind,
    /// What the activity runs on, e.g. `store:12` or `tablet:3`.
    pub subject: String,
    pub state: ActivityState,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_state_change: Instant,
    pub backoff_until: Option<Instant>,
}

/// Snapshot of every tracked activity.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub activities: Vec<ActivityInfo>,
    pub failing: usize,
    pub total_failures: u64,
}

/// Registry of background activity states. Thread-safe.
pub struct BgActivitySupervisor {
    activities: RwLock<HashMap<(ActivityKind, String), ActivityInfo>>,
    total_failures: AtomicU64,
}

impl BgActivitySupervisor {
    pub fn new() -> Self {
        Self {
            activities: RwLock::new(HashMap::new()),
            total_failures: AtomicU64::new(0),
        }
    }

    fn with_entry<R>(
        &self,
        kind: ActivityKind,
        subject: &str,
        f: impl FnOnce(&mut ActivityInfo) -> R,
    ) -> R {
        let mut activities = self.activities.write();
        let info = activities
            .entry((kind, subject.to_string()))
            .or_insert_with(|| ActivityInfo {
                kind,
                subject: subject.to_string(),
                state: ActivityState::Idle,
                failure_count: 0,
                last_error: None,
                last_state_change: Instant::now(),
                backoff_until: None,
            });
        f(info)
    }

    pub fn report_started(&self, kind: ActivityKind, subject: &str) {
        self.with_entry(kind, subject, |info| {
            info.state = ActivityState::Running;
            info.last_state_change = Instant::now();
        });
        tracing::debug!(activity = %kind, subject, "background activity started");
    }

    /// Clears the error state; the activity is healthy again.
    pub fn report_succeeded(&self, kind: ActivityKind, subject: &str) {
        self.with_entry(kind, subject, |info| {
            info.state = ActivityState::Idle;
            info.last_state_change = Instant::now();
            info.last_error = None;
            info.backoff_until = None;
        });
        metrics::counter!("tablet_background_activity_succeeded_total", "activity" => kind.to_string())
            .increment(1);
    }

    /// Records a failure and arms a backoff deadline `backoff` from now.
    pub fn report_failed(&self, kind: ActivityKind, subject: &str, reason: &str, backoff: Duration) {
        let failure_count = self.with_entry(kind, subject, |info| {
            let now = Instant::now();
            info.state = ActivityState::Failed;
            info.last_state_change = now;
            info.failure_count += 1;
            info.last_error = Some(reason.to_string());
            info.backoff_until = Some(now + backoff);
            info.failure_count
        });
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_background_activity_failed_total", "activity" => kind.to_string())
            .increment(1);
        if failure_count > 1 {
            tracing::error!(
                activity = %kind,
                subject,
                failure_count,
                backoff_ms = backoff.as_millis() as u64,
                reason,
                "background activity failed again, backing off"
            );
        } else {
            tracing::warn!(
                activity = %kind,
                subject,
                backoff_ms = backoff.as_millis() as u64,
                reason,
                "background activity failed, backing off"
            );
        }
    }

    /// True while a failed activity is still inside its backoff window.
    pub fn is_backing_off(&self, kind: ActivityKind, subject: &str) -> bool {
        let activities = self.activities.read();
        activities
            .get(&(kind, subject.to_string()))
            .and_then(|info| info.backoff_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn state(&self, kind: ActivityKind, subject: &str) -> Option<ActivityState> {
        let activities = self.activities.read();
        activities.get(&(kind, subject.to_string())).map(|i| i.state)
    }

    pub fn info(&self, kind: ActivityKind, subject: &str) -> Option<ActivityInfo> {
        let activities = self.activities.read();
        activities.get(&(kind, subject.to_string())).cloned()
    }

    /// Drops every activity tracked for `subject` (e.g. a removed store).
    pub fn forget(&self, subject: &str) {
        self.activities.write().retain(|(_, s), _| s != subject);
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let activities = self.activities.read();
        let mut list: Vec<ActivityInfo> = activities.values().cloned().collect();
        list.sort_by(|a, b| a.subject.cmp(&b.subject).then(a.kind.cmp(&b.kind)));
        let failing = list
            .iter()
            .filter(|i| i.state == ActivityState::Failed)
            .count();
        ActivitySnapshot {
            activities: list,
            failing,
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for BgActivitySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_arms_backoff() {
        let sv = BgActivitySupervisor::new();
        sv.report_started(ActivityKind::Flush, "store:1");
        assert_eq!(sv.state(ActivityKind::Flush, "store:1"), Some(ActivityState::Running));

        sv.report_failed(ActivityKind::Flush, "store:1", "disk full", Duration::from_secs(60));
        assert_eq!(sv.state(ActivityKind::Flush, "store:1"), Some(ActivityState::Failed));
        assert!(sv.is_backing_off(ActivityKind::Flush, "store:1"));
        assert!(!sv.is_backing_off(ActivityKind::Compaction, "store:1"));

        let info = sv.info(ActivityKind::Flush, "store:1").unwrap();
        assert_eq!(info.failure_count, 1);
        assert_eq!(info.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_zero_backoff_is_immediately_retryable() {
        let sv = BgActivitySupervisor::new();
        sv.report_failed(ActivityKind::Compaction, "store:2", "boom", Duration::ZERO);
        assert!(!sv.is_backing_off(ActivityKind::Compaction, "store:2"));
    }

    #[test]
    fn test_success_clears_error() {
        let sv = BgActivitySupervisor::new();
        sv.report_failed(ActivityKind::Flush, "store:1", "boom", Duration::from_secs(60));
        sv.report_succeeded(ActivityKind::Flush, "store:1");
        let info = sv.info(ActivityKind::Flush, "store:1").unwrap();
        assert_eq!(info.state, ActivityState::Idle);
        assert!(info.last_error.is_none());
        assert!(!sv.is_backing_off(ActivityKind::Flush, "store:1"));
        // the failure is still counted
        assert_eq!(info.failure_count, 1);
    }

    #[test]
    fn test_snapshot_and_forget() {
        let sv = BgActivitySupervisor::new();
        sv.report_failed(ActivityKind::Flush, "store:1", "a", Duration::ZERO);
        sv.report_started(ActivityKind::Rotation, "tablet:1");
        let snap = sv.snapshot();
        assert_eq!(snap.activities.len(), 2);
        assert_eq!(snap.failing, 1);
        assert_eq!(snap.total_failures, 1);

        sv.forget("store:1");
        assert_eq!(sv.snapshot().activities.len(), 1);
    }
}
