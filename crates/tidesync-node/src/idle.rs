//! Idle detection for select stages
//!
//! A source that stops yielding data is often the first sign of a broken
//! upstream (replication slot dropped, binlog position lost, network ACL).
//! Each select stage tracks how long it has gone without data and raises a
//! throttled notice once the silence passes the configured threshold.
//!
//! The monitor is driven once per empty fetch cycle:
//!
//! ```text
//! idle    = now - last_no_fetch        (-1 when no window is open)
//! over    = threshold >= 0 && idle >= threshold
//! trigger = last_notice unset || now - last_notice >= notice_span
//! notice  = over && trigger
//! ```
//!
//! A non-empty fetch closes the window; the next empty fetch opens a new one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tidesync_common::{LogType, NodeLog, SourceSpec, SwimlaneId, TaskId};

/// Idle alerting parameters supplied by the source connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSettings {
    /// Minimum seconds between two notices
    pub notice_span: i64,
    /// Seconds of silence before a notice is considered (-1 disables)
    pub threshold: i64,
}

impl IdleSettings {
    pub fn new(notice_span: i64, threshold: i64) -> Self {
        Self {
            notice_span,
            threshold,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, -1)
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold >= 0
    }
}

impl From<&SourceSpec> for IdleSettings {
    fn from(spec: &SourceSpec) -> Self {
        Self::new(spec.empty_fetch_notice_span, spec.empty_fetch_threshold)
    }
}

/// Timestamps of the current idle window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleWindow {
    pub last_no_fetch: Option<DateTime<Utc>>,
    pub last_notice: Option<DateTime<Utc>>,
}

/// A notice the select stage must upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleNotice {
    pub task_id: TaskId,
    pub swimlane_id: SwimlaneId,
    pub client_info: String,
    /// Seconds without data
    pub idle_secs: i64,
    /// Configured notice span in seconds
    pub notice_span: i64,
}

impl IdleNotice {
    pub fn idle_minutes(&self) -> i64 {
        self.idle_secs / 60
    }

    /// Render the notice as a node log record
    pub fn to_node_log(&self, receivers: Vec<String>) -> NodeLog {
        let message = format!(
            "\"{}\" has consumed no data for {} minutes, notice interval {} minutes",
            self.client_info,
            self.idle_minutes(),
            self.notice_span / 60
        );
        let title = format!(
            "[ATTENTION] {}-{} no data consumed for {} minutes",
            self.task_id,
            self.swimlane_id,
            self.idle_minutes()
        );
        NodeLog::new(LogType::TaskWarning, self.task_id.clone(), message)
            .with_swimlane(self.swimlane_id.clone())
            .with_title(title)
            .with_idle_minutes(self.idle_minutes())
            .with_receivers(receivers)
    }
}

/// Result of observing one empty fetch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleCheck {
    /// Seconds since the window opened, -1 if it just opened
    pub idle_secs: i64,
    pub notice: Option<IdleNotice>,
}

/// Per select stage idle tracker
#[derive(Debug, Clone)]
pub struct IdleMonitor {
    task_id: TaskId,
    swimlane_id: SwimlaneId,
    client_info: String,
    settings: IdleSettings,
    window: IdleWindow,
}

impl IdleMonitor {
    pub fn new(
        task_id: TaskId,
        swimlane_id: SwimlaneId,
        client_info: impl Into<String>,
        settings: IdleSettings,
    ) -> Self {
        Self {
            task_id,
            swimlane_id,
            client_info: client_info.into(),
            settings,
            window: IdleWindow::default(),
        }
    }

    pub fn window(&self) -> IdleWindow {
        self.window
    }

    pub fn settings(&self) -> IdleSettings {
        self.settings
    }

    /// A non-empty fetch closes the idle window
    pub fn record_data(&mut self) {
        self.window.last_no_fetch = None;
    }

    /// Observe an empty fetch cycle at `now`
    pub fn observe_empty(&mut self, now: DateTime<Utc>) -> IdleCheck {
        let idle_secs = self
            .window
            .last_no_fetch
            .map(|since| (now - since).num_seconds().abs())
            .unwrap_or(-1);

        let over_threshold = self.settings.threshold > -1 && idle_secs >= self.settings.threshold;
        let trigger_notice = match self.window.last_notice {
            None => true,
            Some(last) => (now - last).num_seconds().abs() >= self.settings.notice_span,
        };

        let notice = if over_threshold && trigger_notice {
            self.window.last_notice = Some(now);
            Some(IdleNotice {
                task_id: self.task_id.clone(),
                swimlane_id: self.swimlane_id.clone(),
                client_info: self.client_info.clone(),
                idle_secs,
                notice_span: self.settings.notice_span,
            })
        } else {
            None
        };

        if self.window.last_no_fetch.is_none() {
            self.window.last_no_fetch = Some(now);
        }

        IdleCheck { idle_secs, notice }
    }
}

/// Idle status of one consumer, as exposed to health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdleStatus {
    pub idle_secs: i64,
    pub updated_at: DateTime<Utc>,
}

/// Node-wide liveness registry keyed by (task, swimlane)
#[derive(Debug, Default)]
pub struct IdleRegistry {
    entries: DashMap<(TaskId, SwimlaneId), IdleStatus>,
}

impl IdleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current idle duration of a consumer
    pub fn flush(&self, task_id: &TaskId, swimlane_id: &SwimlaneId, idle_secs: i64) {
        self.entries.insert(
            (task_id.clone(), swimlane_id.clone()),
            IdleStatus {
                idle_secs,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, task_id: &TaskId, swimlane_id: &SwimlaneId) -> Option<IdleStatus> {
        self.entries
            .get(&(task_id.clone(), swimlane_id.clone()))
            .map(|entry| *entry.value())
    }

    /// All swimlanes of a task
    pub fn for_task(&self, task_id: &TaskId) -> Vec<(SwimlaneId, IdleStatus)> {
        let mut lanes: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().0 == task_id)
            .map(|entry| (entry.key().1.clone(), *entry.value()))
            .collect();
        lanes.sort_by(|a, b| a.0.cmp(&b.0));
        lanes
    }

    /// Forget a stopped task
    pub fn remove_task(&self, task_id: &TaskId) {
        self.entries.retain(|key, _| &key.0 != task_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn monitor(notice_span: i64, threshold: i64) -> IdleMonitor {
        IdleMonitor::new(
            TaskId::new("orders"),
            SwimlaneId::new("0"),
            "mysql://db-1:3306",
            IdleSettings::new(notice_span, threshold),
        )
    }

    #[test]
    fn test_single_notice_over_61_seconds() {
        let mut monitor = monitor(300, 60);
        let offsets = [0, 7, 14, 20, 27, 34, 41, 48, 55, 61];

        let notices: Vec<IdleNotice> = offsets
            .iter()
            .filter_map(|s| monitor.observe_empty(t0() + Duration::seconds(*s)).notice)
            .collect();

        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].idle_secs, 61);
        assert_eq!(notices[0].idle_minutes(), 1);
    }

    #[test]
    fn test_first_empty_fetch_opens_window() {
        let mut monitor = monitor(300, 0);
        let check = monitor.observe_empty(t0());

        assert_eq!(check.idle_secs, -1);
        assert!(check.notice.is_none());
        assert_eq!(monitor.window().last_no_fetch, Some(t0()));
    }

    #[test]
    fn test_notice_throttled_by_span() {
        let mut monitor = monitor(300, 60);
        monitor.observe_empty(t0());

        let mut notices = 0;
        // One empty fetch every 10 seconds for 10 minutes
        for s in (10..=600).step_by(10) {
            if monitor
                .observe_empty(t0() + Duration::seconds(s))
                .notice
                .is_some()
            {
                notices += 1;
            }
        }
        // At 60s, then at 360s (60 + 300); the next would be at 660s
        assert_eq!(notices, 2);
        assert_eq!(
            monitor.window().last_notice,
            Some(t0() + Duration::seconds(360))
        );
    }

    #[test]
    fn test_data_resets_window() {
        let mut monitor = monitor(300, 60);
        monitor.observe_empty(t0());
        assert!(monitor
            .observe_empty(t0() + Duration::seconds(70))
            .notice
            .is_some());

        monitor.record_data();
        assert_eq!(monitor.window().last_no_fetch, None);

        let check = monitor.observe_empty(t0() + Duration::seconds(500));
        assert_eq!(check.idle_secs, -1, "new window must not reuse stale timestamps");
        assert_eq!(
            monitor.window().last_no_fetch,
            Some(t0() + Duration::seconds(500))
        );

        let check = monitor.observe_empty(t0() + Duration::seconds(530));
        assert_eq!(check.idle_secs, 30);
        assert!(check.notice.is_none());
    }

    #[test]
    fn test_disabled_threshold_never_notifies() {
        let mut monitor = monitor(0, -1);
        monitor.observe_empty(t0());
        let check = monitor.observe_empty(t0() + Duration::days(30));

        assert_eq!(check.idle_secs, 30 * 24 * 3600);
        assert!(check.notice.is_none());
    }

    #[test]
    fn test_notice_renders_node_log() {
        let notice = IdleNotice {
            task_id: TaskId::new("orders"),
            swimlane_id: SwimlaneId::new("2"),
            client_info: "mysql://db-1".to_string(),
            idle_secs: 1250,
            notice_span: 600,
        };
        let log = notice.to_node_log(vec!["ops@example.com".to_string()]);

        assert_eq!(log.log_type, LogType::TaskWarning);
        assert_eq!(log.idle_minutes, Some(20));
        assert!(log.message.contains("20 minutes"));
        assert!(log.message.contains("notice interval 10 minutes"));
        assert_eq!(log.receivers, vec!["ops@example.com".to_string()]);
    }

    #[test]
    fn test_registry_per_task() {
        let registry = IdleRegistry::new();
        let orders = TaskId::new("orders");
        registry.flush(&orders, &SwimlaneId::new("1"), 40);
        registry.flush(&orders, &SwimlaneId::new("0"), -1);
        registry.flush(&TaskId::new("users"), &SwimlaneId::new("0"), 5);

        let lanes = registry.for_task(&orders);
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[0].0, SwimlaneId::new("0"));
        assert_eq!(lanes[1].1.idle_secs, 40);

        registry.remove_task(&orders);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&orders, &SwimlaneId::new("1")).is_none());
    }
}
