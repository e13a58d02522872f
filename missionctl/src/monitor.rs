//! Guard-block monitor.
//!
//! Repeated blocks of the same `(mission, from, to, guard)` edge inside the
//! sliding window are escalated into a persisted alert record. Observational
//! only: guards are never changed from here.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use tracing::{error, info, warn};

use crate::core::block_log::{BlockEvent, BlockLog};
use crate::core::types::AlertRecord;
use crate::io::alerts::{AlertSink, notify_best_effort};
use crate::io::config::MonitorConfig;
use crate::io::store::TaskStore;

const NEW_ALERT_CONFIDENCE: f64 = 0.6;
const CONFIDENCE_STEP: f64 = 0.05;

/// Stable description prefix identifying the alert for one edge.
pub fn alert_prefix(mission: &str, from: &str, to: &str, guard: &str) -> String {
    format!("Guard '{guard}' blocked {from}→{to} in {mission}")
}

pub struct GuardBlockMonitor {
    log: Mutex<BlockLog>,
    threshold: usize,
    window_hours: u32,
    store: Arc<dyn TaskStore>,
    alerts: Arc<dyn AlertSink>,
}

impl GuardBlockMonitor {
    pub fn new(cfg: &MonitorConfig, store: Arc<dyn TaskStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            log: Mutex::new(BlockLog::new(
                cfg.capacity,
                Duration::hours(i64::from(cfg.window_hours)),
            )),
            threshold: cfg.threshold.max(1),
            window_hours: cfg.window_hours,
            store,
            alerts,
        }
    }

    /// Record one blocked transition. Returns the alert record written when
    /// the threshold is reached.
    pub async fn record_block(&self, event: BlockEvent) -> Option<AlertRecord> {
        let prefix = alert_prefix(
            &event.mission_type,
            &event.from_state,
            &event.to_state,
            &event.guard,
        );
        let at = event.at;
        let mission = event.mission_type.clone();
        warn!(
            mission = %event.mission_type,
            from = %event.from_state,
            to = %event.to_state,
            guard = %event.guard,
            worker = %event.worker,
            task = %event.task_id,
            "transition blocked by guard"
        );
        let count = self
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event);
        if count < self.threshold {
            return None;
        }

        let description = format!("{prefix} mission {count} times in {}h", self.window_hours);
        let existing = match self.store.find_alert(&prefix).await {
            Ok(existing) => existing,
            Err(err) => {
                let detail = format!("{err:#}");
                error!(error = %detail, "guard alert lookup failed");
                return None;
            }
        };
        let created = existing.is_none();
        let record = match existing {
            Some(mut record) => {
                record.description = description;
                record.occurrence_count += 1;
                record.confidence = (record.confidence + CONFIDENCE_STEP).min(1.0);
                record.last_seen = at;
                record
            }
            None => AlertRecord {
                mission_type: mission,
                suggestion: format!(
                    "{prefix}: check whether the guard is too strict or an upstream stage is failing silently"
                ),
                description,
                occurrence_count: u32::try_from(count).unwrap_or(u32::MAX),
                confidence: NEW_ALERT_CONFIDENCE,
                last_seen: at,
            },
        };
        if let Err(err) = self.store.upsert_alert(&prefix, record.clone()).await {
            let detail = format!("{err:#}");
            error!(error = %detail, "guard alert write failed");
            return None;
        }
        info!(
            alert = %record.description,
            occurrences = record.occurrence_count,
            created,
            "guard block alert recorded"
        );
        if created {
            notify_best_effort(self.alerts.as_ref(), "Repeated guard block", &record.description)
                .await;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::core::types::TaskId;
    use crate::io::store::MemoryStore;
    use crate::test_support::RecordingAlerts;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0)
            .single()
            .expect("valid time")
    }

    fn block(hour: u32) -> BlockEvent {
        BlockEvent {
            mission_type: "content".to_string(),
            from_state: "DRAFT".to_string(),
            to_state: "REVIEW".to_string(),
            guard: "quality_approved".to_string(),
            worker: "quill".to_string(),
            task_id: TaskId::new(format!("task-{hour}")),
            at: at(hour),
        }
    }

    fn monitor() -> (GuardBlockMonitor, Arc<MemoryStore>, Arc<RecordingAlerts>) {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let monitor = GuardBlockMonitor::new(&MonitorConfig::default(), store.clone(), alerts.clone());
        (monitor, store, alerts)
    }

    #[tokio::test]
    async fn below_threshold_writes_nothing() {
        let (monitor, store, alerts) = monitor();
        assert!(monitor.record_block(block(1)).await.is_none());
        assert!(monitor.record_block(block(2)).await.is_none());
        assert!(store.alerts().await.expect("alerts").is_empty());
        assert!(alerts.sent().is_empty());
    }

    #[tokio::test]
    async fn third_block_creates_and_fourth_increments() {
        let (monitor, store, alerts) = monitor();
        for hour in 1..=2 {
            monitor.record_block(block(hour)).await;
        }
        let created = monitor.record_block(block(3)).await.expect("alert");
        assert_eq!(created.occurrence_count, 3);
        assert!((created.confidence - 0.6).abs() < f64::EPSILON);
        assert!(
            created
                .description
                .starts_with("Guard 'quality_approved' blocked DRAFT→REVIEW in content")
        );

        let updated = monitor.record_block(block(4)).await.expect("alert");
        assert_eq!(updated.occurrence_count, 4);
        assert!((updated.confidence - 0.65).abs() < 1e-9);

        assert_eq!(store.alerts().await.expect("alerts").len(), 1);
        assert_eq!(alerts.sent().len(), 1);
    }

    #[tokio::test]
    async fn blocks_outside_the_window_do_not_count() {
        let (monitor, store, _) = monitor();
        monitor.record_block(block(0)).await;
        monitor.record_block(block(1)).await;
        let mut late = block(2);
        late.at = at(2) + Duration::hours(24);
        assert!(monitor.record_block(late).await.is_none());
        assert!(store.alerts().await.expect("alerts").is_empty());
    }

    #[tokio::test]
    async fn different_edges_are_counted_separately() {
        let (monitor, _, _) = monitor();
        monitor.record_block(block(1)).await;
        monitor.record_block(block(2)).await;
        let mut other = block(3);
        other.guard = "has_draft".to_string();
        assert!(monitor.record_block(other).await.is_none());
    }
}
