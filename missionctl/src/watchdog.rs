//! Stale-heartbeat watchdog.
//!
//! Periodically compares every declared agent's last heartbeat with its
//! cadence. Stale agents are reported in one combined alert per scan; an
//! agent already reported is suppressed for the configured window.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::schedule::Cadence;
use crate::core::watch::{is_stale, should_alert};
use crate::io::alerts::{AlertSink, notify_best_effort};
use crate::io::config::WatchdogConfig;
use crate::io::store::TaskStore;
use crate::io::workflow::WorkflowLoader;

pub const ALERT_TITLE: &str = "Stale worker heartbeats";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleWorker {
    pub worker: String,
    pub last_fired: Option<DateTime<Utc>>,
    pub cycle_minutes: u32,
}

impl StaleWorker {
    fn line(&self, now: DateTime<Utc>) -> String {
        match self.last_fired {
            Some(at) => format!(
                "{}: last heartbeat {} min ago (cycle {} min)",
                self.worker,
                (now - at).num_minutes(),
                self.cycle_minutes
            ),
            None => format!(
                "{}: no heartbeat recorded (cycle {} min)",
                self.worker, self.cycle_minutes
            ),
        }
    }
}

pub struct Watchdog {
    workflows: Arc<WorkflowLoader>,
    store: Arc<dyn TaskStore>,
    alerts: Arc<dyn AlertSink>,
    cfg: WatchdogConfig,
    default_cycle_minutes: u32,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Watchdog {
    pub fn new(
        workflows: Arc<WorkflowLoader>,
        store: Arc<dyn TaskStore>,
        alerts: Arc<dyn AlertSink>,
        cfg: WatchdogConfig,
        default_cycle_minutes: u32,
    ) -> Self {
        Self {
            workflows,
            store,
            alerts,
            cfg,
            default_cycle_minutes,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// One scan at `now`. Returns the agents included in the alert.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<StaleWorker>> {
        let beats: BTreeMap<String, DateTime<Utc>> = self
            .store
            .heartbeats()
            .await?
            .into_iter()
            .map(|b| (b.worker, b.last_fired_at))
            .collect();
        let workflows = self.workflows.snapshot();
        let suppression = chrono::Duration::minutes(i64::from(self.cfg.suppression_minutes));

        let mut report = Vec::new();
        {
            let mut last_alert = self
                .last_alert
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for agent in workflows.agents() {
                let cycle = Cadence::for_agent(agent, self.default_cycle_minutes).cycle_minutes();
                let last_fired = beats.get(&agent.id).copied();
                if !is_stale(last_fired, cycle, self.cfg.grace_minutes, now) {
                    continue;
                }
                if !should_alert(last_alert.get(&agent.id).copied(), suppression, now) {
                    debug!(worker = %agent.id, "stale worker already reported");
                    continue;
                }
                last_alert.insert(agent.id.clone(), now);
                report.push(StaleWorker {
                    worker: agent.id.clone(),
                    last_fired,
                    cycle_minutes: cycle,
                });
            }
        }

        if report.is_empty() {
            return Ok(report);
        }
        let body = report
            .iter()
            .map(|s| s.line(now))
            .collect::<Vec<_>>()
            .join("\n");
        warn!(stale = report.len(), "stale worker heartbeats");
        notify_best_effort(self.alerts.as_ref(), ALERT_TITLE, &body).await;
        Ok(report)
    }

    /// Scan every `interval_minutes` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = Duration::from_secs(u64::from(self.cfg.interval_minutes.max(1)) * 60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_minutes = self.cfg.interval_minutes, "watchdog started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.scan(Utc::now()).await {
                let detail = format!("{err:#}");
                error!(error = %detail, "watchdog scan failed");
            }
        }
        info!("watchdog stopped");
    }
}
