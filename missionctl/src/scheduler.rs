//! Staggered heartbeat scheduler.
//!
//! Every registered agent gets its own loop: sleep until the agent's next
//! slot, fire the wake-up under a hard timeout, repeat. A slow wake-up delays
//! only its own agent; missed slots are skipped, never queued. Errors and
//! panics inside a wake-up are logged here and go no further.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::render::truncate_chars;
use crate::core::schedule::Cadence;
use crate::heartbeat::{WakeReport, WakeUp};

/// Result of one fired wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Completed(WakeReport),
    Failed(String),
    Panicked,
    TimedOut,
}

/// Wall-clock time advanced by the tokio clock.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl SchedulerClock {
    pub fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }
}

/// Run one wake-up on its own task, bounded by `limit`.
///
/// On timeout the task is aborted; whatever it already committed stays.
pub async fn fire(wake: Arc<dyn WakeUp>, limit: Duration) -> FireOutcome {
    let agent = wake.agent().id.clone();
    let started = Instant::now();
    info!(%agent, "running heartbeat");
    let mut handle = tokio::spawn(async move { wake.wake().await });
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(Ok(report))) => {
            info!(
                %agent,
                result = %truncate_chars(&report.summary(), 100),
                duration_secs = started.elapsed().as_secs_f64(),
                "heartbeat completed"
            );
            FireOutcome::Completed(report)
        }
        Ok(Ok(Err(err))) => {
            let detail = format!("{err:#}");
            error!(%agent, error = %detail, "heartbeat failed");
            FireOutcome::Failed(detail)
        }
        Ok(Err(join)) => {
            error!(%agent, error = %join, "heartbeat panicked");
            FireOutcome::Panicked
        }
        Err(_) => {
            handle.abort();
            warn!(
                %agent,
                timeout_secs = limit.as_secs(),
                duration_secs = started.elapsed().as_secs_f64(),
                "heartbeat timed out"
            );
            FireOutcome::TimedOut
        }
    }
}

pub struct HeartbeatScheduler {
    wakes: Vec<Arc<dyn WakeUp>>,
    default_cycle_minutes: u32,
    timeout: Duration,
}

impl HeartbeatScheduler {
    pub fn new(default_cycle_minutes: u32, timeout: Duration) -> Self {
        Self {
            wakes: Vec::new(),
            default_cycle_minutes,
            timeout,
        }
    }

    pub fn register(&mut self, wake: Arc<dyn WakeUp>) {
        let cadence = Cadence::for_agent(wake.agent(), self.default_cycle_minutes);
        let minutes: Vec<String> = cadence
            .fire_minutes()
            .iter()
            .map(|m| format!(":{m:02}"))
            .collect();
        info!(
            agent = %wake.agent().id,
            schedule = %minutes.join(", "),
            "registered agent for heartbeat"
        );
        self.wakes.push(wake);
    }

    pub fn len(&self) -> usize {
        self.wakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wakes.is_empty()
    }

    /// Next scheduled fire for every agent, in registration order.
    pub fn next_runs(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        self.wakes
            .iter()
            .map(|w| {
                let cadence = Cadence::for_agent(w.agent(), self.default_cycle_minutes);
                (w.agent().id.clone(), cadence.next_fire_after(now))
            })
            .collect()
    }

    /// Run every agent loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let clock = SchedulerClock::start();
        let mut loops = JoinSet::new();
        for wake in &self.wakes {
            let cadence = Cadence::for_agent(wake.agent(), self.default_cycle_minutes);
            loops.spawn(agent_loop(
                wake.clone(),
                cadence,
                self.timeout,
                clock,
                shutdown.clone(),
            ));
        }
        info!(agents = self.wakes.len(), "heartbeat scheduler started");
        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "agent loop ended abnormally");
            }
        }
        info!("heartbeat scheduler stopped");
    }
}

async fn agent_loop(
    wake: Arc<dyn WakeUp>,
    cadence: Cadence,
    limit: Duration,
    clock: SchedulerClock,
    shutdown: CancellationToken,
) {
    loop {
        let now = clock.now();
        let wait = (cadence.next_fire_after(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = fire(wake.clone(), limit) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    use super::*;
    use crate::core::types::AgentBinding;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail,
        Panic,
        Hang,
    }

    struct Probe {
        agent: AgentBinding,
        behavior: Behavior,
        fired: AtomicUsize,
    }

    impl Probe {
        fn new(behavior: Behavior) -> Arc<Self> {
            Self::at_offset("dev", 0, behavior)
        }

        fn at_offset(id: &str, offset: u32, behavior: Behavior) -> Arc<Self> {
            let mut agent = AgentBinding::new(id, "developer", None);
            agent.heartbeat_offset = offset;
            Arc::new(Self {
                agent,
                behavior,
                fired: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WakeUp for Probe {
        fn agent(&self) -> &AgentBinding {
            &self.agent
        }

        async fn wake(&self) -> Result<WakeReport> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Ok => Ok(WakeReport::default()),
                Behavior::Fail => bail!("store unavailable"),
                Behavior::Panic => panic!("wake-up bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(WakeReport::default())
                }
            }
        }
    }

    const LIMIT: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn errors_and_panics_are_contained() {
        assert_eq!(
            fire(Probe::new(Behavior::Ok), LIMIT).await,
            FireOutcome::Completed(WakeReport::default())
        );
        assert_eq!(
            fire(Probe::new(Behavior::Fail), LIMIT).await,
            FireOutcome::Failed("store unavailable".to_string())
        );
        assert_eq!(
            fire(Probe::new(Behavior::Panic), LIMIT).await,
            FireOutcome::Panicked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_wake_is_abandoned_at_the_limit() {
        let started = Instant::now();
        assert_eq!(
            fire(Probe::new(Behavior::Hang), LIMIT).await,
            FireOutcome::TimedOut
        );
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_fires_once_per_slot_until_shutdown() {
        let probe = Probe::new(Behavior::Ok);
        let mut scheduler = HeartbeatScheduler::new(15, LIMIT);
        scheduler.register(probe.clone());
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        shutdown.cancel();
        running.await.expect("scheduler task");

        let fired = probe.fired.load(Ordering::SeqCst);
        assert!((2..=3).contains(&fired), "fired {fired} times");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_do_not_stop_later_slots() {
        let probe = Probe::new(Behavior::Hang);
        let mut scheduler = HeartbeatScheduler::new(15, LIMIT);
        scheduler.register(probe.clone());
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(46 * 60)).await;
        shutdown.cancel();
        running.await.expect("scheduler task");

        assert!(probe.fired.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_agent_does_not_delay_its_neighbour() {
        let hung = Probe::at_offset("dev", 0, Behavior::Hang);
        let healthy = Probe::at_offset("qa", 10, Behavior::Ok);
        let mut scheduler = HeartbeatScheduler::new(15, LIMIT);
        scheduler.register(hung.clone());
        scheduler.register(healthy.clone());
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        // 61 minutes hold four or five slots of a 15-minute cycle.
        tokio::time::sleep(Duration::from_secs(61 * 60)).await;
        shutdown.cancel();
        running.await.expect("scheduler task");

        let fired = healthy.fired.load(Ordering::SeqCst);
        assert!((4..=5).contains(&fired), "healthy agent fired {fired} times");
        assert!(hung.fired.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn next_runs_follow_each_cadence() {
        let mut scheduler = HeartbeatScheduler::new(15, LIMIT);
        let mut hourly = AgentBinding::new("editor", "editor", None);
        hourly.heartbeat_interval = Some(3600);
        hourly.heartbeat_offset = 12;
        scheduler.register(Probe::new(Behavior::Ok));
        scheduler.register(Arc::new(Probe {
            agent: hourly,
            behavior: Behavior::Ok,
            fired: AtomicUsize::new(0),
        }));
        let now = "2026-03-01T10:20:00Z".parse().expect("timestamp");
        let runs = scheduler.next_runs(now);
        assert_eq!(runs[0].0, "dev");
        assert_eq!(runs[0].1, "2026-03-01T10:30:00Z".parse::<DateTime<Utc>>().expect("ts"));
        assert_eq!(runs[1].1, "2026-03-01T11:12:00Z".parse::<DateTime<Utc>>().expect("ts"));
    }
}
