//! Wake-up cadence arithmetic.

use chrono::{DateTime, Duration, DurationRound, Utc};

use crate::core::types::AgentBinding;

/// Intervals at or above this many seconds run once an hour.
pub const HOURLY_INTERVAL_SECS: u64 = 3600;

/// When a worker fires within each hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Repeating cycle of `minutes`, starting at `offset` past the hour.
    Cycle { minutes: u32, offset: u32 },
    /// Once an hour at `minute`.
    Hourly { minute: u32 },
}

impl Cadence {
    /// Cadence for an agent, falling back to `default_cycle_minutes` when the
    /// agent sets no interval.
    pub fn for_agent(agent: &AgentBinding, default_cycle_minutes: u32) -> Self {
        match agent.heartbeat_interval {
            Some(secs) if secs >= HOURLY_INTERVAL_SECS => Self::Hourly {
                minute: agent.heartbeat_offset,
            },
            Some(secs) => Self::Cycle {
                minutes: u32::try_from(secs / 60).unwrap_or(u32::MAX),
                offset: agent.heartbeat_offset,
            },
            None => Self::Cycle {
                minutes: default_cycle_minutes,
                offset: agent.heartbeat_offset,
            },
        }
    }

    /// Length of one cycle in minutes (60 for hourly).
    pub fn cycle_minutes(&self) -> u32 {
        match self {
            Self::Cycle { minutes, .. } => *minutes,
            Self::Hourly { .. } => 60,
        }
    }

    pub fn offset(&self) -> u32 {
        match self {
            Self::Cycle { offset, .. } => *offset,
            Self::Hourly { minute } => *minute,
        }
    }

    /// Problem with this cadence, if it cannot be scheduled.
    pub fn check(&self) -> Option<String> {
        match *self {
            Self::Cycle { minutes, .. } if minutes == 0 => {
                Some("heartbeat_interval must be at least 60 seconds".to_string())
            }
            Self::Cycle { minutes, .. } if 60 % minutes != 0 => Some(format!(
                "a {minutes}-minute cycle does not divide the hour"
            )),
            Self::Cycle { minutes, offset } if offset >= minutes => Some(format!(
                "heartbeat_offset={offset} is outside the {minutes}-minute cycle"
            )),
            Self::Hourly { minute } if minute >= 60 => {
                Some(format!("heartbeat_offset={minute} is outside the hour"))
            }
            _ => None,
        }
    }

    /// Minutes past the hour at which this cadence fires, ascending.
    pub fn fire_minutes(&self) -> Vec<u32> {
        match *self {
            Self::Cycle { minutes, offset } if minutes > 0 => {
                (offset..60).step_by(minutes as usize).collect()
            }
            Self::Cycle { offset, .. } => vec![offset % 60],
            Self::Hourly { minute } => vec![minute % 60],
        }
    }

    /// First fire time strictly after `now`.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour_start = now
            .duration_trunc(Duration::hours(1))
            .unwrap_or(now);
        let minutes = self.fire_minutes();
        for hour in 0..=1 {
            for minute in &minutes {
                let at = hour_start + Duration::hours(hour) + Duration::minutes(i64::from(*minute));
                if at > now {
                    return at;
                }
            }
        }
        hour_start + Duration::hours(1)
    }
}
