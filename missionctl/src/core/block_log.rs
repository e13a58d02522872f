//! Bounded ring buffer of guard-block events with sliding-window counts.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::core::types::TaskId;

/// One transition blocked by its edge guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub mission_type: String,
    pub from_state: String,
    pub to_state: String,
    pub guard: String,
    pub worker: String,
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
}

impl BlockEvent {
    fn same_edge(&self, other: &BlockEvent) -> bool {
        self.mission_type == other.mission_type
            && self.from_state == other.from_state
            && self.to_state == other.to_state
            && self.guard == other.guard
    }
}

#[derive(Debug, Clone)]
pub struct BlockLog {
    events: VecDeque<BlockEvent>,
    capacity: usize,
    window: Duration,
}

impl BlockLog {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Append `event`, evicting the oldest past capacity, and return how many
    /// events for the same `(mission, from, to, guard)` fall inside the window
    /// ending at `event.at` (including this one).
    pub fn record(&mut self, event: BlockEvent) -> usize {
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        let cutoff = event.at - self.window;
        let count = self
            .events
            .iter()
            .filter(|e| e.at >= cutoff && e.same_edge(&event))
            .count()
            + 1;
        self.events.push_back(event);
        count
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn event(guard: &str, at: DateTime<Utc>) -> BlockEvent {
        BlockEvent {
            mission_type: "content".to_string(),
            from_state: "DRAFT".to_string(),
            to_state: "REVIEW".to_string(),
            guard: guard.to_string(),
            worker: "writer".to_string(),
            task_id: TaskId::new("t1"),
            at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn counts_matching_events_in_window() {
        let mut log = BlockLog::new(500, Duration::hours(24));
        assert_eq!(log.record(event("quality_approved", t0())), 1);
        assert_eq!(log.record(event("has_draft", t0())), 1);
        assert_eq!(
            log.record(event("quality_approved", t0() + Duration::hours(1))),
            2
        );
    }

    #[test]
    fn events_outside_window_are_not_counted() {
        let mut log = BlockLog::new(500, Duration::hours(24));
        log.record(event("quality_approved", t0()));
        let count = log.record(event("quality_approved", t0() + Duration::hours(25)));
        assert_eq!(count, 1);
    }

    #[test]
    fn oldest_events_are_evicted_past_capacity() {
        let mut log = BlockLog::new(2, Duration::hours(24));
        for i in 0..3 {
            log.record(event("quality_approved", t0() + Duration::minutes(i)));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.record(event("quality_approved", t0() + Duration::minutes(5))),
            2
        );
    }
}
