//! Time source and the pending-timer queue.
//!
//! The core never sleeps: it records deadlines in a queue and the
//! embedding drives [`crate::Apkes::poll_timers`] whenever the earliest
//! deadline passes. Cancellation is by key; firing a cancelled or
//! superseded key is a no-op.

use crate::neighbor::NeighborHandle;
use std::time::Duration;

/// Monotonic time source, read at the top of every callback
pub trait Clock {
    /// Time elapsed since the subsystem started
    fn now(&self) -> Duration;
}

/// Wall-clock backed [`Clock`], starting at zero on construction
pub struct MonotonicClock {
    start: std::time::Instant,
}

impl MonotonicClock {
    /// A clock starting now
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// What to do when a deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Random wait before answering a HELLO expired
    HelloAckWait(NeighborHandle),
    /// Time to broadcast the next HELLO
    TrickleBroadcast,
    /// The current Trickle interval ended
    TrickleIntervalEnd,
    /// The HELLO answer window closed
    HelloWindowEnd,
    /// Start a keepalive pass
    UpdateCheck,
    /// Waited long enough for an UPDATEACK
    UpdateRetry,
    /// Send the next post-reboot REFRESH broadcast
    RefreshBroadcast,
}

/// Handle for cancelling a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey(u64);

struct TimerEntry {
    key: TimerKey,
    deadline: Duration,
    event: TimerEvent,
}

/// Pending timers, ordered by deadline on extraction
#[derive(Default)]
pub struct TimerQueue {
    entries: Vec<TimerEntry>,
    next_key: u64,
}

impl TimerQueue {
    /// Empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` at the absolute deadline
    pub fn schedule(&mut self, deadline: Duration, event: TimerEvent) -> TimerKey {
        let key = TimerKey(self.next_key);
        self.next_key += 1;
        self.entries.push(TimerEntry {
            key,
            deadline,
            event,
        });
        key
    }

    /// Cancel a pending timer; returns whether it was still pending
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        self.entries.len() != before
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return the earliest event whose deadline has passed
    pub fn pop_due(&mut self, now: Duration) -> Option<TimerEvent> {
        let position = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| e.deadline)
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(position).event)
    }

    /// Number of pending timers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(secs(3), TimerEvent::TrickleBroadcast);
        q.schedule(secs(1), TimerEvent::UpdateCheck);
        q.schedule(secs(2), TimerEvent::HelloWindowEnd);

        assert_eq!(q.pop_due(secs(5)), Some(TimerEvent::UpdateCheck));
        assert_eq!(q.pop_due(secs(5)), Some(TimerEvent::HelloWindowEnd));
        assert_eq!(q.pop_due(secs(5)), Some(TimerEvent::TrickleBroadcast));
        assert_eq!(q.pop_due(secs(5)), None);
    }

    #[test]
    fn test_future_deadline_not_due() {
        let mut q = TimerQueue::new();
        q.schedule(secs(10), TimerEvent::UpdateCheck);
        assert_eq!(q.pop_due(secs(9)), None);
        assert_eq!(q.next_deadline(), Some(secs(10)));
    }

    #[test]
    fn test_cancel_pending() {
        let mut q = TimerQueue::new();
        let key = q.schedule(secs(1), TimerEvent::TrickleBroadcast);
        assert!(q.cancel(key));
        assert!(!q.cancel(key));
        assert_eq!(q.pop_due(secs(2)), None);
    }

    #[test]
    fn test_equal_deadlines_all_fire() {
        let mut q = TimerQueue::new();
        q.schedule(secs(1), TimerEvent::UpdateCheck);
        q.schedule(secs(1), TimerEvent::UpdateRetry);
        assert!(q.pop_due(secs(1)).is_some());
        assert!(q.pop_due(secs(1)).is_some());
        assert!(q.pop_due(secs(1)).is_none());
    }
}
