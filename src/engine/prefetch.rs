//! Prefetch timers.
//!
//! The engine owns no timer threads. Each prefetch policy keeps a deadline
//! here and the host's event loop calls [`PrefetchScheduler::poll`] with the
//! current time; whatever is due comes back as a [`PrefetchTask`].
//!
//! - border prefetch waits for the view to be idle, then repeats on an
//!   interval until the borders are exhausted
//! - adjacent prefetch runs once, shortly after a viewport update
//! - part prefetch runs once, shortly after the visible part was loaded

use std::time::{Duration, Instant};

/// Work that became due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchTask {
    Border,
    Adjacent,
    Part { part: i32, mode: i32 },
}

/// Deadline-based prefetch timers.
#[derive(Debug, Clone)]
pub struct PrefetchScheduler {
    idle_delay: Duration,
    interval: Duration,
    adjacent_delay: Duration,
    part_delay: Duration,

    idle_at: Option<Instant>,
    interval_at: Option<Instant>,
    adjacent_at: Option<Instant>,
    part_at: Option<(Instant, i32, i32)>,
}

impl PrefetchScheduler {
    pub fn new(
        idle_delay: Duration,
        interval: Duration,
        adjacent_delay: Duration,
        part_delay: Duration,
    ) -> Self {
        Self {
            idle_delay,
            interval,
            adjacent_delay,
            part_delay,
            idle_at: None,
            interval_at: None,
            adjacent_at: None,
            part_at: None,
        }
    }

    /// Restart the border idle timer, cancelling any running interval.
    pub fn reset(&mut self, now: Instant) {
        self.interval_at = None;
        self.idle_at = Some(now + self.idle_delay);
    }

    /// Stop border prefetching.
    pub fn clear(&mut self) {
        self.idle_at = None;
        self.interval_at = None;
    }

    pub fn is_border_active(&self) -> bool {
        self.idle_at.is_some() || self.interval_at.is_some()
    }

    pub fn schedule_adjacent(&mut self, now: Instant) {
        self.adjacent_at = Some(now + self.adjacent_delay);
    }

    /// Schedule a part prefetch; a later call replaces an earlier one.
    pub fn schedule_part(&mut self, now: Instant, part: i32, mode: i32) {
        self.part_at = Some((now + self.part_delay, part, mode));
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.idle_at,
            self.interval_at,
            self.adjacent_at,
            self.part_at.map(|(at, _, _)| at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Take every task whose deadline has passed.
    ///
    /// The border task re-arms itself on the interval; the caller stops it
    /// with [`Self::clear`] once there is nothing left to fetch.
    pub fn poll(&mut self, now: Instant) -> Vec<PrefetchTask> {
        let mut due = Vec::new();

        if self.adjacent_at.is_some_and(|at| at <= now) {
            self.adjacent_at = None;
            due.push(PrefetchTask::Adjacent);
        }

        if let Some((at, part, mode)) = self.part_at {
            if at <= now {
                self.part_at = None;
                due.push(PrefetchTask::Part { part, mode });
            }
        }

        if let Some(at) = self.idle_at {
            if at <= now {
                self.idle_at = None;
                self.interval_at = Some(at + self.interval);
                due.push(PrefetchTask::Border);
            }
        } else if let Some(at) = self.interval_at {
            if at <= now {
                // Skip missed ticks rather than bursting.
                let mut next = at + self.interval;
                while next <= now && !self.interval.is_zero() {
                    next += self.interval;
                }
                self.interval_at = Some(next);
                due.push(PrefetchTask::Border);
            }
        }

        due
    }
}

// =============================================================================
// Tests
// =============================================================================
