//! # Burst Admission
//!
//! Decides how many packets may leave in the current pacing interval.
//!
//! The goal is to flush whatever is queued over the next
//! `max_bursts_per_frame` intervals while staying at `target_burst_size` when
//! possible. Sending more than about a dozen packets back to back hurts on
//! real networks, and sending sooner leaves more time for retransmits, so the
//! quota grows with the queue but never beyond `max_burst_size`.
//!
//! Three slots of lookahead smooth the quota: a spike raises all three slots
//! at once, but a drop only takes effect after it has propagated through all
//! of them.

use quanta::Instant;
use std::time::Duration;

use crate::config::PacingConfig;

/// Snapshot of the burst controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstState {
    /// Packets released in the current interval.
    pub current_burst_size: usize,
    /// Quota of the current interval.
    pub current_max_burst_size: usize,
    pub next_max_burst_size: usize,
    pub next_next_max_burst_size: usize,
    /// End of the current interval; `None` before the first interval.
    pub burst_window_end: Option<Instant>,
}

/// Per-interval admission control.
#[derive(Debug, Clone)]
pub struct BurstController {
    target_burst_size: usize,
    max_burst_size: usize,
    max_bursts_per_frame: usize,
    pacing_interval: Duration,
    state: BurstState,
}

impl BurstController {
    pub fn new(config: &PacingConfig) -> Self {
        let target = config.target_burst_size;
        BurstController {
            target_burst_size: target,
            max_burst_size: config.max_burst_size,
            max_bursts_per_frame: config.max_bursts_per_frame.max(1),
            pacing_interval: config.pacing_interval,
            state: BurstState {
                current_burst_size: 0,
                current_max_burst_size: target,
                next_max_burst_size: target,
                next_next_max_burst_size: target,
                burst_window_end: None,
            },
        }
    }

    /// Whether a new interval must start at `now`.
    pub fn window_expired(&self, now: Instant) -> bool {
        self.state.burst_window_end.map_or(true, |end| now >= end)
    }

    /// Open a new pacing interval sized for `queued` pending packets.
    pub fn start_interval(&mut self, now: Instant, queued: usize) {
        let target = (queued / self.max_bursts_per_frame)
            .max(self.target_burst_size)
            .min(self.max_burst_size);

        let s = &mut self.state;
        s.current_burst_size = 0;
        s.burst_window_end = Some(now + self.pacing_interval);
        s.current_max_burst_size = s.next_max_burst_size.max(target);
        s.next_max_burst_size = s.next_next_max_burst_size.max(target);
        s.next_next_max_burst_size = target;
    }

    /// Whether the current interval's quota is used up.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.state.current_burst_size >= self.state.current_max_burst_size
    }

    /// Count one packet against the current quota.
    #[inline]
    pub fn on_packet_sent(&mut self) {
        self.state.current_burst_size += 1;
    }

    /// Time left until the current interval ends.
    pub fn time_until_window_end(&self, now: Instant) -> Duration {
        self.state
            .burst_window_end
            .map_or(Duration::ZERO, |end| end.saturating_duration_since(now))
    }

    pub fn state(&self) -> &BurstState {
        &self.state
    }
}
