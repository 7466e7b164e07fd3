//! Millisecond clock shared between peers.

use {core::time::Duration, web_time::Instant};

/// Local millisecond clock, optionally shifted to follow a host's clock.
///
/// Times are `u32` milliseconds and wrap around after about 49 days.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
    offset: u32,
}

impl Clock {
    pub const fn new(epoch: Instant) -> Self {
        Self { epoch, offset: 0 }
    }

    fn local_time(&self, now: Instant) -> u32 {
        #[expect(clippy::cast_possible_truncation, reason = "clock wraps around")]
        let millis = now.saturating_duration_since(self.epoch).as_millis() as u32;
        millis
    }

    /// Gets the clock time at `now`.
    pub fn time_at(&self, now: Instant) -> u32 {
        self.local_time(now).wrapping_add(self.offset)
    }

    /// Adjusts this clock so that `now` reads as the host's time, given that
    /// the host sent `host_time` half a round trip ago.
    pub fn sync(&mut self, now: Instant, host_time: u32, rtt: Duration) {
        #[expect(clippy::cast_possible_truncation, reason = "clock wraps around")]
        let half_rtt = (rtt / 2).as_millis() as u32;
        let target = host_time.wrapping_add(half_rtt);
        self.offset = target.wrapping_sub(self.local_time(now));
    }

    /// Goes back to the unshifted local clock.
    pub const fn reset(&mut self) {
        self.offset = 0;
    }
}

/// Clock synchronization settings of a carrier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClockSync {
    pub interval: Duration,
    pub is_host: bool,
    pub last_sent_at: Option<Instant>,
}

impl ClockSync {
    /// Gets if a host should send its clock now.
    pub fn should_send(&mut self, now: Instant) -> bool {
        if !self.is_host {
            return false;
        }
        let due = self
            .last_sent_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
        if due {
            self.last_sent_at = Some(now);
        }
        due
    }
}
