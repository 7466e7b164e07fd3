//! See [`RttEstimator`].

use core::time::Duration;

/// Smoothed round-trip time estimate of a connection.
///
/// This follows the estimator described in [RFC 9002 Section 5], as
/// implemented by [`quinn-proto`'s `RttEstimator`](https://github.com/quinn-rs/quinn/blob/411abe9/quinn-proto/src/connection/paths.rs#L151).
///
/// [RFC 9002 Section 5]: https://www.rfc-editor.org/rfc/rfc9002.html#section-5
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
    num_samples: u64,
}

const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// RTT assumed for a connection before any samples have been taken.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

impl RttEstimator {
    /// Creates an estimator which assumes `initial_rtt` until it receives
    /// samples.
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
            min: initial_rtt,
            num_samples: 0,
        }
    }

    /// Gets the smoothed RTT.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Gets the most recent sample, or the initial RTT if there are none.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Gets the lowest sample seen.
    ///
    /// # Examples
    ///
    /// ```
    /// # use {carrier::rtt::RttEstimator, core::time::Duration};
    /// let mut rtt = RttEstimator::new(Duration::from_millis(100));
    /// rtt.update(Duration::from_millis(60));
    /// rtt.update(Duration::from_millis(90));
    /// assert_eq!(Duration::from_millis(60), rtt.min());
    ///
    /// rtt.update(Duration::from_millis(40));
    /// assert_eq!(Duration::from_millis(40), rtt.min());
    /// ```
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Gets how many samples this estimate is built from.
    #[must_use]
    pub const fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Probe timeout: how long to wait for an acknowledgement before a
    /// reliable fragment is sent again.
    ///
    /// See [RFC 9002 Section 6.2.1](https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.1).
    #[must_use]
    pub fn pto(&self) -> Duration {
        self.smoothed + (self.var * 4).max(TIMER_GRANULARITY)
    }

    /// Takes a new RTT sample into account.
    ///
    /// The first sample replaces the initial estimate outright.
    pub fn update(&mut self, rtt: Duration) {
        self.latest = rtt;
        if self.num_samples == 0 {
            self.smoothed = rtt;
            self.var = rtt / 2;
            self.min = rtt;
        } else {
            self.min = self.min.min(rtt);
            let var_sample = self.smoothed.abs_diff(rtt);
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = (7 * self.smoothed + rtt) / 8;
        }
        self.num_samples += 1;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_replaces_initial() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(20));
        assert_eq!(Duration::from_millis(20), rtt.get());
        assert_eq!(Duration::from_millis(20), rtt.min());
        assert_eq!(1, rtt.num_samples());
    }

    #[test]
    fn converges() {
        let mut rtt = RttEstimator::default();
        for _ in 0..100 {
            rtt.update(Duration::from_millis(50));
        }
        assert_eq!(Duration::from_millis(50), rtt.get());
        assert!(rtt.pto() >= Duration::from_millis(51));
        assert!(rtt.pto() < Duration::from_millis(60));
    }
}
