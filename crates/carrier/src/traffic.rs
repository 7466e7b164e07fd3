//! Per-connection traffic accounting, congestion control and disconnect
//! detection.
//!
//! The send rate follows an additive-increase / multiplicative-decrease law.
//! Every [`CongestionConfig::evaluation_interval`], the packets resolved since
//! the previous evaluation are inspected: if too many were lost, or the RTT
//! rose past [`CongestionConfig::rtt_threshold`], the rate halves. Otherwise it
//! grows by [`CongestionConfig::send_rate_increase`]. The rate always stays
//! within [`CongestionConfig::min_send_rate`] and
//! [`CongestionConfig::max_send_rate`].

use {
    crate::{
        config::CongestionConfig,
        rtt::RttEstimator,
        stats::{Statistics, TrafficCounters},
    },
    core::time::Duration,
    log::trace,
    web_time::Instant,
};

/// Length of the window that [`TrafficController::last_second`] covers.
pub const STATS_WINDOW: Duration = Duration::from_secs(1);

/// How many packets must be resolved in a window before its loss and RTT are
/// trusted for disconnect detection.
pub const MIN_DETECTION_SAMPLES: u64 = 5;

#[derive(Debug, Clone)]
pub(crate) struct TrafficController {
    config: CongestionConfig,
    rtt: RttEstimator,
    send_rate: u32,
    lifetime: TrafficCounters,
    window: TrafficCounters,
    window_started_at: Instant,
    last_window: Option<TrafficCounters>,
    interval: TrafficCounters,
    evaluated_at: Instant,
}

impl TrafficController {
    pub fn new(config: CongestionConfig, now: Instant) -> Self {
        let send_rate = config
            .initial_send_rate
            .clamp(config.min_send_rate, config.max_send_rate);
        Self {
            config,
            rtt: RttEstimator::default(),
            send_rate,
            lifetime: TrafficCounters::default(),
            window: TrafficCounters::default(),
            window_started_at: now,
            last_window: None,
            interval: TrafficCounters::default(),
            evaluated_at: now,
        }
    }

    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub const fn send_rate(&self) -> u32 {
        self.send_rate
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        for counters in [&mut self.window, &mut self.interval] {
            counters.packets_sent += 1;
            counters.bytes_sent += bytes;
        }
    }

    pub fn on_packet_received(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        for counters in [&mut self.window, &mut self.interval] {
            counters.packets_received += 1;
            counters.bytes_received += bytes;
        }
    }

    pub fn on_packet_acked(&mut self, rtt: Duration) {
        self.rtt.update(rtt);
        for counters in [&mut self.window, &mut self.interval] {
            counters.packets_acked += 1;
            counters.rtt_sum += rtt;
            counters.rtt_samples += 1;
        }
    }

    pub fn on_packet_lost(&mut self) {
        for counters in [&mut self.window, &mut self.interval] {
            counters.packets_lost += 1;
        }
    }

    /// Advances the statistics window and evaluates congestion.
    ///
    /// Returns the new send rate if it changed.
    pub fn update(&mut self, now: Instant) -> Option<u32> {
        if now.saturating_duration_since(self.window_started_at) >= STATS_WINDOW {
            self.lifetime += self.window;
            self.last_window = Some(self.window);
            self.window = TrafficCounters::default();
            self.window_started_at = now;
        }

        if now.saturating_duration_since(self.evaluated_at) < self.config.evaluation_interval {
            return None;
        }
        let interval = core::mem::take(&mut self.interval);
        self.evaluated_at = now;
        if interval.resolved() == 0 {
            return None;
        }

        let loss = interval.loss();
        let rtt_too_high = self
            .config
            .rtt_threshold
            .is_some_and(|threshold| interval.mean_rtt().is_some_and(|rtt| rtt > threshold));
        let old_rate = self.send_rate;
        self.send_rate = if loss > self.config.loss_threshold || rtt_too_high {
            (old_rate / 2).max(self.config.min_send_rate)
        } else {
            old_rate
                .saturating_add(self.config.send_rate_increase)
                .min(self.config.max_send_rate)
        };

        if self.send_rate == old_rate {
            None
        } else {
            trace!(
                "send rate {old_rate} -> {} B/s (loss {:.1}%, rtt {:?})",
                self.send_rate,
                loss * 100.0,
                self.rtt.get()
            );
            Some(self.send_rate)
        }
    }

    /// Gets if the last complete window shows enough loss or latency to
    /// consider the connection dead.
    pub fn detects_disconnect(&self, loss_threshold: f32, rtt_threshold: Duration) -> bool {
        let Some(window) = self.last_window else {
            return false;
        };
        if window.resolved() < MIN_DETECTION_SAMPLES {
            return false;
        }
        window.loss() > loss_threshold
            || window.mean_rtt().is_some_and(|rtt| rtt > rtt_threshold)
    }

    pub fn last_second(&self) -> Statistics {
        self.last_window.map_or_else(
            || Statistics {
                rtt: self.rtt.get(),
                ..Default::default()
            },
            |window| window.to_statistics(window.mean_rtt().unwrap_or_else(|| self.rtt.get())),
        )
    }

    pub fn lifetime(&self) -> Statistics {
        (self.lifetime + self.window).to_statistics(self.rtt.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CongestionConfig {
        CongestionConfig {
            initial_send_rate: 64_000,
            min_send_rate: 1000,
            max_send_rate: 64_000,
            send_rate_increase: 8000,
            loss_threshold: 0.1,
            rtt_threshold: None,
            evaluation_interval: Duration::from_millis(250),
        }
    }

    fn step(
        traffic: &mut TrafficController,
        now: &mut Instant,
        acked: u32,
        lost: u32,
    ) -> Option<u32> {
        for _ in 0..acked {
            traffic.on_packet_acked(Duration::from_millis(20));
        }
        for _ in 0..lost {
            traffic.on_packet_lost();
        }
        *now += Duration::from_millis(250);
        traffic.update(*now)
    }

    #[test]
    fn loss_halves_rate_to_floor() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        assert_eq!(Some(32_000), step(&mut traffic, &mut now, 5, 5));
        assert_eq!(Some(16_000), step(&mut traffic, &mut now, 5, 5));
        for _ in 0..10 {
            step(&mut traffic, &mut now, 5, 5);
        }
        assert_eq!(1000, traffic.send_rate());
        assert_eq!(None, step(&mut traffic, &mut now, 5, 5));
    }

    #[test]
    fn recovers_without_loss() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        step(&mut traffic, &mut now, 0, 10);
        assert_eq!(Some(40_000), step(&mut traffic, &mut now, 10, 0));
        for _ in 0..10 {
            step(&mut traffic, &mut now, 10, 0);
        }
        assert_eq!(64_000, traffic.send_rate());
    }

    #[test]
    fn idle_interval_keeps_rate() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        step(&mut traffic, &mut now, 0, 10);
        assert_eq!(None, step(&mut traffic, &mut now, 0, 0));
        assert_eq!(32_000, traffic.send_rate());
    }

    #[test]
    fn detection_needs_complete_window() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        for _ in 0..10 {
            traffic.on_packet_lost();
        }
        assert!(!traffic.detects_disconnect(0.5, Duration::from_secs(1)));

        now += STATS_WINDOW;
        traffic.update(now);
        assert!(traffic.detects_disconnect(0.5, Duration::from_secs(1)));
        assert_eq!(10, traffic.lifetime().packets_lost);
        assert!((traffic.last_second().packet_loss - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn detection_ignores_few_samples() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        traffic.on_packet_lost();
        now += STATS_WINDOW;
        traffic.update(now);
        assert!(!traffic.detects_disconnect(0.5, Duration::from_secs(1)));
    }

    #[test]
    fn detection_by_rtt() {
        let mut now = Instant::now();
        let mut traffic = TrafficController::new(config(), now);
        for _ in 0..10 {
            traffic.on_packet_acked(Duration::from_millis(200));
        }
        now += STATS_WINDOW;
        traffic.update(now);
        assert!(traffic.detects_disconnect(0.5, Duration::from_millis(100)));
        assert!(!traffic.detects_disconnect(0.5, Duration::from_millis(300)));
    }
}
