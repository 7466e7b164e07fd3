//! Configuration of a [`Carrier`](crate::Carrier).

use {
    carrier_io::AddressFamily,
    core::time::Duration,
    derive_more::{Display, Error},
};

/// Settings of a [`Carrier`](crate::Carrier).
///
/// # Examples
///
/// ```
/// # use {carrier::CarrierConfig, core::time::Duration};
/// let config = CarrierConfig::default()
///     .with_port(7777)
///     .with_max_connections(16)
///     .with_connection_timeout(Duration::from_secs(10));
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CarrierConfig {
    /// Local port to bind to, or 0 to let the OS pick one.
    pub port: u16,
    /// IP version to bind to.
    pub address_family: AddressFamily,
    /// Whether connections are closed when they time out or their quality
    /// drops below the detection thresholds.
    pub enable_disconnect_detection: bool,
    /// Packet loss in the last second, from `0.0` to `1.0`, above which a
    /// connection is considered dead.
    pub disconnect_detection_packet_loss_threshold: f32,
    /// Mean RTT in the last second above which a connection is considered
    /// dead.
    pub disconnect_detection_rtt_threshold: Duration,
    /// How long a [`CarrierThread`](crate::CarrierThread) waits between
    /// updates.
    pub thread_update_time: Duration,
    /// Whether every command from a [`CarrierHandle`](crate::CarrierHandle)
    /// wakes a [`CarrierThread`](crate::CarrierThread) immediately.
    pub thread_instant_response: bool,
    /// How long a connection may go without receiving anything.
    pub connection_timeout: Duration,
    /// How long a handshake may take before the connection attempt fails.
    pub handshake_timeout: Duration,
    /// How often a connect request is resent while the handshake is pending.
    pub handshake_retry_interval: Duration,
    /// How long a closing connection waits for its disconnect notice to be
    /// acknowledged.
    pub disconnect_linger: Duration,
    /// How long a connection may go without sending anything before it sends
    /// a keep-alive.
    pub keep_alive_interval: Duration,
    /// Size of the buffer that a UDP driver receives datagrams into.
    pub driver_receive_buffer_size: usize,
    /// Bytes that a UDP driver may queue while the socket is not ready.
    pub driver_send_buffer_size: usize,
    /// Maximum number of connections, including ones still in their
    /// handshake.
    pub max_connections: usize,
    /// Bytes each connection may spend on reassembling fragmented messages and
    /// buffering out-of-order reliable messages.
    pub max_reassembly_memory: usize,
    /// Version sent in connect requests. Peers must use the same version.
    pub protocol_version: u32,
    /// Send rate control.
    pub congestion: CongestionConfig,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            port: 0,
            address_family: AddressFamily::V4,
            enable_disconnect_detection: true,
            disconnect_detection_packet_loss_threshold: 0.3,
            disconnect_detection_rtt_threshold: Duration::from_millis(500),
            thread_update_time: Duration::from_millis(30),
            thread_instant_response: false,
            connection_timeout: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(5000),
            handshake_retry_interval: Duration::from_millis(100),
            disconnect_linger: Duration::from_millis(500),
            keep_alive_interval: Duration::from_millis(100),
            driver_receive_buffer_size: 64 * 1024,
            driver_send_buffer_size: 256 * 1024,
            max_connections: 64,
            max_reassembly_memory: 4 * 1024 * 1024,
            protocol_version: 1,
            congestion: CongestionConfig::default(),
        }
    }
}

/// Additive-increase / multiplicative-decrease send rate control.
///
/// Every [`CongestionConfig::evaluation_interval`], the rate halves if the
/// packets resolved in that interval show too much loss or latency, and
/// otherwise grows by [`CongestionConfig::send_rate_increase`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CongestionConfig {
    /// Send rate of a new connection, in bytes per second. Defaults to
    /// 256 KiB/s.
    pub initial_send_rate: u32,
    /// Lowest send rate, in bytes per second. Defaults to 1000.
    pub min_send_rate: u32,
    /// Highest send rate, in bytes per second. Defaults to 4 MiB/s.
    pub max_send_rate: u32,
    /// Bytes per second added after an interval without congestion. Defaults
    /// to 8 KiB/s.
    pub send_rate_increase: u32,
    /// Packet loss, from `0.0` to `1.0`, above which an interval counts as
    /// congested.
    pub loss_threshold: f32,
    /// Mean RTT above which an interval counts as congested.
    pub rtt_threshold: Option<Duration>,
    /// How often the send rate is reevaluated.
    pub evaluation_interval: Duration,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_send_rate: 256 * 1024,
            min_send_rate: 1000,
            max_send_rate: 4 * 1024 * 1024,
            send_rate_increase: 8 * 1024,
            loss_threshold: 0.1,
            rtt_threshold: None,
            evaluation_interval: Duration::from_millis(250),
        }
    }
}

/// [`CarrierConfig::validate`] found an unusable value.
#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum ConfigError {
    /// A duration that must be positive was zero.
    #[display("`{name}` must be greater than zero")]
    ZeroDuration {
        /// Name of the option.
        name: &'static str,
    },
    /// A size that must be positive was zero.
    #[display("`{name}` must be greater than zero")]
    ZeroSize {
        /// Name of the option.
        name: &'static str,
    },
    /// A ratio was outside of `0.0..=1.0`.
    #[display("`{name}` must be between 0 and 1, was {value}")]
    InvalidRatio {
        /// Name of the option.
        name: &'static str,
        /// Value of the option.
        value: f32,
    },
    /// The send rate bounds are inconsistent.
    #[display("send rates must satisfy 0 < min ({min}) <= max ({max})")]
    InvalidSendRates {
        /// Configured minimum.
        min: u32,
        /// Configured maximum.
        max: u32,
    },
}

macro_rules! with {
    ($($(#[$meta:meta])* $fn:ident($field:ident: $ty:ty);)*) => {
        $(
            $(#[$meta])*
            #[must_use]
            pub const fn $fn(mut self, $field: $ty) -> Self {
                self.$field = $field;
                self
            }
        )*
    };
}

impl CarrierConfig {
    with! {
        /// Sets [`CarrierConfig::port`].
        with_port(port: u16);
        /// Sets [`CarrierConfig::address_family`].
        with_address_family(address_family: AddressFamily);
        /// Sets [`CarrierConfig::enable_disconnect_detection`].
        with_disconnect_detection(enable_disconnect_detection: bool);
        /// Sets [`CarrierConfig::disconnect_detection_packet_loss_threshold`].
        with_disconnect_detection_packet_loss_threshold(disconnect_detection_packet_loss_threshold: f32);
        /// Sets [`CarrierConfig::disconnect_detection_rtt_threshold`].
        with_disconnect_detection_rtt_threshold(disconnect_detection_rtt_threshold: Duration);
        /// Sets [`CarrierConfig::thread_update_time`].
        with_thread_update_time(thread_update_time: Duration);
        /// Sets [`CarrierConfig::thread_instant_response`].
        with_thread_instant_response(thread_instant_response: bool);
        /// Sets [`CarrierConfig::connection_timeout`].
        with_connection_timeout(connection_timeout: Duration);
        /// Sets [`CarrierConfig::handshake_timeout`].
        with_handshake_timeout(handshake_timeout: Duration);
        /// Sets [`CarrierConfig::handshake_retry_interval`].
        with_handshake_retry_interval(handshake_retry_interval: Duration);
        /// Sets [`CarrierConfig::disconnect_linger`].
        with_disconnect_linger(disconnect_linger: Duration);
        /// Sets [`CarrierConfig::keep_alive_interval`].
        with_keep_alive_interval(keep_alive_interval: Duration);
        /// Sets [`CarrierConfig::driver_receive_buffer_size`].
        with_driver_receive_buffer_size(driver_receive_buffer_size: usize);
        /// Sets [`CarrierConfig::driver_send_buffer_size`].
        with_driver_send_buffer_size(driver_send_buffer_size: usize);
        /// Sets [`CarrierConfig::max_connections`].
        with_max_connections(max_connections: usize);
        /// Sets [`CarrierConfig::max_reassembly_memory`].
        with_max_reassembly_memory(max_reassembly_memory: usize);
        /// Sets [`CarrierConfig::protocol_version`].
        with_protocol_version(protocol_version: u32);
        /// Sets [`CarrierConfig::congestion`].
        with_congestion(congestion: CongestionConfig);
    }

    /// Checks that every option has a usable value.
    ///
    /// # Errors
    ///
    /// Errors with the first unusable option found.
    ///
    /// # Examples
    ///
    /// ```
    /// # use {carrier::{CarrierConfig, ConfigError}, core::time::Duration};
    /// let config = CarrierConfig::default().with_keep_alive_interval(Duration::ZERO);
    /// assert_eq!(
    ///     Err(ConfigError::ZeroDuration { name: "keep_alive_interval" }),
    ///     config.validate()
    /// );
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("thread_update_time", self.thread_update_time),
            ("connection_timeout", self.connection_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("handshake_retry_interval", self.handshake_retry_interval),
            ("keep_alive_interval", self.keep_alive_interval),
            (
                "congestion.evaluation_interval",
                self.congestion.evaluation_interval,
            ),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        for (name, value) in [
            ("driver_receive_buffer_size", self.driver_receive_buffer_size),
            ("driver_send_buffer_size", self.driver_send_buffer_size),
            ("max_connections", self.max_connections),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize { name });
            }
        }

        for (name, value) in [
            (
                "disconnect_detection_packet_loss_threshold",
                self.disconnect_detection_packet_loss_threshold,
            ),
            ("congestion.loss_threshold", self.congestion.loss_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRatio { name, value });
            }
        }

        let CongestionConfig {
            min_send_rate: min,
            max_send_rate: max,
            ..
        } = self.congestion;
        if min == 0 || min > max {
            return Err(ConfigError::InvalidSendRates { min, max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(Ok(()), CarrierConfig::default().validate());
    }

    #[test]
    fn default_send_rates() {
        let congestion = CongestionConfig::default();
        assert_eq!(256 * 1024, congestion.initial_send_rate);
        assert_eq!(1000, congestion.min_send_rate);
        assert_eq!(4 * 1024 * 1024, congestion.max_send_rate);
        assert_eq!(8 * 1024, congestion.send_rate_increase);
        assert!(
            (congestion.min_send_rate..=congestion.max_send_rate)
                .contains(&congestion.initial_send_rate)
        );
    }

    #[test]
    fn bad_ratio() {
        let config = CarrierConfig::default().with_disconnect_detection_packet_loss_threshold(1.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRatio { value, .. }) if (value - 1.5).abs() < f32::EPSILON
        ));
    }

    #[test]
    fn bad_send_rates() {
        let config = CarrierConfig::default().with_congestion(CongestionConfig {
            min_send_rate: 10_000,
            max_send_rate: 5_000,
            ..Default::default()
        });
        assert_eq!(
            Err(ConfigError::InvalidSendRates {
                min: 10_000,
                max: 5_000
            }),
            config.validate()
        );
    }

    #[test]
    fn zero_connections() {
        let config = CarrierConfig::default().with_max_connections(0);
        assert_eq!(
            Err(ConfigError::ZeroSize {
                name: "max_connections"
            }),
            config.validate()
        );
    }
}
