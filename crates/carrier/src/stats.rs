//! Traffic statistics reported for each connection.

use {
    crate::connection::ConnectionState,
    core::time::Duration,
    derive_more::{Add, AddAssign},
};

/// Traffic measured over some period of time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Statistics {
    /// Round-trip time.
    ///
    /// For a one-second window this is the mean of the samples taken in that
    /// window, falling back to the smoothed estimate if there were none.
    pub rtt: Duration,
    /// Fraction of resolved packets which were lost, from `0.0` to `1.0`.
    ///
    /// Only packets which asked to be acknowledged count.
    pub packet_loss: f32,
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Sent packets which were acknowledged by the peer.
    pub packets_acked: u64,
    /// Sent packets which were declared lost.
    pub packets_lost: u64,
    /// Bytes sent, including headers.
    pub bytes_sent: u64,
    /// Bytes received, including headers.
    pub bytes_received: u64,
}

/// Instantaneous state of a connection's data flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowInformation {
    /// Current send rate allowed by congestion control, in bytes per second.
    pub send_rate: u32,
    /// Bytes in packets which were sent but not yet acknowledged or lost.
    pub bytes_in_flight: usize,
    /// Messages queued for sending which have not fully gone out yet.
    pub queued_send_messages: usize,
    /// Messages received which the application has not read yet.
    pub queued_receive_messages: usize,
    /// Bytes held for messages which are still being reassembled, or which
    /// wait for an earlier reliable message to arrive.
    pub buffered_receive_bytes: usize,
}

/// Everything [`CarrierHandle::query_statistics`] reports about one
/// connection.
///
/// [`CarrierHandle::query_statistics`]: crate::CarrierHandle::query_statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionStatistics {
    /// Lifecycle state of the connection.
    pub state: ConnectionState,
    /// Traffic in the most recently completed one-second window.
    pub last_second: Statistics,
    /// Traffic since the connection was created.
    pub lifetime: Statistics,
    /// Current flow state.
    pub flow: FlowInformation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Add, AddAssign)]
pub(crate) struct TrafficCounters {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_sum: Duration,
    pub rtt_samples: u64,
}

impl TrafficCounters {
    pub fn resolved(&self) -> u64 {
        self.packets_acked + self.packets_lost
    }

    pub fn loss(&self) -> f32 {
        let resolved = self.resolved();
        if resolved == 0 {
            0.0
        } else {
            #[expect(clippy::cast_precision_loss, reason = "ratio does not need precision")]
            let loss = self.packets_lost as f32 / resolved as f32;
            loss
        }
    }

    pub fn mean_rtt(&self) -> Option<Duration> {
        u32::try_from(self.rtt_samples)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.rtt_sum / n)
    }

    pub fn to_statistics(self, rtt: Duration) -> Statistics {
        Statistics {
            rtt,
            packet_loss: self.loss(),
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            packets_acked: self.packets_acked,
            packets_lost: self.packets_lost,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}
