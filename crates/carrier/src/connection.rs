//! Identity, lifecycle state and per-connection protocol state.

use {
    crate::{
        callback::Callback,
        channel::{ChannelIndex, Priority, Reliability, SendOptions},
        config::CarrierConfig,
        packet::{Packet, SystemMessage},
        recv::{Receiver, RecvError},
        send::{OutgoingMessage, Probe, Sender},
        stats::{ConnectionStatistics, FlowInformation},
        traffic::TrafficController,
    },
    carrier_io::SecurityError,
    core::{fmt, net::SocketAddr},
    derive_more::Display,
    log::{debug, trace},
    octs::{Bytes, BytesMut, EncodeLen, Write},
    web_time::Instant,
};

/// Opaque identifier of a connection inside one [`Carrier`].
///
/// IDs are never reused by the same carrier, so a stale ID can never refer to
/// a newer connection.
///
/// [`Carrier`]: crate::Carrier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Never refers to a connection.
    ///
    /// Returned by [`CarrierHandle::connect`] when a connection could not be
    /// started.
    ///
    /// [`CarrierHandle::connect`]: crate::CarrierHandle::connect
    pub const INVALID: Self = Self(0);

    /// Refers to every connection at once, where an operation supports it.
    pub const ALL: Self = Self(u32::MAX);

    /// Creates an ID from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Gets the raw value of this ID.
    #[must_use]
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Gets if this is neither [`ConnectionId::INVALID`] nor
    /// [`ConnectionId::ALL`].
    #[must_use]
    pub const fn is_specific(self) -> bool {
        self.0 != Self::INVALID.0 && self.0 != Self::ALL.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::INVALID => f.write_str("ConnectionId(INVALID)"),
            Self::ALL => f.write_str("ConnectionId(ALL)"),
            Self(raw) => f.debug_tuple("ConnectionId").field(&raw).finish(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection.
///
/// ```text
/// Connecting --> Connected --> Disconnecting --> Disconnected
///     |                |            ^                ^
///     +----------------|------------+                |
///     +----------------+-----------------------------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// The handshake is in progress.
    Connecting,
    /// The handshake completed and messages may be exchanged.
    Connected,
    /// The connection is closing and waits for its disconnect notice to be
    /// acknowledged.
    Disconnecting,
    /// The connection is gone, or never existed.
    #[default]
    Disconnected,
}

/// Why a connection ended or failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// This side closed the connection.
    #[display("disconnected by user")]
    UserRequested,
    /// The peer closed the connection.
    #[display("disconnected by peer")]
    RemoteRequested,
    /// Nothing was received from the peer for too long.
    #[display("connection timed out")]
    Timeout,
    /// Packet loss or latency crossed the disconnect detection thresholds.
    #[display("connection quality too low")]
    DisconnectDetected,
    /// The driver failed to send to the peer.
    #[display("driver error")]
    DriverError,
    /// The handshake refused the connection.
    #[display("handshake rejected")]
    HandshakeRejected,
    /// The handshake did not complete in time.
    #[display("handshake timed out")]
    HandshakeTimeout,
    /// The peers run different protocol versions.
    #[display("protocol version mismatch")]
    VersionMismatch,
    /// The peer tried to connect again while already connected.
    #[display("already connected")]
    WasAlreadyConnected,
    /// The carrier shut down.
    #[display("shutting down")]
    ShuttingDown,
    /// The connection was deleted through a debug operation.
    #[display("deleted for debugging")]
    DebugDeleted,
    /// The peer kept sending packets which could not be decoded.
    #[display("too many bad packets")]
    BadPackets,
    /// The peer sent a reliable message which cannot fit into
    /// [`CarrierConfig::max_reassembly_memory`].
    ///
    /// [`CarrierConfig::max_reassembly_memory`]: crate::CarrierConfig::max_reassembly_memory
    #[display("message too large to reassemble")]
    MessageTooLarge,
}

impl DisconnectReason {
    const ALL: [Self; 13] = [
        Self::UserRequested,
        Self::RemoteRequested,
        Self::Timeout,
        Self::DisconnectDetected,
        Self::DriverError,
        Self::HandshakeRejected,
        Self::HandshakeTimeout,
        Self::VersionMismatch,
        Self::WasAlreadyConnected,
        Self::ShuttingDown,
        Self::DebugDeleted,
        Self::BadPackets,
        Self::MessageTooLarge,
    ];

    /// Gets the code carried by a disconnect notice for this reason.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::DisconnectReason;
    /// let code = DisconnectReason::VersionMismatch.to_code();
    /// assert_eq!(Some(DisconnectReason::VersionMismatch), DisconnectReason::from_code(code));
    /// assert_eq!(None, DisconnectReason::from_code(200));
    /// ```
    #[must_use]
    pub const fn to_code(self) -> u8 {
        self as u8
    }

    /// Gets the reason carried by a disconnect notice code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Gets the reason that the receiver of a disconnect notice reports.
    ///
    /// A peer closing on request of its user is reported as
    /// [`DisconnectReason::RemoteRequested`]; every other reason is kept.
    #[must_use]
    pub const fn remote(self) -> Self {
        match self {
            Self::UserRequested => Self::RemoteRequested,
            other => other,
        }
    }
}

/// Which side started the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Acceptor,
}

/// This many undecodable packets in a row close the connection.
pub(crate) const BAD_PACKET_LIMIT: u32 = 32;

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub role: Role,
    pub state: ConnectionState,
    /// Whether the application knows about this connection.
    pub visible: bool,
    pub created_at: Instant,
    pub last_recv_at: Instant,
    pub last_send_at: Instant,
    pub last_request_at: Option<Instant>,
    pub disconnecting_since: Option<Instant>,
    /// Delete after the next flush.
    pub closed: bool,
    /// Handshake payload: our request as initiator, our reply as acceptor.
    pub handshake_payload: Bytes,
    pub bad_packets: u32,
    pub sender: Sender,
    pub receiver: Receiver,
    pub traffic: TrafficController,
    /// Messages received for the application, not yet handed to the registry.
    pub inbox: Vec<(ChannelIndex, Bytes)>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        role: Role,
        mtu: usize,
        config: &CarrierConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            addr,
            role,
            state: ConnectionState::Connecting,
            visible: role == Role::Initiator,
            created_at: now,
            last_recv_at: now,
            last_send_at: now,
            last_request_at: None,
            disconnecting_since: None,
            closed: false,
            handshake_payload: Bytes::new(),
            bad_packets: 0,
            sender: Sender::new(mtu, now),
            receiver: Receiver::new(),
            traffic: TrafficController::new(config.congestion, now),
            inbox: Vec::new(),
        }
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{} ({}): {:?} -> {state:?}", self.id, self.addr, self.state);
            self.state = state;
        }
    }

    pub fn send(&mut self, payload: Bytes, options: SendOptions, callback: Option<Callback>) {
        self.sender.enqueue(OutgoingMessage {
            payload,
            options,
            callback,
        });
    }

    pub fn send_system(&mut self, msg: &SystemMessage, reliability: Reliability) {
        let mut buf = BytesMut::with_capacity(msg.encode_len());
        buf.write(msg)
            .expect("BytesMut should grow the buffer when writing over capacity");
        let options = SendOptions {
            reliability,
            priority: Priority::SYSTEM,
            channel: ChannelIndex::SYSTEM,
        };
        self.send(buf.freeze(), options, None);
    }

    /// Processes a decoded packet from the peer, returning every message which
    /// became deliverable.
    ///
    /// A packet with a reliable frame that did not fit into `max_mem` is not
    /// acknowledged, so the peer sends the frame again later.
    ///
    /// # Errors
    ///
    /// Errors with [`DisconnectReason::MessageTooLarge`] if the peer sent a
    /// reliable message that can never fit into `max_mem`.
    pub fn on_packet(
        &mut self,
        now: Instant,
        max_mem: usize,
        len: usize,
        packet: Packet,
        security_errors: &mut Vec<SecurityError>,
    ) -> Result<Vec<(ChannelIndex, Bytes)>, DisconnectReason> {
        self.last_recv_at = now;
        self.bad_packets = 0;
        self.traffic.on_packet_received(len);
        self.sender
            .on_acks(now, packet.header.acks, &mut self.traffic);

        let mut delivered = Vec::new();
        if !self.receiver.on_packet(&packet.header) {
            trace!("{}: duplicate packet {:?}", self.id, packet.header.seq);
            return Ok(delivered);
        }
        let mut refused = false;
        for frame in packet.frames {
            match self.receiver.on_frame(max_mem, frame, &mut delivered) {
                Ok(()) => {}
                Err(RecvError::ChannelOutOfBounds { channel }) => {
                    security_errors.push(SecurityError::ChannelOutOfBounds { channel });
                }
                Err(RecvError::TooLarge { seq }) => {
                    debug!("{}: reliable message {seq:?} is too large", self.id);
                    return Err(DisconnectReason::MessageTooLarge);
                }
                Err(err @ RecvError::NotEnoughMemory { .. }) => {
                    trace!("{}: refused frame: {err}", self.id);
                    refused = true;
                }
                Err(err) => trace!("{}: dropped frame: {err}", self.id),
            }
        }
        if refused {
            trace!(
                "{}: not acknowledging packet {:?}",
                self.id, packet.header.seq
            );
        } else {
            self.receiver.record(packet.header.seq);
        }
        Ok(delivered)
    }

    /// Counts a datagram from the peer which could not be decoded.
    ///
    /// Returns `true` once too many arrived in a row.
    pub fn on_bad_packet(&mut self, len: usize) -> bool {
        self.traffic.on_packet_received(len);
        self.bad_packets += 1;
        self.bad_packets >= BAD_PACKET_LIMIT
    }

    /// Builds the datagrams to send to the peer now.
    pub fn flush(&mut self, now: Instant, keep_alive: bool) -> Vec<Bytes> {
        let probe = if keep_alive {
            Probe::KeepAlive
        } else if self.receiver.ack_owed() {
            Probe::AckOnly
        } else {
            Probe::None
        };
        let pto = self.traffic.rtt().pto();
        self.sender.detect_losses(now, pto, &mut self.traffic);
        let packets = self.sender.flush(
            now,
            self.traffic.send_rate(),
            pto,
            self.receiver.acks(),
            probe,
        );
        if !packets.is_empty() {
            self.receiver.on_flushed();
            self.last_send_at = now;
        }
        for packet in &packets {
            self.traffic.on_packet_sent(packet.len());
        }
        packets
    }

    pub fn statistics(&self, queued_receive_messages: usize) -> ConnectionStatistics {
        ConnectionStatistics {
            state: self.state,
            last_second: self.traffic.last_second(),
            lifetime: self.traffic.lifetime(),
            flow: FlowInformation {
                send_rate: self.traffic.send_rate(),
                bytes_in_flight: self.sender.bytes_in_flight(),
                queued_send_messages: self.sender.num_pending_messages(),
                queued_receive_messages,
                buffered_receive_bytes: self.receiver.mem_used(),
            },
        }
    }
}
