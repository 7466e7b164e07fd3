use {
    crate::connection::DisconnectReason,
    derive_more::{Display, Error},
    octs::{BufError, BufTooShortOr, Bytes, Decode, Encode, EncodeLen, Read, Write},
};

/// Message exchanged on [`ChannelIndex::SYSTEM`] to drive a connection's
/// lifecycle.
///
/// [`ChannelIndex::SYSTEM`]: crate::channel::ChannelIndex::SYSTEM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// Sent repeatedly by the initiating side until the handshake completes.
    ConnectRequest {
        /// Protocol version of the sender.
        version: u32,
        /// Opaque handshake payload.
        payload: Bytes,
    },
    /// Sent by the accepting side once it accepts a connection.
    ConnectAck {
        /// Opaque handshake payload.
        payload: Bytes,
    },
    /// The sender is closing the connection.
    Disconnect {
        /// Why the sender closed the connection.
        reason: DisconnectReason,
    },
    /// Host clock time, in milliseconds.
    ClockSync {
        /// Host clock time when this message was sent.
        host_time: u32,
    },
}

const CONNECT_REQUEST: u8 = 1;
const CONNECT_ACK: u8 = 2;
const DISCONNECT: u8 = 3;
const CLOCK_SYNC: u8 = 4;

/// Failed to [`Decode`] a [`SystemMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum InvalidSystemMessage {
    /// First byte of the message did not name a known message kind.
    #[display("unknown system message kind {_0}")]
    UnknownKind(#[error(not(source))] u8),
    /// Disconnect reason code was not recognized.
    #[display("unknown disconnect reason {_0}")]
    UnknownReason(#[error(not(source))] u8),
}

impl BufError for InvalidSystemMessage {}

impl SystemMessage {
    /// Gets if `payload` looks like an encoded [`SystemMessage::ConnectRequest`].
    #[must_use]
    pub fn is_connect_request(payload: &[u8]) -> bool {
        payload.first() == Some(&CONNECT_REQUEST)
    }
}

impl EncodeLen for SystemMessage {
    fn encode_len(&self) -> usize {
        1 + match self {
            Self::ConnectRequest { payload, .. } => 4 + payload.len(),
            Self::ConnectAck { payload } => payload.len(),
            Self::Disconnect { .. } => 1,
            Self::ClockSync { .. } => 4,
        }
    }
}

impl Encode for SystemMessage {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        match self {
            Self::ConnectRequest { version, payload } => {
                dst.write(&CONNECT_REQUEST)?;
                dst.write(version)?;
                dst.write_from(payload.clone())?;
            }
            Self::ConnectAck { payload } => {
                dst.write(&CONNECT_ACK)?;
                dst.write_from(payload.clone())?;
            }
            Self::Disconnect { reason } => {
                dst.write(&DISCONNECT)?;
                dst.write(&reason.to_code())?;
            }
            Self::ClockSync { host_time } => {
                dst.write(&CLOCK_SYNC)?;
                dst.write(host_time)?;
            }
        }
        Ok(())
    }
}

impl Decode for SystemMessage {
    type Error = InvalidSystemMessage;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let kind = src.read::<u8>()?;
        Ok(match kind {
            CONNECT_REQUEST => Self::ConnectRequest {
                version: src.read()?,
                payload: src.read_next(src.remaining())?,
            },
            CONNECT_ACK => Self::ConnectAck {
                payload: src.read_next(src.remaining())?,
            },
            DISCONNECT => {
                let code = src.read::<u8>()?;
                let reason = DisconnectReason::from_code(code)
                    .ok_or(InvalidSystemMessage::UnknownReason(code))?;
                Self::Disconnect { reason }
            }
            CLOCK_SYNC => Self::ClockSync {
                host_time: src.read()?,
            },
            kind => return Err(InvalidSystemMessage::UnknownKind(kind).into()),
        })
    }
}
