//! Wire format of the datagrams exchanged between two carriers.
//!
//! Every datagram is one packet:
//!
//! ```text
//! +-------------+-------+-----+------------------+----------+----------+-----
//! | PROTOCOL_ID | flags | seq | acks             | frame    | frame    | ...
//! | u8          | u8    | u16 | u16 + u32 bitmap |          |          |
//! +-------------+-------+-----+------------------+----------+----------+-----
//! ```
//!
//! and every frame carries one fragment of one message:
//!
//! ```text
//! +-------+---------+-----+-----------------+-------------+---------+
//! | flags | channel | seq | position        | len         | payload |
//! | u8    | u8      | u16 | varint          | varint      | [u8]    |
//! +-------+---------+-----+-----------------+-------------+---------+
//! ```
//!
//! All fixed-size integers are big-endian.

mod ack;
mod frame;
mod header;
mod seq;
mod system;

pub use {frame::*, system::*};
use {
    derive_more::{Add, AddAssign, Deref, Display, Error, Sub, SubAssign},
    octs::{
        BufError, BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLen, FixedEncodeLenHint,
        Read, VarInt, VarIntTooLarge, Write,
    },
};

/// First byte of every packet.
///
/// Datagrams starting with anything else are not ours and are dropped.
pub const PROTOCOL_ID: u8 = 0xCA;

/// Sequence number which wraps around to 0 after [`u16::MAX`].
///
/// Comparisons between two sequence numbers take the wraparound into account,
/// so that e.g. `Seq(65535) < Seq(0)`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

/// Sequence number of a packet sent by one side of a connection.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)] // force `#[derive]` on multiple lines
#[derive(Deref, Add, AddAssign, Sub, SubAssign)]
pub struct PacketSeq(pub Seq);

/// Sequence number of a message sent along a channel.
///
/// Reliable and unreliable messages on the same channel are numbered
/// independently.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)] // force `#[derive]` on multiple lines
#[derive(Deref, Add, AddAssign, Sub, SubAssign)]
pub struct MessageSeq(pub Seq);

/// Which of the peer's packets have been received, relative to the most
/// recently received one.
///
/// Bit `n` of [`Acknowledge::bits`] is set if packet `last_recv - n` was
/// received. Every outgoing packet carries this, so that each received packet
/// is acknowledged up to 32 times.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Acknowledge {
    /// Most recently received packet sequence.
    pub last_recv: PacketSeq,
    /// Bitmap of received packets, ending at [`Acknowledge::last_recv`].
    pub bits: u32,
}

/// Metadata at the start of every packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    /// See [`PacketFlags`].
    pub flags: PacketFlags,
    /// Sequence number of this packet.
    pub seq: PacketSeq,
    /// Packets that the sender of this packet has received.
    pub acks: Acknowledge,
}

/// Bit flags of a [`PacketHeader`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    /// The receiver should acknowledge this packet promptly.
    ///
    /// Packets which carry frames, and keep-alives, set this. Packets which
    /// only exist to carry acknowledgements do not, so that two peers never
    /// acknowledge each other's acknowledgements in a loop.
    pub const ACK_ELICITING: Self = Self(0b1);

    /// Gets if this packet should be acknowledged promptly.
    #[must_use]
    pub const fn is_ack_eliciting(self) -> bool {
        self.0 & Self::ACK_ELICITING.0 != 0
    }
}

/// Position of a fragment inside the message it was split from.
///
/// Encoded on the wire as a [`VarInt`] of `index * 2 + is_last`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentPosition(u32);

/// Highest number of bytes that packet and frame headers may take up in a
/// single datagram.
///
/// A fragment payload of `max_datagram_size - MAX_HEADER_OVERHEAD` bytes will
/// always fit into one datagram.
pub const MAX_HEADER_OVERHEAD: usize = 1
    + PacketHeader::ENCODE_LEN
    + FrameHeader::MAX_ENCODE_LEN
    + <VarInt<u32> as FixedEncodeLenHint>::MAX_ENCODE_LEN;

/// Whole datagram: a [`PacketHeader`] followed by any number of [`Frame`]s.
///
/// A packet with no frames is still meaningful, since its header carries
/// acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Metadata of this packet.
    pub header: PacketHeader,
    /// Fragments carried by this packet.
    pub frames: Vec<Frame>,
}

/// Failed to [`Decode`] a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum InvalidPacket {
    /// Datagram did not start with [`PROTOCOL_ID`].
    #[display("invalid protocol id {_0:#04x}")]
    ProtocolId(#[error(not(source))] u8),
    /// A frame could not be decoded.
    #[display("invalid frame")]
    Frame(VarIntTooLarge),
}

impl BufError for InvalidPacket {}

impl EncodeLen for Packet {
    fn encode_len(&self) -> usize {
        u8::ENCODE_LEN
            + PacketHeader::ENCODE_LEN
            + self.frames.iter().map(EncodeLen::encode_len).sum::<usize>()
    }
}

impl Encode for Packet {
    type Error = PayloadTooLarge;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&PROTOCOL_ID)?;
        dst.write(&self.header)?;
        for frame in &self.frames {
            dst.write(frame)?;
        }
        Ok(())
    }
}

impl Decode for Packet {
    type Error = InvalidPacket;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let id = src.read::<u8>()?;
        if id != PROTOCOL_ID {
            return Err(InvalidPacket::ProtocolId(id).into());
        }
        let header = src.read::<PacketHeader>()?;
        let mut frames = Vec::new();
        while src.remaining() > 0 {
            let frame = src
                .read::<Frame>()
                .map_err(|err| err.map_or(InvalidPacket::Frame))?;
            frames.push(frame);
        }
        Ok(Self { header, frames })
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {
        super::*,
        crate::channel::ChannelIndex,
        octs::{Bytes, BytesMut},
    };

    #[test]
    fn packet_with_frames() {
        let packet = Packet {
            header: PacketHeader {
                flags: PacketFlags::ACK_ELICITING,
                seq: PacketSeq::new(9),
                acks: Acknowledge::default(),
            },
            frames: vec![Frame {
                header: FrameHeader {
                    reliable: true,
                    channel: ChannelIndex::DEFAULT,
                    seq: MessageSeq::new(0),
                    position: FragmentPosition::single(),
                },
                payload: Bytes::from_static(b"abc"),
            }],
        };
        let mut buf = BytesMut::new();
        buf.write(&packet).unwrap();
        assert_eq!(PROTOCOL_ID, buf[0]);
        assert_eq!(packet.encode_len(), buf.len());
        assert_eq!(packet, buf.freeze().read::<Packet>().unwrap());
    }

    #[test]
    fn foreign_datagram() {
        let mut buf = Bytes::from_static(&[0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(buf.read::<Packet>().is_err());
    }

    #[test]
    fn max_overhead_fits() {
        let frame = Frame {
            header: FrameHeader {
                reliable: true,
                channel: ChannelIndex::SYSTEM,
                seq: MessageSeq::new(u16::MAX),
                position: FragmentPosition::last(FragmentPosition::MAX_INDEX).unwrap(),
            },
            payload: Bytes::from(vec![0; 1000]),
        };
        let packet = Packet {
            header: PacketHeader::default(),
            frames: vec![frame],
        };
        assert!(packet.encode_len() <= 1000 + MAX_HEADER_OVERHEAD);
    }
}
