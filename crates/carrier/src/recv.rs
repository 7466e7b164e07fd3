//! Incoming half of a connection: acknowledgement bookkeeping, reassembly and
//! in-order delivery of reliable messages.

use {
    crate::{
        channel::{ChannelIndex, MAX_CHANNELS},
        frag::{FragmentReceiver, ReassembleError},
        packet::{Acknowledge, Frame, FrameHeader, MessageSeq, PacketHeader, PacketSeq},
    },
    ahash::AHashMap,
    derive_more::{Display, Error},
    octs::Bytes,
};

/// How far ahead of the next expected reliable message a reliable message may
/// be before it is dropped.
pub const RECV_WINDOW: i16 = 1024;

/// Why a received frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub(crate) enum RecvError {
    #[display("channel {channel} is out of bounds")]
    ChannelOutOfBounds { channel: u8 },
    #[display("unreliable message {seq:?} is fragmented")]
    FragmentedUnreliable { seq: MessageSeq },
    #[display("reliable message {seq:?} was already received")]
    Duplicate { seq: MessageSeq },
    #[display("reliable message {seq:?} is {ahead} ahead of the receive window")]
    OutOfWindow { seq: MessageSeq, ahead: i16 },
    #[display("no memory left to buffer reliable message {seq:?}")]
    NotEnoughMemory { seq: MessageSeq },
    #[display("reliable message {seq:?} is larger than the reassembly memory")]
    TooLarge { seq: MessageSeq },
    #[display("failed to reassemble message {seq:?}")]
    Reassemble {
        seq: MessageSeq,
        source: ReassembleError,
    },
}

#[derive(Debug, Default)]
struct RecvChannel {
    pending: MessageSeq,
    buffered: AHashMap<MessageSeq, Bytes>,
    buffered_mem: usize,
    frags: FragmentReceiver,
}

impl RecvChannel {
    fn mem_used(&self) -> usize {
        self.buffered_mem + self.frags.mem_used()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Receiver {
    acks: Acknowledge,
    ack_owed: bool,
    channels: [RecvChannel; MAX_CHANNELS],
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn acks(&self) -> Acknowledge {
        self.acks
    }

    /// Gets if a received packet asked to be acknowledged and no packet has
    /// gone out since.
    pub const fn ack_owed(&self) -> bool {
        self.ack_owed
    }

    /// Marks the owed acknowledgement as sent.
    pub const fn on_flushed(&mut self) {
        self.ack_owed = false;
    }

    /// Bytes held by partially reassembled and out-of-order reliable messages.
    pub fn mem_used(&self) -> usize {
        self.channels.iter().map(RecvChannel::mem_used).sum()
    }

    /// Notes that a packet arrived.
    ///
    /// Returns `false` if the packet was already received, in which case its
    /// frames should be skipped. Otherwise the packet is only acknowledged
    /// once [`Receiver::record`] is called for it.
    pub fn on_packet(&mut self, header: &PacketHeader) -> bool {
        if header.flags.is_ack_eliciting() {
            self.ack_owed = true;
        }
        !self.acks.contains(header.seq)
    }

    /// Acknowledges the packet `seq`.
    pub fn record(&mut self, seq: PacketSeq) {
        self.acks.record(seq);
    }

    /// Processes one received frame, pushing every message which becomes
    /// deliverable onto `delivered` in delivery order.
    ///
    /// Reassembly and out-of-order buffering together never hold more than
    /// `max_mem` bytes.
    pub fn on_frame(
        &mut self,
        max_mem: usize,
        frame: Frame,
        delivered: &mut Vec<(ChannelIndex, Bytes)>,
    ) -> Result<(), RecvError> {
        let FrameHeader {
            reliable,
            channel,
            seq,
            position,
        } = frame.header;
        if !channel.is_valid() {
            return Err(RecvError::ChannelOutOfBounds {
                channel: channel.into_raw(),
            });
        }

        if !reliable {
            if !position.is_single() {
                return Err(RecvError::FragmentedUnreliable { seq });
            }
            delivered.push((channel, frame.payload));
            return Ok(());
        }

        let index = channel.as_usize();
        let ahead = self.channels[index].pending.dist_to(*seq);
        if ahead < 0 || self.channels[index].buffered.contains_key(&seq) {
            return Err(RecvError::Duplicate { seq });
        }
        if ahead >= RECV_WINDOW {
            return Err(RecvError::OutOfWindow { seq, ahead });
        }

        let mem_left = max_mem.saturating_sub(self.mem_used());
        let recv = &mut self.channels[index];
        // held by reassembly until now, so a completed message is never refused
        if ahead > 0 && position.is_single() && !recv.frags.contains(seq) {
            if frame.payload.len() > max_mem {
                return Err(RecvError::TooLarge { seq });
            }
            if frame.payload.len() > mem_left {
                return Err(RecvError::NotEnoughMemory { seq });
            }
        }
        let msg = recv
            .frags
            .reassemble(mem_left, seq, position, frame.payload)
            .map_err(|source| match source {
                ReassembleError::NotEnoughMemory { needed, .. }
                    if recv.frags.mem_used_by(seq) + needed > max_mem =>
                {
                    RecvError::TooLarge { seq }
                }
                ReassembleError::NotEnoughMemory { .. } => RecvError::NotEnoughMemory { seq },
                source => RecvError::Reassemble { seq, source },
            })?;
        let Some(msg) = msg else {
            return Ok(());
        };

        if ahead > 0 {
            recv.buffered_mem += msg.len();
            recv.buffered.insert(seq, msg);
            return Ok(());
        }

        delivered.push((channel, msg));
        recv.pending += MessageSeq::ONE;
        while let Some(msg) = recv.buffered.remove(&recv.pending) {
            recv.buffered_mem -= msg.len();
            delivered.push((channel, msg));
            recv.pending += MessageSeq::ONE;
        }
        Ok(())
    }
}
