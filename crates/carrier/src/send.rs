//! Outgoing half of a connection: queueing, packet building, retransmission
//! and acknowledgement tracking.

use {
    crate::{
        callback::{Callback, CallbackStream},
        channel::{ChannelIndex, MAX_CHANNELS, Priority, Reliability, SendOptions},
        frag,
        limit::TokenBucket,
        packet::{
            Acknowledge, FragmentPosition, Frame, FrameHeader, MAX_HEADER_OVERHEAD, MessageSeq,
            Packet, PacketFlags, PacketHeader, PacketSeq,
        },
        recv::RECV_WINDOW,
        traffic::TrafficController,
    },
    ahash::AHashMap,
    core::{cmp::Reverse, time::Duration},
    octs::{Bytes, BytesMut, EncodeLen, FixedEncodeLen, Write},
    std::collections::{BTreeMap, VecDeque},
    web_time::Instant,
};

/// A sent packet which is this many packets behind the newest acknowledged
/// packet can no longer be acknowledged, and is declared lost.
pub const LOSS_PACKET_THRESHOLD: i16 = 32;

/// A sent packet which has gone unacknowledged for this many probe timeouts
/// is declared lost.
pub const LOSS_TIME_FACTOR: u32 = 3;

const PACKET_OVERHEAD: usize = u8::ENCODE_LEN + PacketHeader::ENCODE_LEN;

pub(crate) struct OutgoingMessage {
    pub payload: Bytes,
    pub options: SendOptions,
    pub callback: Option<Callback>,
}

/// Whether a flush must produce a packet even if there is nothing to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    None,
    /// The peer is owed an acknowledgement.
    AckOnly,
    /// Nothing was sent for a while; ask the peer to acknowledge something.
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MessageKey {
    channel: ChannelIndex,
    reliable: bool,
    seq: MessageSeq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentPath {
    key: MessageKey,
    index: usize,
}

struct Queued {
    payload: Bytes,
    reliable: bool,
    channel: ChannelIndex,
    stamp: Option<u64>,
}

struct SentMessage {
    frags: Box<[Option<SentFragment>]>,
    stamp: Option<u64>,
}

struct SentFragment {
    position: FragmentPosition,
    payload: Bytes,
    sent_at: Option<Instant>,
    next_flush_at: Instant,
}

struct FlushedPacket {
    flushed_at: Instant,
    len: usize,
    ack_eliciting: bool,
    frags: Box<[FragmentPath]>,
}

#[derive(Default)]
struct SendChannel {
    next_reliable: MessageSeq,
    next_unreliable: MessageSeq,
    reliable_in_flight: VecDeque<MessageSeq>,
    callbacks: CallbackStream,
}

pub(crate) struct Sender {
    mtu: usize,
    max_frag_len: usize,
    queue: BTreeMap<Reverse<Priority>, VecDeque<Queued>>,
    num_queued: usize,
    channels: [SendChannel; MAX_CHANNELS],
    sent_msgs: AHashMap<MessageKey, SentMessage>,
    order: VecDeque<MessageKey>,
    flushed_packets: AHashMap<PacketSeq, FlushedPacket>,
    next_packet_seq: PacketSeq,
    latest_acked: Option<PacketSeq>,
    bytes_in_flight: usize,
    budget: TokenBucket,
    refilled_at: Instant,
    ready_callbacks: Vec<Callback>,
}

impl Sender {
    pub fn new(mtu: usize, now: Instant) -> Self {
        Self {
            mtu,
            max_frag_len: mtu.saturating_sub(MAX_HEADER_OVERHEAD).max(1),
            queue: BTreeMap::new(),
            num_queued: 0,
            channels: core::array::from_fn(|_| SendChannel::default()),
            sent_msgs: AHashMap::new(),
            order: VecDeque::new(),
            flushed_packets: AHashMap::new(),
            next_packet_seq: PacketSeq::default(),
            latest_acked: None,
            bytes_in_flight: 0,
            budget: TokenBucket::new(mtu),
            refilled_at: now,
            ready_callbacks: Vec::new(),
        }
    }

    pub const fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Messages which were queued but have not fully gone out, or have not
    /// been acknowledged yet.
    pub fn num_pending_messages(&self) -> usize {
        self.num_queued + self.sent_msgs.len()
    }

    /// Gets if everything queued has been sent, and every reliable message
    /// acknowledged.
    pub fn is_idle(&self) -> bool {
        self.num_queued == 0 && self.sent_msgs.is_empty()
    }

    pub fn take_ready_callbacks(&mut self) -> Vec<Callback> {
        core::mem::take(&mut self.ready_callbacks)
    }

    /// Queues a message for sending.
    ///
    /// Messages too large for a single datagram are always sent reliably.
    pub fn enqueue(&mut self, msg: OutgoingMessage) {
        let SendOptions {
            reliability,
            priority,
            channel,
        } = msg.options;
        let reliable =
            reliability == Reliability::Reliable || msg.payload.len() > self.max_frag_len;
        let stamp = msg
            .callback
            .map(|callback| self.channels[channel.as_usize()].callbacks.register(callback));
        self.queue
            .entry(Reverse(priority))
            .or_default()
            .push_back(Queued {
                payload: msg.payload,
                reliable,
                channel,
                stamp,
            });
        self.num_queued += 1;
    }

    /// Builds the packets which should go out now.
    ///
    /// Each packet is at most `mtu` bytes. Frames are taken in this order:
    /// fragments due for retransmission, fragments of messages which have
    /// started sending, then queued messages from highest to lowest priority.
    /// Everything stops once the send budget runs out, except that a `probe`
    /// always produces at least one packet.
    pub fn flush(
        &mut self,
        now: Instant,
        send_rate: u32,
        pto: Duration,
        acks: Acknowledge,
        mut probe: Probe,
    ) -> Vec<Bytes> {
        self.budget.set_cap(self.mtu.max(send_rate as usize));
        self.budget
            .refill_for(send_rate, now.saturating_duration_since(self.refilled_at));
        self.refilled_at = now;

        let mut candidates = self.candidates(now);
        let mut packets = Vec::new();
        loop {
            let limit = self.mtu.min(PACKET_OVERHEAD + self.budget.rem());
            let mut space = limit.saturating_sub(PACKET_OVERHEAD);
            let mut frames = Vec::new();
            let mut paths = Vec::new();

            for slot in &mut candidates {
                let Some(path) = *slot else {
                    continue;
                };
                let Some(len) = self.frame_len(path) else {
                    *slot = None;
                    continue;
                };
                if len > space {
                    continue;
                }
                space -= len;
                *slot = None;
                self.write_frame(now, pto, path, &mut frames);
                paths.push(path);
            }

            while let Some((priority, index)) = self.next_promotable() {
                if self.first_frame_len(priority, index) > space {
                    break;
                }
                let key = self.promote(now, priority, index);
                for path in self.unsent_paths(key) {
                    let Some(len) = self.frame_len(path) else {
                        continue;
                    };
                    if len > space {
                        candidates.push(Some(path));
                        continue;
                    }
                    space -= len;
                    self.write_frame(now, pto, path, &mut frames);
                    paths.push(path);
                }
            }

            let has_frames = !frames.is_empty();
            if !has_frames && probe == Probe::None {
                break;
            }
            let ack_eliciting = has_frames || probe == Probe::KeepAlive;
            probe = Probe::None;

            let seq = self.next_packet_seq;
            self.next_packet_seq += PacketSeq::ONE;
            let packet = Packet {
                header: PacketHeader {
                    flags: if ack_eliciting {
                        PacketFlags::ACK_ELICITING
                    } else {
                        PacketFlags::default()
                    },
                    seq,
                    acks,
                },
                frames,
            };
            let mut buf = BytesMut::with_capacity(packet.encode_len());
            buf.write(&packet)
                .expect("BytesMut should grow the buffer when writing over capacity");
            let len = buf.len();

            self.budget.consume_saturating(len);
            if ack_eliciting {
                self.bytes_in_flight += len;
            }
            self.flushed_packets.insert(
                seq,
                FlushedPacket {
                    flushed_at: now,
                    len,
                    ack_eliciting,
                    frags: paths.into_boxed_slice(),
                },
            );
            packets.push(buf.freeze());

            if !has_frames {
                break;
            }
        }
        packets
    }

    /// Processes the acknowledgements carried by a packet from the peer.
    pub fn on_acks(&mut self, now: Instant, acks: Acknowledge, traffic: &mut TrafficController) {
        for seq in acks.seqs() {
            let Some(packet) = self.flushed_packets.remove(&seq) else {
                continue;
            };
            if self.latest_acked.is_none_or(|latest| seq > latest) {
                self.latest_acked = Some(seq);
            }
            if packet.ack_eliciting {
                self.bytes_in_flight -= packet.len;
                traffic.on_packet_acked(now.saturating_duration_since(packet.flushed_at));
            }
            for path in packet.frags {
                self.ack_frag(path);
            }
        }
    }

    /// Declares packets lost which can no longer be acknowledged, or have gone
    /// unacknowledged for too long.
    ///
    /// The reliable fragments they carried are sent again by their own
    /// retransmission timers.
    pub fn detect_losses(&mut self, now: Instant, pto: Duration, traffic: &mut TrafficController) {
        let timeout = pto * LOSS_TIME_FACTOR;
        let latest = self.latest_acked;
        let bytes_in_flight = &mut self.bytes_in_flight;
        self.flushed_packets.retain(|seq, packet| {
            let timed_out = now.saturating_duration_since(packet.flushed_at) >= timeout;
            let out_of_window =
                latest.is_some_and(|latest| seq.dist_to(*latest) >= LOSS_PACKET_THRESHOLD);
            if !timed_out && !out_of_window {
                return true;
            }
            if packet.ack_eliciting {
                *bytes_in_flight -= packet.len;
                traffic.on_packet_lost();
            }
            false
        });
    }

    fn candidates(&mut self, now: Instant) -> Vec<Option<FragmentPath>> {
        while let Some(front) = self.order.front() {
            if self.sent_msgs.contains_key(front) {
                break;
            }
            self.order.pop_front();
        }

        let mut paths = Vec::new();
        for key in &self.order {
            let Some(msg) = self.sent_msgs.get(key) else {
                continue;
            };
            for (index, frag) in msg.frags.iter().enumerate() {
                if let Some(frag) = frag.as_ref().filter(|frag| frag.next_flush_at <= now) {
                    paths.push((FragmentPath { key: *key, index }, frag.sent_at));
                }
            }
        }
        // oldest sends first, never-sent fragments last in message order
        paths.sort_by_key(|(_, sent_at)| (sent_at.is_none(), *sent_at));
        paths.into_iter().map(|(path, _)| Some(path)).collect()
    }

    fn can_assign(&self, channel: ChannelIndex, reliable: bool) -> bool {
        if !reliable {
            return true;
        }
        let channel = &self.channels[channel.as_usize()];
        channel
            .reliable_in_flight
            .front()
            .is_none_or(|oldest| oldest.dist_to(*channel.next_reliable) < RECV_WINDOW)
    }

    fn next_promotable(&self) -> Option<(Reverse<Priority>, usize)> {
        self.queue.iter().find_map(|(priority, queue)| {
            queue
                .iter()
                .position(|msg| self.can_assign(msg.channel, msg.reliable))
                .map(|index| (*priority, index))
        })
    }

    fn first_frame_len(&self, priority: Reverse<Priority>, index: usize) -> usize {
        let Some(msg) = self.queue.get(&priority).and_then(|queue| queue.get(index)) else {
            return usize::MAX;
        };
        let num_frags = frag::num_frags(self.max_frag_len, msg.payload.len());
        let last_len = msg.payload.len() - (num_frags - 1) * self.max_frag_len;
        let position = u32::try_from(num_frags - 1)
            .ok()
            .and_then(FragmentPosition::last)
            .unwrap_or(FragmentPosition::single());
        let header = FrameHeader {
            reliable: msg.reliable,
            channel: msg.channel,
            seq: MessageSeq::default(),
            position,
        };
        Frame::encode_len_of(&header, last_len)
    }

    fn promote(&mut self, now: Instant, priority: Reverse<Priority>, index: usize) -> MessageKey {
        let queue = self
            .queue
            .get_mut(&priority)
            .expect("promoted message should be in a queue");
        let msg = queue
            .remove(index)
            .expect("promoted message index should be valid");
        if queue.is_empty() {
            self.queue.remove(&priority);
        }
        self.num_queued -= 1;

        let channel = &mut self.channels[msg.channel.as_usize()];
        let seq = if msg.reliable {
            let seq = channel.next_reliable;
            channel.next_reliable += MessageSeq::ONE;
            channel.reliable_in_flight.push_back(seq);
            seq
        } else {
            let seq = channel.next_unreliable;
            channel.next_unreliable += MessageSeq::ONE;
            seq
        };

        let frags = frag::split(self.max_frag_len, msg.payload)
            .map(|(position, payload)| {
                Some(SentFragment {
                    position,
                    payload,
                    sent_at: None,
                    next_flush_at: now,
                })
            })
            .collect();
        let key = MessageKey {
            channel: msg.channel,
            reliable: msg.reliable,
            seq,
        };
        self.sent_msgs.insert(
            key,
            SentMessage {
                frags,
                stamp: msg.stamp,
            },
        );
        self.order.push_back(key);
        key
    }

    fn unsent_paths(&self, key: MessageKey) -> Vec<FragmentPath> {
        self.sent_msgs.get(&key).map_or_else(Vec::new, |msg| {
            (0..msg.frags.len())
                .map(|index| FragmentPath { key, index })
                .collect()
        })
    }

    fn frame_len(&self, path: FragmentPath) -> Option<usize> {
        let frag = self
            .sent_msgs
            .get(&path.key)?
            .frags
            .get(path.index)?
            .as_ref()?;
        let header = FrameHeader {
            reliable: path.key.reliable,
            channel: path.key.channel,
            seq: path.key.seq,
            position: frag.position,
        };
        Some(Frame::encode_len_of(&header, frag.payload.len()))
    }

    fn write_frame(
        &mut self,
        now: Instant,
        pto: Duration,
        path: FragmentPath,
        frames: &mut Vec<Frame>,
    ) {
        let Some(msg) = self.sent_msgs.get_mut(&path.key) else {
            return;
        };
        let Some(slot) = msg.frags.get_mut(path.index) else {
            return;
        };
        let Some(frag) = slot.as_mut() else {
            return;
        };

        frames.push(Frame {
            header: FrameHeader {
                reliable: path.key.reliable,
                channel: path.key.channel,
                seq: path.key.seq,
                position: frag.position,
            },
            payload: frag.payload.clone(),
        });

        if path.key.reliable {
            frag.sent_at = Some(now);
            frag.next_flush_at = now + pto;
        } else {
            *slot = None;
            if msg.frags.iter().all(Option::is_none) {
                self.finalize(path.key);
            }
        }
    }

    fn ack_frag(&mut self, path: FragmentPath) {
        let Some(msg) = self.sent_msgs.get_mut(&path.key) else {
            return;
        };
        if let Some(slot) = msg.frags.get_mut(path.index) {
            *slot = None;
        }
        if msg.frags.iter().all(Option::is_none) {
            self.finalize(path.key);
        }
    }

    fn finalize(&mut self, key: MessageKey) {
        let Some(msg) = self.sent_msgs.remove(&key) else {
            return;
        };
        let channel = &mut self.channels[key.channel.as_usize()];
        if let Some(stamp) = msg.stamp {
            channel.callbacks.complete(stamp, &mut self.ready_callbacks);
        }
        if key.reliable {
            while let Some(&seq) = channel.reliable_in_flight.front() {
                let front = MessageKey { seq, ..key };
                if self.sent_msgs.contains_key(&front) {
                    break;
                }
                channel.reliable_in_flight.pop_front();
            }
        }
    }
}
