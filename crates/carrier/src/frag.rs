//! Splitting messages into datagram-sized fragments, and reassembling them.

use {
    crate::packet::{FragmentPosition, MessageSeq},
    ahash::AHashMap,
    bit_vec::BitVec,
    core::fmt,
    derive_more::{Display, Error},
    octs::Bytes,
};

/// Splits `msg` into fragments no longer than `max_frag_len` bytes.
///
/// Fragments are yielded from the last index down to index 0. The receiver
/// usually sees the last fragment first and learns the message length
/// straight away.
///
/// An empty message still yields one (empty) fragment.
///
/// # Panics
///
/// Panics if `max_frag_len` is 0, or if `msg` needs more fragments than
/// [`FragmentPosition::MAX_INDEX`] allows.
///
/// # Examples
///
/// ```
/// # use carrier::{frag, packet::FragmentPosition};
/// # use octs::Bytes;
/// let frags = frag::split(4, Bytes::from_static(b"hello world")).collect::<Vec<_>>();
/// assert_eq!(3, frags.len());
/// assert_eq!((FragmentPosition::last(2).unwrap(), Bytes::from_static(b"rld")), frags[0]);
/// assert_eq!((FragmentPosition::non_last(0).unwrap(), Bytes::from_static(b"hell")), frags[2]);
/// ```
pub fn split(
    max_frag_len: usize,
    msg: Bytes,
) -> impl ExactSizeIterator<Item = (FragmentPosition, Bytes)> + DoubleEndedIterator {
    assert!(max_frag_len > 0, "fragment length must be non-zero");

    let num_frags = msg.len().div_ceil(max_frag_len).max(1);
    let last_index = num_frags - 1;
    (0..num_frags).rev().map(move |index| {
        let start = index * max_frag_len;
        let end = (start + max_frag_len).min(msg.len());
        let position = u32::try_from(index)
            .ok()
            .and_then(|index| {
                if index as usize == last_index {
                    FragmentPosition::last(index)
                } else {
                    FragmentPosition::non_last(index)
                }
            })
            .unwrap_or_else(|| {
                panic!("message of {} bytes splits into too many fragments", msg.len())
            });
        (position, msg.slice(start..end))
    })
}

/// Number of fragments that a message of `msg_len` bytes is split into.
#[must_use]
pub const fn num_frags(max_frag_len: usize, msg_len: usize) -> usize {
    let n = msg_len.div_ceil(max_frag_len);
    if n == 0 { 1 } else { n }
}

/// Reassembles fragments produced by [`split`] into whole messages.
///
/// Fragments of one message all have the same length except for the last one,
/// which may be shorter. The receiver learns that length from the first
/// non-last fragment of a message it sees.
#[derive(Default)]
pub struct FragmentReceiver {
    msgs: AHashMap<MessageSeq, MessageBuf>,
    mem_used: usize,
}

#[derive(Default)]
struct MessageBuf {
    frag_len: Option<usize>,
    last: Option<(usize, Bytes)>,
    recv: BitVec,
    num_recv: usize,
    payload: Vec<u8>,
}

impl MessageBuf {
    fn mem_used(&self) -> usize {
        self.payload.capacity()
            + self.recv.capacity().div_ceil(8)
            + self.last.as_ref().map_or(0, |(_, payload)| payload.len())
    }
}

/// Failed to [`FragmentReceiver::reassemble`] a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ReassembleError {
    /// This fragment was already received.
    #[display("already received fragment {index}")]
    AlreadyReceived {
        /// Index of the fragment.
        index: usize,
    },
    /// Storing this fragment would exceed the memory limit.
    #[display("not enough memory - need {needed} bytes, {left} left")]
    NotEnoughMemory {
        /// Bytes needed to store this fragment.
        needed: usize,
        /// Bytes left before the limit is reached.
        left: usize,
    },
    /// The last fragment disagrees with fragments received earlier.
    #[display("fragment {index} claims to be last, but fragment {max} was received")]
    InvalidLast {
        /// Index of the claimed last fragment.
        index: usize,
        /// Highest index received so far.
        max: usize,
    },
    /// Fragment length disagrees with other fragments of the same message.
    #[display("fragment {index} has length {len}, expected {expected}")]
    InvalidLength {
        /// Index of the fragment.
        index: usize,
        /// Length of this fragment.
        len: usize,
        /// Length expected from earlier fragments.
        expected: usize,
    },
}

impl fmt::Debug for FragmentReceiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FragmentReceiver")
            .field("msgs", &self.msgs.keys().collect::<Vec<_>>())
            .field("mem_used", &self.mem_used)
            .finish()
    }
}

impl FragmentReceiver {
    /// Creates an empty receiver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held by partially reassembled messages.
    #[must_use]
    pub const fn mem_used(&self) -> usize {
        self.mem_used
    }

    /// Number of bytes held for the partially reassembled message `seq`.
    #[must_use]
    pub fn mem_used_by(&self, seq: MessageSeq) -> usize {
        self.msgs.get(&seq).map_or(0, MessageBuf::mem_used)
    }

    /// Gets if fragments of the message `seq` are being held.
    #[must_use]
    pub fn contains(&self, seq: MessageSeq) -> bool {
        self.msgs.contains_key(&seq)
    }

    /// Number of messages that are partially reassembled.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.msgs.len()
    }

    /// Feeds one fragment of the message `seq` into this receiver.
    ///
    /// Returns the whole message once its final missing fragment arrives.
    /// `mem_left` bounds how many more bytes this call may hold on to.
    ///
    /// # Errors
    ///
    /// Errors if the fragment is a duplicate, is inconsistent with earlier
    /// fragments of the same message, or does not fit into `mem_left`. The
    /// receiver is left unchanged in that case.
    pub fn reassemble(
        &mut self,
        mem_left: usize,
        seq: MessageSeq,
        position: FragmentPosition,
        payload: Bytes,
    ) -> Result<Option<Bytes>, ReassembleError> {
        if position.is_single() && !self.msgs.contains_key(&seq) {
            return Ok(Some(payload));
        }

        let buf = self.msgs.entry(seq).or_default();
        let mem_before = buf.mem_used();
        let result = Self::insert(buf, mem_left, position, payload);
        let done = matches!(result, Ok(Some(_)));
        let mem_after = buf.mem_used();

        self.mem_used = self.mem_used - mem_before + if done { 0 } else { mem_after };
        if done || (buf.num_recv == 0 && buf.last.is_none()) {
            self.msgs.remove(&seq);
        }
        result
    }

    fn insert(
        buf: &mut MessageBuf,
        mem_left: usize,
        position: FragmentPosition,
        payload: Bytes,
    ) -> Result<Option<Bytes>, ReassembleError> {
        let index = position.index() as usize;
        let is_last_dup = buf.last.as_ref().is_some_and(|(i, _)| *i == index);
        if buf.recv.get(index) == Some(true) || is_last_dup {
            return Err(ReassembleError::AlreadyReceived { index });
        }

        if position.is_last() {
            let max = buf.recv.len().checked_sub(1);
            if let Some(max) = max.filter(|max| *max >= index) {
                return Err(ReassembleError::InvalidLast { index, max });
            }
            if let Some((other, _)) = &buf.last {
                return Err(ReassembleError::InvalidLast {
                    index,
                    max: *other,
                });
            }
            if let Some(frag_len) = buf.frag_len.filter(|frag_len| payload.len() > *frag_len) {
                return Err(ReassembleError::InvalidLength {
                    index,
                    len: payload.len(),
                    expected: frag_len,
                });
            }
            if payload.len() > mem_left {
                return Err(ReassembleError::NotEnoughMemory {
                    needed: payload.len(),
                    left: mem_left,
                });
            }
            buf.last = Some((index, payload));
        } else {
            if let Some((last, _)) = &buf.last {
                if index >= *last {
                    return Err(ReassembleError::InvalidLast {
                        index: *last,
                        max: index,
                    });
                }
            }
            let frag_len = buf.frag_len.unwrap_or(payload.len());
            let last_too_long = buf
                .last
                .as_ref()
                .is_some_and(|(_, last)| last.len() > frag_len);
            if payload.len() != frag_len || frag_len == 0 || last_too_long {
                return Err(ReassembleError::InvalidLength {
                    index,
                    len: payload.len(),
                    expected: frag_len,
                });
            }
            let end = (index + 1) * frag_len;
            let needed = end.saturating_sub(buf.payload.len())
                + (index + 1).saturating_sub(buf.recv.len()).div_ceil(8);
            if needed > mem_left {
                return Err(ReassembleError::NotEnoughMemory {
                    needed,
                    left: mem_left,
                });
            }

            buf.frag_len = Some(frag_len);
            if buf.payload.len() < end {
                buf.payload.resize(end, 0);
            }
            buf.payload[index * frag_len..end].copy_from_slice(&payload);
            if buf.recv.len() <= index {
                buf.recv.grow(index + 1 - buf.recv.len(), false);
            }
            buf.recv.set(index, true);
            buf.num_recv += 1;
        }

        let Some((last, _)) = &buf.last else {
            return Ok(None);
        };
        if buf.num_recv < *last {
            return Ok(None);
        }

        let (last, last_payload) = buf.last.take().expect("checked above");
        let frag_len = buf.frag_len.unwrap_or(0);
        let mut msg = core::mem::take(&mut buf.payload);
        msg.truncate(last * frag_len);
        msg.extend_from_slice(&last_payload);
        Ok(Some(Bytes::from(msg)))
    }

    /// Drops every partially reassembled message.
    pub fn clear(&mut self) {
        self.msgs.clear();
        self.mem_used = 0;
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    const MEM: usize = 1024 * 1024;

    fn msg(len: usize) -> Bytes {
        (0..len)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect::<Vec<_>>()
            .into()
    }

    fn reassemble_all(
        recv: &mut FragmentReceiver,
        frags: impl IntoIterator<Item = (FragmentPosition, Bytes)>,
    ) -> Option<Bytes> {
        let mut out = None;
        for (position, payload) in frags {
            if let Some(msg) = recv
                .reassemble(MEM, MessageSeq::new(0), position, payload)
                .unwrap()
            {
                assert!(out.is_none());
                out = Some(msg);
            }
        }
        out
    }

    #[test]
    fn empty_message_is_one_fragment() {
        let frags = split(8, Bytes::new()).collect::<Vec<_>>();
        assert_eq!(vec![(FragmentPosition::single(), Bytes::new())], frags);
        assert_eq!(1, num_frags(8, 0));
    }

    #[test]
    fn exact_multiple() {
        let frags = split(4, msg(8)).collect::<Vec<_>>();
        assert_eq!(2, frags.len());
        assert!(frags[0].0.is_last());
        assert_eq!(4, frags[0].1.len());
        assert_eq!(2, num_frags(4, 8));
    }

    #[test]
    fn reassemble_in_split_order() {
        let original = msg(1000);
        let mut recv = FragmentReceiver::new();
        let out = reassemble_all(&mut recv, split(64, original.clone()));
        assert_eq!(Some(original), out);
        assert_eq!(0, recv.mem_used());
        assert_eq!(0, recv.num_pending());
    }

    #[test]
    fn reassemble_in_index_order() {
        let original = msg(1000);
        let mut recv = FragmentReceiver::new();
        let out = reassemble_all(&mut recv, split(64, original.clone()).rev());
        assert_eq!(Some(original), out);
        assert_eq!(0, recv.mem_used());
    }

    #[test]
    fn reassemble_shuffled() {
        let original = msg(500);
        let mut frags = split(50, original.clone()).collect::<Vec<_>>();
        frags.swap(0, 5);
        frags.swap(2, 9);
        frags.swap(1, 7);
        let mut recv = FragmentReceiver::new();
        assert_eq!(Some(original), reassemble_all(&mut recv, frags));
    }

    #[test]
    fn single_fragment_passes_through() {
        let mut recv = FragmentReceiver::new();
        let out = recv
            .reassemble(0, MessageSeq::new(3), FragmentPosition::single(), msg(10))
            .unwrap();
        assert_eq!(Some(msg(10)), out);
    }

    #[test]
    fn duplicate_fragment() {
        let mut recv = FragmentReceiver::new();
        let mut frags = split(4, msg(12));
        let (position, payload) = frags.next_back().unwrap();
        recv.reassemble(MEM, MessageSeq::new(0), position, payload.clone())
            .unwrap();
        assert_eq!(
            Err(ReassembleError::AlreadyReceived { index: 0 }),
            recv.reassemble(MEM, MessageSeq::new(0), position, payload)
        );
    }

    #[test]
    fn memory_limit() {
        let mut recv = FragmentReceiver::new();
        let (position, payload) = split(100, msg(1000)).last().unwrap();
        assert!(matches!(
            recv.reassemble(50, MessageSeq::new(0), position, payload),
            Err(ReassembleError::NotEnoughMemory { .. })
        ));
        assert_eq!(0, recv.mem_used());
        assert_eq!(0, recv.num_pending());
    }

    #[test]
    fn inconsistent_length() {
        let mut recv = FragmentReceiver::new();
        recv.reassemble(
            MEM,
            MessageSeq::new(0),
            FragmentPosition::non_last(0).unwrap(),
            msg(8),
        )
        .unwrap();
        assert!(matches!(
            recv.reassemble(
                MEM,
                MessageSeq::new(0),
                FragmentPosition::non_last(1).unwrap(),
                msg(4)
            ),
            Err(ReassembleError::InvalidLength { .. })
        ));
    }

    #[test]
    fn clear_releases_memory() {
        let mut recv = FragmentReceiver::new();
        let (position, payload) = split(100, msg(1000)).last().unwrap();
        recv.reassemble(MEM, MessageSeq::new(0), position, payload)
            .unwrap();
        assert!(recv.mem_used() > 0);
        recv.clear();
        assert_eq!(0, recv.mem_used());
    }
}
