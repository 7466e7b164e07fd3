use {
    super::{FragmentPosition, MessageSeq},
    crate::channel::ChannelIndex,
    core::{convert::Infallible, fmt},
    derive_more::{Display, Error},
    octs::{
        BufError, BufTooShortOr, Bytes, Decode, Encode, EncodeLen, FixedEncodeLen,
        FixedEncodeLenHint, Read, VarInt, VarIntTooLarge, Write,
    },
};

impl FragmentPosition {
    /// Highest fragment index that can be represented.
    pub const MAX_INDEX: u32 = u32::MAX / 2;

    /// Position of a fragment which is followed by more fragments.
    ///
    /// Returns [`None`] if `index` is greater than [`FragmentPosition::MAX_INDEX`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::FragmentPosition;
    /// let pos = FragmentPosition::non_last(3).unwrap();
    /// assert_eq!(3, pos.index());
    /// assert!(!pos.is_last());
    ///
    /// assert!(FragmentPosition::non_last(u32::MAX).is_none());
    /// ```
    #[must_use]
    pub const fn non_last(index: u32) -> Option<Self> {
        if index > Self::MAX_INDEX {
            None
        } else {
            Some(Self(index * 2))
        }
    }

    /// Position of the final fragment of a message.
    ///
    /// Returns [`None`] if `index` is greater than [`FragmentPosition::MAX_INDEX`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::FragmentPosition;
    /// let pos = FragmentPosition::last(0).unwrap();
    /// assert_eq!(0, pos.index());
    /// assert!(pos.is_last());
    /// ```
    #[must_use]
    pub const fn last(index: u32) -> Option<Self> {
        if index > Self::MAX_INDEX {
            None
        } else {
            Some(Self(index * 2 + 1))
        }
    }

    /// Position of a message which was not split at all.
    #[must_use]
    pub const fn single() -> Self {
        Self(1)
    }

    /// Creates a position from its raw encoded form.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Gets the raw encoded form of this position.
    #[must_use]
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Gets the index of this fragment in its message.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 / 2
    }

    /// Gets if this is the final fragment of its message.
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.0 % 2 == 1
    }

    /// Gets if this fragment is an entire message on its own.
    #[must_use]
    pub const fn is_single(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Debug for FragmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FragmentPosition")
            .field("index", &self.index())
            .field("is_last", &self.is_last())
            .finish()
    }
}

impl FixedEncodeLenHint for FragmentPosition {
    const MIN_ENCODE_LEN: usize = <VarInt<u32> as FixedEncodeLenHint>::MIN_ENCODE_LEN;
    const MAX_ENCODE_LEN: usize = <VarInt<u32> as FixedEncodeLenHint>::MAX_ENCODE_LEN;
}

impl EncodeLen for FragmentPosition {
    fn encode_len(&self) -> usize {
        VarInt(self.0).encode_len()
    }
}

impl Encode for FragmentPosition {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(VarInt(self.0))
    }
}

impl Decode for FragmentPosition {
    type Error = VarIntTooLarge;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read::<VarInt<u32>>()?.0))
    }
}

/// Metadata of a single [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// Whether the message this fragment belongs to is reliable.
    ///
    /// Reliable and unreliable messages use separate sequence spaces.
    pub reliable: bool,
    /// Channel that the message is sent along.
    pub channel: ChannelIndex,
    /// Sequence of the message within its channel and reliability.
    pub seq: MessageSeq,
    /// Where this fragment sits in the message.
    pub position: FragmentPosition,
}

const FLAG_RELIABLE: u8 = 0b1;

impl FixedEncodeLenHint for FrameHeader {
    const MIN_ENCODE_LEN: usize = u8::ENCODE_LEN
        + ChannelIndex::ENCODE_LEN
        + MessageSeq::ENCODE_LEN
        + FragmentPosition::MIN_ENCODE_LEN;

    const MAX_ENCODE_LEN: usize = u8::ENCODE_LEN
        + ChannelIndex::ENCODE_LEN
        + MessageSeq::ENCODE_LEN
        + FragmentPosition::MAX_ENCODE_LEN;
}

impl EncodeLen for FrameHeader {
    fn encode_len(&self) -> usize {
        u8::ENCODE_LEN
            + ChannelIndex::ENCODE_LEN
            + MessageSeq::ENCODE_LEN
            + self.position.encode_len()
    }
}

impl Encode for FrameHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let flags = if self.reliable { FLAG_RELIABLE } else { 0 };
        dst.write(&flags)?;
        dst.write(&self.channel)?;
        dst.write(&self.seq)?;
        dst.write(&self.position)?;
        Ok(())
    }
}

impl Decode for FrameHeader {
    type Error = VarIntTooLarge;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let flags = src.read::<u8>()?;
        Ok(Self {
            reliable: flags & FLAG_RELIABLE != 0,
            channel: src.read()?,
            seq: src.read()?,
            position: src.read()?,
        })
    }
}

/// One fragment of a message, as it appears inside a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Metadata of this fragment.
    pub header: FrameHeader,
    /// Bytes of this fragment.
    pub payload: Bytes,
}

/// Attempted to [`Encode`] a [`Frame`] whose payload length does not fit into
/// a [`u32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("payload of {len} bytes is too large")]
pub struct PayloadTooLarge {
    /// Length of the payload.
    pub len: usize,
}

impl BufError for PayloadTooLarge {}

impl Frame {
    /// Gets how many bytes a frame carrying `payload_len` bytes with `header`
    /// takes up when encoded.
    #[must_use]
    pub fn encode_len_of(header: &FrameHeader, payload_len: usize) -> usize {
        let len_len = u32::try_from(payload_len)
            .map_or(<VarInt<u32> as FixedEncodeLenHint>::MAX_ENCODE_LEN, |len| {
                VarInt(len).encode_len()
            });
        header.encode_len() + len_len + payload_len
    }
}

impl EncodeLen for Frame {
    fn encode_len(&self) -> usize {
        Self::encode_len_of(&self.header, self.payload.len())
    }
}

impl Encode for Frame {
    type Error = PayloadTooLarge;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let len_u = self.payload.len();
        let len = u32::try_from(len_u).map_err(|_| PayloadTooLarge { len: len_u })?;
        dst.write(&self.header)?;
        dst.write(VarInt(len))?;
        dst.write_from(self.payload.clone())?;
        Ok(())
    }
}

impl Decode for Frame {
    type Error = VarIntTooLarge;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let header = src.read::<FrameHeader>()?;
        let len = src.read::<VarInt<u32>>()?.0;
        let len = usize::try_from(len).expect("`u32` should fit in a `usize`");
        Ok(Self {
            header,
            payload: src.read_next(len)?,
        })
    }
}
