//! Channels, delivery guarantees and send priorities.

use {
    core::{convert::Infallible, fmt},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Number of channels in every connection, including [`ChannelIndex::SYSTEM`].
pub const MAX_CHANNELS: usize = 4;

/// Index of an independent message stream inside a connection.
///
/// Reliable messages are ordered per channel, so traffic on one channel never
/// waits for a lost message on another. Channels `0..3` are available to the
/// application; [`ChannelIndex::SYSTEM`] is reserved.
///
/// Any `u8` can be turned into a channel index, but passing an index outside
/// of the user range to a send or receive operation fails that operation
/// without raising an event.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelIndex(u8);

impl ChannelIndex {
    /// Channel used when none is specified.
    pub const DEFAULT: Self = Self(0);

    /// Channel reserved for handshake, disconnect and clock sync messages.
    #[expect(clippy::cast_possible_truncation, reason = "`MAX_CHANNELS` is small")]
    pub const SYSTEM: Self = Self((MAX_CHANNELS - 1) as u8);

    /// Creates a channel index.
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Gets the raw index.
    #[must_use]
    pub const fn into_raw(self) -> u8 {
        self.0
    }

    /// Gets if applications may send and receive on this channel.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::channel::ChannelIndex;
    /// assert!(ChannelIndex::DEFAULT.is_user());
    /// assert!(ChannelIndex::new(2).is_user());
    /// assert!(!ChannelIndex::SYSTEM.is_user());
    /// assert!(!ChannelIndex::new(10).is_user());
    /// ```
    #[must_use]
    pub const fn is_user(self) -> bool {
        (self.0 as usize) < MAX_CHANNELS - 1
    }

    /// Gets if this is [`ChannelIndex::SYSTEM`].
    #[must_use]
    pub const fn is_system(self) -> bool {
        self.0 == Self::SYSTEM.0
    }

    /// Gets if this index names any channel at all, user or system.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_CHANNELS
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Iterates over every channel available to applications.
    pub fn user() -> impl Iterator<Item = Self> {
        (0..Self::SYSTEM.0).map(Self)
    }
}

impl fmt::Debug for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_system() {
            f.write_str("ChannelIndex(SYSTEM)")
        } else {
            f.debug_tuple("ChannelIndex").field(&self.0).finish()
        }
    }
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ChannelIndex {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl FixedEncodeLen for ChannelIndex {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for ChannelIndex {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for ChannelIndex {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Delivery guarantee of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reliability {
    /// Delivered at most once, in any order, or not at all.
    ///
    /// Messages which do not fit into a single datagram are sent as
    /// [`Reliability::Reliable`] instead.
    Unreliable,
    /// Delivered exactly once, in send order relative to other reliable
    /// messages on the same channel.
    #[default]
    Reliable,
}

/// Send priority of a message.
///
/// When the send rate does not allow everything queued to go out at once,
/// higher priority messages are sent first. Messages of equal priority keep
/// their queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Priority(pub u8);

impl Priority {
    /// Lowest priority.
    pub const LOWEST: Self = Self(0);
    /// Lower than normal.
    pub const LOW: Self = Self(64);
    /// Priority used when none is specified.
    pub const NORMAL: Self = Self(128);
    /// Higher than normal.
    pub const HIGH: Self = Self(192);
    /// Highest priority available to applications.
    pub const HIGHEST: Self = Self(254);
    /// Used by system messages, which always jump the queue.
    pub const SYSTEM: Self = Self(u8::MAX);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// How a message should be sent.
///
/// # Examples
///
/// ```
/// # use carrier::channel::{ChannelIndex, Priority, Reliability, SendOptions};
/// let options = SendOptions::default()
///     .with_reliability(Reliability::Unreliable)
///     .with_priority(Priority::HIGH)
///     .with_channel(ChannelIndex::new(1));
/// assert_eq!(Priority::HIGH, options.priority);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SendOptions {
    /// Delivery guarantee.
    pub reliability: Reliability,
    /// Send priority.
    pub priority: Priority,
    /// Channel to send along.
    pub channel: ChannelIndex,
}

impl SendOptions {
    /// Sets [`SendOptions::reliability`].
    #[must_use]
    pub const fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Sets [`SendOptions::priority`].
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets [`SendOptions::channel`].
    #[must_use]
    pub const fn with_channel(mut self, channel: ChannelIndex) -> Self {
        self.channel = channel;
        self
    }
}
