use {
    super::{MessageSeq, PacketSeq, Seq},
    core::{
        cmp::Ordering,
        convert::Infallible,
        fmt,
        ops::{Add, AddAssign, Sub, SubAssign},
    },
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

impl Seq {
    /// Sequence number one step after zero.
    pub const ONE: Self = Self(1);

    /// Gets how many steps forward `rhs` is from `self`, taking the shortest
    /// path around the wraparound.
    ///
    /// The result is positive if `rhs` is ahead of `self`, and negative if it
    /// is behind. Two numbers more than [`i16::MAX`] steps apart are treated
    /// as the other way around, so `65534` is 3 steps behind `1`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::Seq;
    /// assert_eq!(0, Seq(7).dist_to(Seq(7)));
    /// assert_eq!(5, Seq(0).dist_to(Seq(5)));
    /// assert_eq!(-2, Seq(2).dist_to(Seq(0)));
    /// assert_eq!(1, Seq(u16::MAX).dist_to(Seq(0)));
    /// assert_eq!(-1, Seq(0).dist_to(Seq(u16::MAX)));
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for Seq {
    /// Orders by [`Seq::dist_to`], so a number just past the wraparound is
    /// greater than one just before it.
    ///
    /// The order is only consistent among values that are less than half the
    /// sequence space apart.
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist_to(*self).cmp(&0)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

impl PacketSeq {
    /// Packet sequence one step after zero.
    pub const ONE: Self = Self(Seq::ONE);

    /// Creates a packet sequence from a raw number.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(Seq(n))
    }
}

impl fmt::Debug for PacketSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PacketSeq").field(&self.0.0).finish()
    }
}

impl FixedEncodeLen for PacketSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for PacketSeq {
    type Error = Infallible;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for PacketSeq {
    type Error = Infallible;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}

impl MessageSeq {
    /// Message sequence one step after zero.
    pub const ONE: Self = Self(Seq::ONE);

    /// Creates a message sequence from a raw number.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(Seq(n))
    }
}

impl fmt::Debug for MessageSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MessageSeq").field(&self.0.0).finish()
    }
}

impl FixedEncodeLen for MessageSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for MessageSeq {
    type Error = Infallible;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for MessageSeq {
    type Error = Infallible;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}
