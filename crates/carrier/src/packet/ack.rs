use {
    super::{Acknowledge, PacketSeq},
    core::{convert::Infallible, fmt},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

impl Acknowledge {
    /// Records that the packet `seq` has been received.
    ///
    /// Recording the same sequence twice has no further effect. Packets which
    /// are more than 31 steps behind the newest recorded packet fall out of the
    /// window and are silently forgotten.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::{Acknowledge, PacketSeq};
    /// let mut acks = Acknowledge::default();
    /// acks.record(PacketSeq::new(3));
    /// acks.record(PacketSeq::new(1));
    /// assert!(acks.contains(PacketSeq::new(1)));
    /// assert!(!acks.contains(PacketSeq::new(2)));
    /// assert!(acks.contains(PacketSeq::new(3)));
    ///
    /// acks.record(PacketSeq::new(10));
    /// assert_eq!(PacketSeq::new(10), acks.last_recv);
    /// assert!(acks.contains(PacketSeq::new(3)));
    ///
    /// let before = acks;
    /// acks.record(PacketSeq::new(3));
    /// assert_eq!(before, acks);
    /// ```
    pub fn record(&mut self, seq: PacketSeq) {
        let behind = seq.dist_to(*self.last_recv);
        if behind >= 0 {
            self.bits |= bit(u32::from(behind.unsigned_abs()));
        } else {
            // newer than anything so far: slide the window forward
            let ahead = u32::from(behind.unsigned_abs());
            self.bits = self.bits.checked_shl(ahead).unwrap_or(0) | 1;
            self.last_recv = seq;
        }
    }

    /// Gets if the packet `seq` is recorded as received.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::{Acknowledge, PacketSeq};
    /// let mut acks = Acknowledge::default();
    /// acks.record(PacketSeq::new(40));
    /// assert!(acks.contains(PacketSeq::new(40)));
    /// assert!(!acks.contains(PacketSeq::new(41)));
    /// assert!(!acks.contains(PacketSeq::new(5)));
    /// ```
    #[must_use]
    pub fn contains(&self, seq: PacketSeq) -> bool {
        let behind = seq.dist_to(*self.last_recv);
        behind >= 0 && self.bits & bit(u32::from(behind.unsigned_abs())) != 0
    }

    /// Iterates over every packet sequence recorded in this window, newest
    /// first.
    ///
    /// [`Acknowledge::last_recv`] itself is only yielded if bit 0 is set.
    ///
    /// # Examples
    ///
    /// ```
    /// # use carrier::packet::{Acknowledge, PacketSeq};
    /// let acks = Acknowledge {
    ///     last_recv: PacketSeq::new(20),
    ///     bits: 0b1001,
    /// };
    /// let seqs = acks.seqs().collect::<Vec<_>>();
    /// assert_eq!(vec![PacketSeq::new(20), PacketSeq::new(17)], seqs);
    /// ```
    pub fn seqs(self) -> impl Iterator<Item = PacketSeq> {
        (0..32u16)
            .filter(move |&behind| self.bits & bit(u32::from(behind)) != 0)
            .map(move |behind| self.last_recv - PacketSeq::new(behind))
    }
}

fn bit(index: u32) -> u32 {
    1u32.checked_shl(index).unwrap_or(0)
}

impl fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Acknowledge")
            .field("last_recv", &self.last_recv)
            .field("bits", &format_args!("{:#034b}", self.bits))
            .finish()
    }
}

impl FixedEncodeLen for Acknowledge {
    const ENCODE_LEN: usize = PacketSeq::ENCODE_LEN + u32::ENCODE_LEN;
}

impl Encode for Acknowledge {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.last_recv)?;
        dst.write(&self.bits)?;
        Ok(())
    }
}

impl Decode for Acknowledge {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            last_recv: src.read()?,
            bits: src.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, octs::test::*};

    #[test]
    fn far_jump_clears_window() {
        let mut acks = Acknowledge::default();
        acks.record(PacketSeq::new(0));
        acks.record(PacketSeq::new(1));
        acks.record(PacketSeq::new(100));
        assert_eq!(1, acks.bits);
        assert!(!acks.contains(PacketSeq::new(1)));
    }

    #[test]
    fn window_spans_wraparound() {
        let mut acks = Acknowledge::default();
        acks.record(PacketSeq::new(u16::MAX));
        acks.record(PacketSeq::new(1));
        assert_eq!(PacketSeq::new(1), acks.last_recv);
        assert!(acks.contains(PacketSeq::new(u16::MAX)));
        assert_eq!(
            vec![PacketSeq::new(1), PacketSeq::new(u16::MAX)],
            acks.seqs().collect::<Vec<_>>()
        );
    }

    #[test]
    fn too_old_is_ignored() {
        let mut acks = Acknowledge::default();
        acks.record(PacketSeq::new(50));
        acks.record(PacketSeq::new(10));
        assert!(!acks.contains(PacketSeq::new(10)));
        assert_eq!(1, acks.bits);
    }

    #[test]
    fn encode_decode() {
        hint_round_trip(&Acknowledge {
            last_recv: PacketSeq::new(u16::MAX),
            bits: u32::MAX,
        });
    }
}
