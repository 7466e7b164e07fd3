use {
    super::{Acknowledge, PacketFlags, PacketHeader, PacketSeq},
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

impl FixedEncodeLen for PacketHeader {
    const ENCODE_LEN: usize = u8::ENCODE_LEN + PacketSeq::ENCODE_LEN + Acknowledge::ENCODE_LEN;
}

impl Encode for PacketHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.flags.0)?;
        dst.write(&self.seq)?;
        dst.write(&self.acks)?;
        Ok(())
    }
}

impl Decode for PacketHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            flags: PacketFlags(src.read()?),
            seq: src.read()?,
            acks: src.read()?,
        })
    }
}
