#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

mod driver;
mod memory;
pub mod sim;
mod udp;

pub use {
    self::{driver::*, memory::*, udp::*},
    bytes,
};
use {bytes::Bytes, core::net::SocketAddr};

/// Single datagram travelling between this endpoint and a peer.
///
/// For outgoing datagrams, [`Datagram::addr`] is the destination. For incoming
/// datagrams, it is the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Remote address of this datagram.
    pub addr: SocketAddr,
    /// Raw bytes of this datagram.
    pub payload: Bytes,
}

impl Datagram {
    /// Creates a new datagram.
    #[must_use]
    pub fn new(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }
}

/// Recommended maximum size of a single datagram, in bytes.
///
/// This is the minimum MTU that QUIC guarantees every path supports
/// ([RFC 9000 Section 14]), which keeps datagrams clear of IP fragmentation on
/// practically every network.
///
/// [RFC 9000 Section 14]: https://www.rfc-editor.org/rfc/rfc9000.html#section-14
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1200;
