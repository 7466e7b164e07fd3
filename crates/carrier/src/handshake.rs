//! See [`Handshake`].

use {
    crate::connection::{ConnectionId, DisconnectReason},
    core::net::SocketAddr,
    octs::{BytesMut, Read, Write},
};

/// Outcome of [`Handshake::on_receive_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Accept the connection and reply with the written payload.
    Accept,
    /// Decide later.
    ///
    /// The connection stays hidden from the application. The peer keeps
    /// resending its request, and each one is offered to the handshake again.
    Pending,
    /// Refuse the connection.
    Reject(DisconnectReason),
}

/// Application-defined exchange that decides whether two peers connect.
///
/// The initiating side writes a request payload in
/// [`Handshake::on_initiate`]. The accepting side inspects it in
/// [`Handshake::on_receive_request`] and writes a reply, which the initiating
/// side inspects in [`Handshake::on_receive_ack`].
///
/// Every method runs inside [`Carrier::update`](crate::Carrier::update).
pub trait Handshake: Send {
    /// Decides whether a connect request from an unknown address is looked at
    /// at all.
    fn on_new_connection(&mut self, addr: SocketAddr) -> bool {
        let _ = addr;
        true
    }

    /// Writes the payload of the connect request to send to a peer.
    fn on_initiate(&mut self, id: ConnectionId, request: &mut BytesMut);

    /// Decides what to do with a connect request, writing the reply payload
    /// into `reply` when accepting.
    fn on_receive_request(
        &mut self,
        id: ConnectionId,
        request: &[u8],
        reply: &mut BytesMut,
    ) -> HandshakeResult;

    /// Decides whether a connect request from a peer which is already
    /// connected is tolerated.
    ///
    /// Returning `false` closes the connection with
    /// [`DisconnectReason::WasAlreadyConnected`].
    fn on_confirm_request(&mut self, id: ConnectionId, request: &[u8]) -> bool {
        let _ = (id, request);
        true
    }

    /// Decides whether the reply to our connect request is acceptable.
    ///
    /// Returning `false` fails the connection with
    /// [`DisconnectReason::HandshakeRejected`].
    fn on_receive_ack(&mut self, id: ConnectionId, ack: &[u8]) -> bool;

    /// Called once a connection that the handshake has seen goes away.
    fn on_disconnect(&mut self, id: ConnectionId) {
        let _ = id;
    }
}

impl<T: Handshake + ?Sized> Handshake for Box<T> {
    fn on_new_connection(&mut self, addr: SocketAddr) -> bool {
        T::on_new_connection(self, addr)
    }

    fn on_initiate(&mut self, id: ConnectionId, request: &mut BytesMut) {
        T::on_initiate(self, id, request);
    }

    fn on_receive_request(
        &mut self,
        id: ConnectionId,
        request: &[u8],
        reply: &mut BytesMut,
    ) -> HandshakeResult {
        T::on_receive_request(self, id, request, reply)
    }

    fn on_confirm_request(&mut self, id: ConnectionId, request: &[u8]) -> bool {
        T::on_confirm_request(self, id, request)
    }

    fn on_receive_ack(&mut self, id: ConnectionId, ack: &[u8]) -> bool {
        T::on_receive_ack(self, id, ack)
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        T::on_disconnect(self, id);
    }
}

/// [`Handshake`] which only checks that both peers use the same version.
///
/// # Examples
///
/// ```
/// use {
///     carrier::{ConnectionId, DefaultHandshake, DisconnectReason, Handshake, HandshakeResult},
///     octs::BytesMut,
/// };
///
/// let id = ConnectionId::from_raw(1);
/// let mut client = DefaultHandshake::new(3);
/// let mut request = BytesMut::new();
/// client.on_initiate(id, &mut request);
///
/// let mut reply = BytesMut::new();
/// let mut server = DefaultHandshake::new(4);
/// assert_eq!(
///     HandshakeResult::Reject(DisconnectReason::VersionMismatch),
///     server.on_receive_request(id, &request, &mut reply)
/// );
///
/// let mut server = DefaultHandshake::new(3);
/// assert_eq!(
///     HandshakeResult::Accept,
///     server.on_receive_request(id, &request, &mut reply)
/// );
/// assert!(client.on_receive_ack(id, &reply));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultHandshake {
    /// Version written to and expected in every payload.
    pub version: u32,
}

impl DefaultHandshake {
    /// Creates a handshake for `version`.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self { version }
    }

    fn write_version(&self, dst: &mut BytesMut) {
        dst.write(&self.version)
            .expect("BytesMut should grow the buffer when writing over capacity");
    }

    fn matches(&self, mut src: &[u8]) -> bool {
        src.read::<u32>().is_ok_and(|version| version == self.version)
    }
}

impl Handshake for DefaultHandshake {
    fn on_initiate(&mut self, _: ConnectionId, request: &mut BytesMut) {
        self.write_version(request);
    }

    fn on_receive_request(
        &mut self,
        _: ConnectionId,
        request: &[u8],
        reply: &mut BytesMut,
    ) -> HandshakeResult {
        if self.matches(request) {
            self.write_version(reply);
            HandshakeResult::Accept
        } else {
            HandshakeResult::Reject(DisconnectReason::VersionMismatch)
        }
    }

    fn on_receive_ack(&mut self, _: ConnectionId, ack: &[u8]) -> bool {
        self.matches(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_big_endian() {
        let mut buf = BytesMut::new();
        DefaultHandshake::new(0x0102_0304).on_initiate(ConnectionId::from_raw(1), &mut buf);
        assert_eq!(&[1, 2, 3, 4][..], &buf[..]);
    }

    #[test]
    fn truncated_request_is_rejected() {
        let mut reply = BytesMut::new();
        let result = DefaultHandshake::new(1).on_receive_request(
            ConnectionId::from_raw(1),
            &[0, 0],
            &mut reply,
        );
        assert_eq!(
            HandshakeResult::Reject(DisconnectReason::VersionMismatch),
            result
        );
        assert!(reply.is_empty());
    }
}
