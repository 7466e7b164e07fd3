use {
    crate::Datagram,
    core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    derive_more::{Display, Error},
    std::{io, sync::Arc},
};

/// Non-blocking datagram transport between this endpoint and remote
/// addresses.
///
/// A driver is polled: [`Driver::recv`] returns immediately with `None` when
/// nothing has arrived, and [`Driver::send`] hands the datagram off without
/// waiting for the network. Datagrams may be lost, duplicated or reordered by
/// the underlying network; the driver does not attempt to hide this.
pub trait Driver: Send {
    /// Gets the address that this driver is bound to.
    ///
    /// # Errors
    ///
    /// Errors if the underlying socket cannot report its address.
    fn local_addr(&self) -> Result<SocketAddr, DriverError>;

    /// Gets the maximum number of bytes that a single datagram sent through
    /// this driver may contain.
    fn max_datagram_size(&self) -> usize;

    /// Sends a datagram to `addr`.
    ///
    /// # Errors
    ///
    /// Errors if the datagram could not be handed off to the network. The
    /// caller treats this as fatal for the connection to `addr`, except for
    /// [`DriverError::QueueFull`].
    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError>;

    /// Receives the next waiting datagram, if any.
    ///
    /// # Errors
    ///
    /// Errors if the underlying socket failed while receiving.
    fn recv(&mut self) -> Result<Option<Datagram>, DriverError>;

    /// Attempts to send any datagrams which were queued because the network
    /// was not ready to accept them.
    ///
    /// # Errors
    ///
    /// Errors if sending a queued datagram fails.
    fn flush(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Takes the next security failure reported by a secured driver.
    ///
    /// Plain drivers never report one.
    fn poll_security_error(&mut self) -> Option<(SocketAddr, SecurityError)> {
        None
    }
}

impl<T: Driver + ?Sized> Driver for Box<T> {
    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        T::local_addr(self)
    }

    fn max_datagram_size(&self) -> usize {
        T::max_datagram_size(self)
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError> {
        T::send(self, addr, payload)
    }

    fn recv(&mut self) -> Result<Option<Datagram>, DriverError> {
        T::recv(self)
    }

    fn flush(&mut self) -> Result<(), DriverError> {
        T::flush(self)
    }

    fn poll_security_error(&mut self) -> Option<(SocketAddr, SecurityError)> {
        T::poll_security_error(self)
    }
}

/// Socket-level failure raised by a [`Driver`].
#[derive(Debug, Clone, Display, Error)]
pub enum DriverError {
    /// Failed to bind the socket to a local address.
    #[display("failed to bind socket")]
    Bind(Arc<io::Error>),
    /// Failed to get the local address of the socket.
    #[display("failed to get local address")]
    LocalAddr(Arc<io::Error>),
    /// Failed to send a datagram to a peer.
    #[display("failed to send datagram to {addr}")]
    Send {
        /// Destination of the datagram.
        addr: SocketAddr,
        /// Underlying error.
        source: Arc<io::Error>,
    },
    /// Failed to receive a datagram.
    #[display("failed to receive datagram")]
    Receive(Arc<io::Error>),
    /// The outgoing queue had no room left for a datagram, so it was dropped.
    ///
    /// The connection stays up; the datagram is treated as lost.
    #[display("send queue full, dropped datagram to {addr}")]
    QueueFull {
        /// Destination of the dropped datagram.
        addr: SocketAddr,
    },
}

impl DriverError {
    /// Gets the peer address that this error is attributed to, if any.
    #[must_use]
    pub const fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Send { addr, .. } | Self::QueueFull { addr } => Some(*addr),
            Self::Bind(_) | Self::LocalAddr(_) | Self::Receive(_) => None,
        }
    }
}

/// Failure raised by a secured [`Driver`] or by protocol validation.
///
/// Security errors are reported to the application but never tear down a
/// connection by themselves.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum SecurityError {
    /// The peer's certificate failed verification.
    #[display("certificate verification failed: {reason}")]
    Certificate {
        /// Description of the failure.
        reason: String,
    },
    /// A cryptographic handshake or record failed to validate.
    #[display("cryptographic failure: {reason}")]
    Crypto {
        /// Description of the failure.
        reason: String,
    },
    /// A channel index outside the valid range was used.
    #[display("channel {channel} is out of bounds")]
    ChannelOutOfBounds {
        /// Offending channel index.
        channel: u8,
    },
}

/// IP version that a [`Driver`] binds to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressFamily {
    /// IPv4.
    #[default]
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    /// Creates the wildcard address of this family on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use carrier_io::AddressFamily;
    ///
    /// assert_eq!("0.0.0.0:1234", AddressFamily::V4.unspecified(1234).to_string());
    /// assert_eq!("[::]:1234", AddressFamily::V6.unspecified(1234).to_string());
    /// ```
    #[must_use]
    pub const fn unspecified(self, port: u16) -> SocketAddr {
        let ip = match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, port)
    }

    /// Gets if `addr` belongs to this family.
    #[must_use]
    pub const fn matches(self, addr: &SocketAddr) -> bool {
        matches!(
            (self, addr),
            (Self::V4, SocketAddr::V4(_)) | (Self::V6, SocketAddr::V6(_))
        )
    }
}
