use {
    crate::{AddressFamily, DEFAULT_MAX_DATAGRAM_SIZE, Datagram, Driver, DriverError},
    bytes::Bytes,
    core::net::SocketAddr,
    log::{debug, trace},
    std::{collections::VecDeque, io, net::UdpSocket, sync::Arc},
};

/// Buffer sizes used by a [`UdpDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDriverConfig {
    /// Size of the scratch buffer that incoming datagrams are read into.
    ///
    /// Datagrams larger than this are truncated by the OS.
    pub receive_buffer_size: usize,
    /// Maximum number of bytes that may be waiting in the outgoing queue after
    /// the socket reported that it would block.
    ///
    /// Datagrams which do not fit are dropped.
    pub send_buffer_size: usize,
    /// Maximum size of a single outgoing datagram.
    pub max_datagram_size: usize,
}

impl Default for UdpDriverConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: 64 * 1024,
            send_buffer_size: 256 * 1024,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// [`Driver`] backed by a non-blocking [`UdpSocket`].
#[derive(Debug)]
pub struct UdpDriver {
    socket: UdpSocket,
    config: UdpDriverConfig,
    recv_buf: Box<[u8]>,
    send_queue: VecDeque<Datagram>,
    send_queue_len: usize,
}

impl UdpDriver {
    /// Binds a socket to `addr`.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound or switched to non-blocking mode.
    pub fn bind(addr: SocketAddr, config: UdpDriverConfig) -> Result<Self, DriverError> {
        let socket = UdpSocket::bind(addr).map_err(|err| DriverError::Bind(Arc::new(err)))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| DriverError::Bind(Arc::new(err)))?;
        debug!(
            "bound UDP driver to {}",
            socket
                .local_addr()
                .map_or_else(|_| addr.to_string(), |addr| addr.to_string())
        );

        Ok(Self {
            socket,
            recv_buf: vec![0; config.receive_buffer_size].into_boxed_slice(),
            config,
            send_queue: VecDeque::new(),
            send_queue_len: 0,
        })
    }

    /// Binds a socket to the wildcard address of `family` on `port`.
    ///
    /// Pass port 0 to let the OS pick a port.
    ///
    /// # Errors
    ///
    /// See [`UdpDriver::bind`].
    pub fn bind_port(
        family: AddressFamily,
        port: u16,
        config: UdpDriverConfig,
    ) -> Result<Self, DriverError> {
        Self::bind(family.unspecified(port), config)
    }

    /// Gets the number of bytes waiting in the outgoing queue.
    #[must_use]
    pub const fn queued_bytes(&self) -> usize {
        self.send_queue_len
    }

    fn enqueue(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError> {
        if self.send_queue_len + payload.len() > self.config.send_buffer_size {
            trace!(
                "send queue full ({} / {} bytes), dropping datagram to {addr}",
                self.send_queue_len, self.config.send_buffer_size
            );
            return Err(DriverError::QueueFull { addr });
        }
        self.send_queue_len += payload.len();
        self.send_queue
            .push_back(Datagram::new(addr, Bytes::copy_from_slice(payload)));
        Ok(())
    }
}

impl Driver for UdpDriver {
    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        self.socket
            .local_addr()
            .map_err(|err| DriverError::LocalAddr(Arc::new(err)))
    }

    fn max_datagram_size(&self) -> usize {
        self.config.max_datagram_size
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError> {
        self.flush()?;
        if !self.send_queue.is_empty() {
            // keep datagrams in order behind the ones already waiting
            return self.enqueue(addr, payload);
        }

        match self.socket.send_to(payload, addr) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.enqueue(addr, payload),
            Err(err) => Err(DriverError::Send {
                addr,
                source: Arc::new(err),
            }),
        }
    }

    fn recv(&mut self) -> Result<Option<Datagram>, DriverError> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, addr)) => {
                    return Ok(Some(Datagram::new(
                        addr,
                        Bytes::copy_from_slice(&self.recv_buf[..len]),
                    )));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // an earlier datagram bounced off a closed port;
                // UDP has no connection to reset, so keep reading
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
                Err(err) => return Err(DriverError::Receive(Arc::new(err))),
            }
        }
    }

    fn flush(&mut self) -> Result<(), DriverError> {
        while let Some(datagram) = self.send_queue.front() {
            match self.socket.send_to(&datagram.payload, datagram.addr) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    let addr = datagram.addr;
                    self.send_queue_len -= datagram.payload.len();
                    self.send_queue.pop_front();
                    return Err(DriverError::Send {
                        addr,
                        source: Arc::new(err),
                    });
                }
            }
            self.send_queue_len -= datagram.payload.len();
            self.send_queue.pop_front();
        }
        Ok(())
    }
}
