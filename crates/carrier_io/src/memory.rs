use {
    crate::{DEFAULT_MAX_DATAGRAM_SIZE, Datagram, Driver, DriverError},
    ahash::AHashMap,
    core::net::{IpAddr, Ipv4Addr, SocketAddr},
    log::trace,
    std::{
        io,
        sync::{Arc, Mutex, PoisonError},
    },
};

/// In-process datagram network connecting [`MemoryDriver`]s.
///
/// Each driver bound on a network receives the datagrams that other drivers
/// on the same network send to its address. Datagrams to addresses with no
/// bound driver are dropped, just like UDP datagrams sent to a closed port.
///
/// Delivery is immediate and lossless; pair this with a
/// [`Simulator`](crate::sim::Simulator) to inject faults.
///
/// # Examples
///
/// ```
/// use carrier_io::{Driver, MemoryNetwork};
///
/// let network = MemoryNetwork::new();
/// let mut a = network.bind_port(1000).unwrap();
/// let mut b = network.bind_port(2000).unwrap();
///
/// a.send(b.local_addr().unwrap(), b"hello").unwrap();
/// let datagram = b.recv().unwrap().unwrap();
/// assert_eq!(a.local_addr().unwrap(), datagram.addr);
/// assert_eq!(&b"hello"[..], &datagram.payload[..]);
/// assert!(b.recv().unwrap().is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    routes: AHashMap<SocketAddr, flume::Sender<Datagram>>,
    next_port: u16,
}

const FIRST_EPHEMERAL_PORT: u16 = 49152;

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a new driver to `addr`.
    ///
    /// If the port of `addr` is 0, an unused port is picked.
    ///
    /// # Errors
    ///
    /// Errors if another driver is already bound to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryDriver, DriverError> {
        let mut inner = self.lock();
        let addr = if addr.port() == 0 {
            let port = inner.free_port(addr.ip()).ok_or_else(|| {
                DriverError::Bind(Arc::new(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no free ports",
                )))
            })?;
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };

        if inner.routes.contains_key(&addr) {
            return Err(DriverError::Bind(Arc::new(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            ))));
        }

        let (send, recv) = flume::unbounded();
        inner.routes.insert(addr, send);
        Ok(MemoryDriver {
            network: self.clone(),
            local_addr: addr,
            recv,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        })
    }

    /// Binds a new driver to `127.0.0.1:port`.
    ///
    /// # Errors
    ///
    /// See [`MemoryNetwork::bind`].
    pub fn bind_port(&self, port: u16) -> Result<MemoryDriver, DriverError> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkInner {
    fn free_port(&mut self, ip: IpAddr) -> Option<u16> {
        let span = u16::MAX - FIRST_EPHEMERAL_PORT;
        for _ in 0..=span {
            let port = FIRST_EPHEMERAL_PORT + self.next_port % span;
            self.next_port = self.next_port.wrapping_add(1);
            if !self.routes.contains_key(&SocketAddr::new(ip, port)) {
                return Some(port);
            }
        }
        None
    }
}

/// [`Driver`] bound on a [`MemoryNetwork`].
///
/// The address is released when this driver is dropped.
#[derive(Debug)]
pub struct MemoryDriver {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    recv: flume::Receiver<Datagram>,
    max_datagram_size: usize,
}

impl MemoryDriver {
    /// Sets the maximum datagram size that this driver accepts for sending.
    #[must_use]
    pub fn with_max_datagram_size(mut self, max_datagram_size: usize) -> Self {
        self.max_datagram_size = max_datagram_size;
        self
    }
}

impl Driver for MemoryDriver {
    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.local_addr)
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError> {
        if payload.len() > self.max_datagram_size {
            return Err(DriverError::Send {
                addr,
                source: Arc::new(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "datagram of {} bytes exceeds maximum of {}",
                        payload.len(),
                        self.max_datagram_size
                    ),
                )),
            });
        }

        let route = self.network.lock().routes.get(&addr).cloned();
        let Some(route) = route else {
            trace!("{} -> {addr}: no route, dropping datagram", self.local_addr);
            return Ok(());
        };
        if route
            .send(Datagram::new(self.local_addr, payload.to_vec()))
            .is_err()
        {
            trace!("{} -> {addr}: peer closed, dropping datagram", self.local_addr);
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Datagram>, DriverError> {
        Ok(self.recv.try_recv().ok())
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        self.network.lock().routes.remove(&self.local_addr);
    }
}
