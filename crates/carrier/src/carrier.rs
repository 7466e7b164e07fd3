//! See [`Carrier`].

use {
    crate::{
        callback::Callback,
        channel::{ChannelIndex, Reliability},
        clock::{Clock, ClockSync},
        config::{CarrierConfig, ConfigError},
        connection::{Connection, ConnectionId, ConnectionState, DisconnectReason, Role},
        event::{CarrierEvent, CarrierListener},
        handle::{CarrierHandle, Command, Registry},
        handshake::{DefaultHandshake, Handshake, HandshakeResult},
        packet::{MAX_HEADER_OVERHEAD, Packet, SystemMessage},
    },
    ahash::AHashMap,
    carrier_io::{
        DEFAULT_MAX_DATAGRAM_SIZE, Datagram, Driver, DriverError, UdpDriver, UdpDriverConfig,
        sim::Simulator,
    },
    core::{net::SocketAddr, ops::Deref, time::Duration},
    derive_more::{Display, Error, From},
    log::{debug, trace, warn},
    octs::{Bytes, BytesMut, Read},
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    },
    web_time::Instant,
};

/// Protocol endpoint multiplexing connections over one [`Driver`].
///
/// Nothing happens until [`Carrier::update`] is called: that is where
/// datagrams are received and sent, timers run, and listeners are notified.
/// Call it regularly (every frame of a game loop, or through a
/// [`CarrierThread`](crate::CarrierThread)).
///
/// Every [`CarrierHandle`] operation is available on the carrier itself
/// through [`Deref`].
pub struct Carrier {
    cx: Context,
    connections: AHashMap<ConnectionId, Connection>,
    commands: flume::Receiver<Command>,
    wake: flume::Receiver<()>,
}

struct Context {
    config: CarrierConfig,
    handle: CarrierHandle,
    driver: Box<dyn Driver>,
    handshake: Box<dyn Handshake>,
    simulator: Option<Box<dyn Simulator>>,
    listeners: Vec<Box<dyn CarrierListener>>,
    local_addr: SocketAddr,
    mtu: usize,
    disconnect_detection: bool,
    clock_sync: Option<ClockSync>,
    events: Vec<CarrierEvent>,
    callbacks: Vec<Callback>,
}

/// How the application learns that a connection is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Disconnect,
    FailedToConnect,
    Silent,
}

impl Notify {
    const fn for_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => Self::FailedToConnect,
            ConnectionState::Connected => Self::Disconnect,
            ConnectionState::Disconnecting | ConnectionState::Disconnected => Self::Silent,
        }
    }
}

/// Failed to [`CarrierBuilder::build`] a [`Carrier`].
#[derive(Debug, Clone, Display, Error, From)]
pub enum BuildError {
    /// No driver was given.
    #[display("missing driver")]
    MissingDriver,
    /// The configuration is invalid.
    #[display("invalid config")]
    #[from]
    InvalidConfig(ConfigError),
    /// The driver failed.
    #[display("driver error")]
    #[from]
    Driver(DriverError),
    /// The driver's datagrams cannot even hold packet headers.
    #[display("max datagram size {size} is too small, must be over {min}")]
    DatagramTooSmall {
        /// Maximum datagram size of the driver.
        size: usize,
        /// Header overhead which the size must exceed.
        min: usize,
    },
}

/// Assembles a [`Carrier`] from its collaborators.
///
/// # Examples
///
/// ```
/// use carrier::{Carrier, CarrierConfig, carrier_io::MemoryNetwork};
///
/// let network = MemoryNetwork::new();
/// let carrier = Carrier::builder(CarrierConfig::default())
///     .driver(network.bind_port(0).unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(0, carrier.num_connections());
/// ```
#[must_use]
pub struct CarrierBuilder {
    config: CarrierConfig,
    driver: Option<Box<dyn Driver>>,
    handshake: Option<Box<dyn Handshake>>,
    simulator: Option<Box<dyn Simulator>>,
    listeners: Vec<Box<dyn CarrierListener>>,
}

impl CarrierBuilder {
    /// Sets the driver which moves datagrams. Required.
    pub fn driver(mut self, driver: impl Driver + 'static) -> Self {
        self.driver = Some(Box::new(driver));
        self
    }

    /// Sets the handshake.
    ///
    /// Defaults to a [`DefaultHandshake`] for
    /// [`CarrierConfig::protocol_version`].
    pub fn handshake(mut self, handshake: impl Handshake + 'static) -> Self {
        self.handshake = Some(Box::new(handshake));
        self
    }

    /// Sets a simulator which every datagram passes through.
    pub fn simulator(mut self, simulator: impl Simulator + 'static) -> Self {
        self.simulator = Some(Box::new(simulator));
        self
    }

    /// Adds a listener.
    pub fn listener(mut self, listener: impl CarrierListener + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Creates the carrier.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, no driver was given, or the driver
    /// cannot be used.
    pub fn build(self) -> Result<Carrier, BuildError> {
        self.build_at(Instant::now())
    }

    /// Creates the carrier, with its clock starting at `now`.
    ///
    /// # Errors
    ///
    /// See [`CarrierBuilder::build`].
    pub fn build_at(self, now: Instant) -> Result<Carrier, BuildError> {
        self.config.validate()?;
        let driver = self.driver.ok_or(BuildError::MissingDriver)?;
        let local_addr = driver.local_addr()?;
        let mtu = driver.max_datagram_size();
        if mtu <= MAX_HEADER_OVERHEAD {
            return Err(BuildError::DatagramTooSmall {
                size: mtu,
                min: MAX_HEADER_OVERHEAD,
            });
        }

        let registry = Registry::new(
            self.config.max_connections,
            self.config.address_family,
            Clock::new(now),
        );
        let (send_commands, commands) = flume::unbounded();
        let (send_wake, wake) = flume::bounded(1);
        let handle = CarrierHandle::new(
            Arc::new(Mutex::new(registry)),
            send_commands,
            send_wake,
            self.config.thread_instant_response,
        );
        let handshake = self.handshake.unwrap_or_else(|| -> Box<dyn Handshake> {
            Box::new(DefaultHandshake::new(self.config.protocol_version))
        });
        debug!("created carrier on {local_addr} with max datagram size {mtu}");

        Ok(Carrier {
            cx: Context {
                disconnect_detection: self.config.enable_disconnect_detection,
                config: self.config,
                handle,
                driver,
                handshake,
                simulator: self.simulator,
                listeners: self.listeners,
                local_addr,
                mtu,
                clock_sync: None,
                events: Vec::new(),
                callbacks: Vec::new(),
            },
            connections: AHashMap::new(),
            commands,
            wake,
        })
    }
}

impl Deref for Carrier {
    type Target = CarrierHandle;

    fn deref(&self) -> &Self::Target {
        &self.cx.handle
    }
}

impl Carrier {
    /// Starts building a carrier.
    pub fn builder(config: CarrierConfig) -> CarrierBuilder {
        CarrierBuilder {
            config,
            driver: None,
            handshake: None,
            simulator: None,
            listeners: Vec::new(),
        }
    }

    /// Creates a carrier on a UDP socket bound to
    /// [`CarrierConfig::port`] of [`CarrierConfig::address_family`].
    ///
    /// # Errors
    ///
    /// See [`CarrierBuilder::build`].
    pub fn bind_udp(config: CarrierConfig) -> Result<Self, BuildError> {
        let driver = UdpDriver::bind_port(
            config.address_family,
            config.port,
            UdpDriverConfig {
                receive_buffer_size: config.driver_receive_buffer_size,
                send_buffer_size: config.driver_send_buffer_size,
                max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            },
        )?;
        Self::builder(config).driver(driver).build()
    }

    /// Gets a handle which can be sent to other threads.
    #[must_use]
    pub fn handle(&self) -> CarrierHandle {
        self.cx.handle.clone()
    }

    /// Gets the config this carrier was built with.
    #[must_use]
    pub const fn config(&self) -> &CarrierConfig {
        &self.cx.config
    }

    /// Gets the local address of the driver.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.cx.local_addr
    }

    /// Adds a listener.
    pub fn add_listener(&mut self, listener: impl CarrierListener + 'static) {
        self.cx.listeners.push(Box::new(listener));
    }

    /// Waits until a handle pushes a command, or `timeout` passes.
    ///
    /// Handles only wake the carrier if
    /// [`CarrierConfig::thread_instant_response`] is set.
    pub(crate) fn wait(&self, timeout: Duration) {
        let _ = self.wake.recv_timeout(timeout);
    }

    /// Runs one update at the current time.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Runs one update at `now`.
    ///
    /// This carries out queued handle commands, receives and processes every
    /// waiting datagram, runs timers, sends what is due, then notifies
    /// listeners and runs ready send callbacks.
    ///
    /// `now` should never go backwards between calls.
    pub fn update_at(&mut self, now: Instant) {
        self.process_commands(now);
        self.receive(now);
        self.tick(now);
        self.flush(now);
        self.publish();
        self.dispatch();
    }

    /// Closes every connection with [`DisconnectReason::ShuttingDown`],
    /// sends the disconnect notices and forgets the connections.
    pub fn shutdown(&mut self) {
        self.shutdown_at(Instant::now());
    }

    /// Like [`Carrier::shutdown`], at `now`.
    pub fn shutdown_at(&mut self, now: Instant) {
        self.process_commands(now);
        for conn in self.connections.values_mut() {
            let notify = Notify::for_state(conn.state);
            self.cx
                .close(conn, now, DisconnectReason::ShuttingDown, notify);
        }
        self.flush(now);
        for conn in self.connections.values_mut() {
            conn.set_state(ConnectionState::Disconnected);
        }
        self.publish();
        self.dispatch();
    }

    fn process_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect { id, addr } => self.start_connect(now, id, addr),
                Command::Send {
                    id,
                    payload,
                    options,
                    callback,
                } => match self.connections.get_mut(&id) {
                    Some(conn) if conn.state == ConnectionState::Connected => {
                        conn.send(payload, options, callback);
                    }
                    _ => trace!("dropping message to {id}: not connected"),
                },
                Command::Disconnect { id } => {
                    for conn in self.connections.values_mut().filter(|conn| {
                        conn.visible && (id == ConnectionId::ALL || id == conn.id)
                    }) {
                        self.cx
                            .close(conn, now, DisconnectReason::UserRequested, Notify::Disconnect);
                    }
                }
                Command::DebugDelete { id } => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        self.cx.delete(conn, DisconnectReason::DebugDeleted);
                    }
                }
                Command::SetDisconnectDetection(enabled) => {
                    self.cx.disconnect_detection = enabled;
                }
                Command::StartClockSync { interval, is_host } => {
                    self.cx.clock_sync = Some(ClockSync {
                        interval,
                        is_host,
                        last_sent_at: None,
                    });
                }
                Command::StopClockSync => {
                    self.cx.clock_sync = None;
                    self.cx.handle.lock().clock.reset();
                }
            }
        }
    }

    fn start_connect(&mut self, now: Instant, id: ConnectionId, addr: SocketAddr) {
        if self.connections.contains_key(&id) {
            return;
        }
        debug!("{id}: connecting to {addr}");
        let mut conn = Connection::new(id, addr, Role::Initiator, self.cx.mtu, &self.cx.config, now);
        let mut request = BytesMut::new();
        self.cx.handshake.on_initiate(id, &mut request);
        conn.handshake_payload = request.freeze();
        self.connections.insert(id, conn);
    }

    fn receive(&mut self, now: Instant) {
        let mut datagrams = Vec::new();
        loop {
            match self.cx.driver.recv() {
                Ok(Some(datagram)) => match &mut self.cx.simulator {
                    Some(sim) => datagrams.extend(sim.on_incoming(now, datagram)),
                    None => datagrams.push(datagram),
                },
                Ok(None) => break,
                Err(error) => {
                    warn!("failed to receive: {error}");
                    self.cx.events.push(CarrierEvent::DriverError {
                        id: ConnectionId::INVALID,
                        error,
                    });
                    break;
                }
            }
        }
        if let Some(sim) = &mut self.cx.simulator {
            while let Some(datagram) = sim.poll_incoming(now) {
                datagrams.push(datagram);
            }
        }

        for datagram in datagrams {
            self.on_datagram(now, datagram);
        }

        while let Some((addr, error)) = self.cx.driver.poll_security_error() {
            let id = self
                .cx
                .handle
                .lock()
                .by_addr
                .get(&addr)
                .copied()
                .unwrap_or(ConnectionId::INVALID);
            self.cx.events.push(CarrierEvent::SecurityError { id, error });
        }
    }

    fn on_datagram(&mut self, now: Instant, datagram: Datagram) {
        let Datagram { addr, mut payload } = datagram;
        let len = payload.len();
        let packet = payload.read::<Packet>();
        let id = self.cx.handle.lock().by_addr.get(&addr).copied();

        if let Some(conn) = id.and_then(|id| self.connections.get_mut(&id)) {
            match packet {
                Ok(packet) => self.cx.on_packet(conn, now, len, packet),
                Err(err) => {
                    trace!("{}: dropping bad packet: {err:?}", conn.id);
                    if conn.on_bad_packet(len) {
                        let notify = Notify::for_state(conn.state);
                        self.cx.close(conn, now, DisconnectReason::BadPackets, notify);
                    }
                }
            }
            return;
        }

        let Ok(packet) = packet else {
            trace!("{addr}: dropping bad packet from unknown address");
            return;
        };
        if !is_connect_attempt(&packet) {
            trace!("{addr}: dropping packet from unknown address");
            return;
        }
        if !self.cx.handshake.on_new_connection(addr) {
            debug!("{addr}: handshake refused new connection");
            return;
        }
        let Some(id) = self.cx.handle.lock().allocate(addr, false) else {
            debug!("{addr}: refusing new connection, too many connections");
            return;
        };
        debug!("{id}: incoming connection from {addr}");
        let mut conn = Connection::new(id, addr, Role::Acceptor, self.cx.mtu, &self.cx.config, now);
        self.cx.on_packet(&mut conn, now, len, packet);
        self.connections.insert(id, conn);
    }

    fn tick(&mut self, now: Instant) {
        let send_clock = self
            .cx
            .clock_sync
            .as_mut()
            .is_some_and(|sync| sync.should_send(now));
        let host_time = self.cx.handle.lock().clock.time_at(now);
        for conn in self.connections.values_mut() {
            self.cx.tick(conn, now, send_clock.then_some(host_time));
        }
    }

    fn flush(&mut self, now: Instant) {
        let Self {
            cx, connections, ..
        } = self;

        // a driver may report an earlier datagram to another peer while sending this one
        let mut errors = Vec::new();
        for conn in connections.values_mut() {
            if conn.state == ConnectionState::Disconnected && !conn.closed {
                continue;
            }
            conn.closed = false;
            let keep_alive = conn.state == ConnectionState::Connected
                && now.saturating_duration_since(conn.last_send_at)
                    >= cx.config.keep_alive_interval;
            for packet in conn.flush(now, keep_alive) {
                match cx.send_datagram(now, conn.addr, packet) {
                    Ok(()) => {}
                    Err(error) if error.addr() == Some(conn.addr) => {
                        cx.fail(conn, error);
                        break;
                    }
                    Err(error) => errors.push(error),
                }
            }
        }

        if let Some(sim) = &mut cx.simulator {
            while let Some(datagram) = sim.poll_outgoing(now) {
                if let Err(error) = cx.driver.send(datagram.addr, &datagram.payload) {
                    errors.push(error);
                }
            }
        }
        if let Err(error) = cx.driver.flush() {
            errors.push(error);
        }
        for error in errors {
            cx.on_driver_error(connections, error);
        }

        for conn in connections.values_mut() {
            cx.callbacks.extend(conn.sender.take_ready_callbacks());
        }
    }

    fn publish(&mut self) {
        let Self {
            cx, connections, ..
        } = self;
        let mut registry = cx.handle.lock();
        connections.retain(|id, conn| {
            if conn.state == ConnectionState::Disconnected {
                debug!("{id}: deleted");
                registry.remove(*id);
                return false;
            }
            let Some(entry) = registry.entries.get_mut(id) else {
                return true;
            };
            entry.visible = conn.visible;
            for (channel, msg) in conn.inbox.drain(..) {
                entry.received[channel.as_usize()].push_back(msg);
            }
            let queued = entry.received.iter().map(VecDeque::len).sum();
            // a disconnect requested through a handle is not undone before it
            // is carried out
            let state = if entry.stats.state == ConnectionState::Disconnecting
                && matches!(
                    conn.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                ConnectionState::Disconnecting
            } else {
                conn.state
            };
            entry.stats = conn.statistics(queued);
            entry.stats.state = state;
            true
        });
    }

    fn dispatch(&mut self) {
        let events = core::mem::take(&mut self.cx.events);
        for event in &events {
            trace!("event: {event:?}");
            for listener in &mut self.cx.listeners {
                event.dispatch(listener.as_mut(), &self.cx.handle);
            }
        }
        for callback in core::mem::take(&mut self.cx.callbacks) {
            callback();
        }
    }
}

/// Gets if `packet` carries a connect request.
fn is_connect_attempt(packet: &Packet) -> bool {
    packet.frames.iter().any(|frame| {
        frame.header.channel == ChannelIndex::SYSTEM
            && frame.header.position.is_single()
            && SystemMessage::is_connect_request(&frame.payload)
    })
}

impl Context {
    fn notify(&mut self, conn: &Connection, notify: Notify, reason: DisconnectReason) {
        if !conn.visible {
            return;
        }
        let id = conn.id;
        match notify {
            Notify::Disconnect => self.events.push(CarrierEvent::Disconnect { id, reason }),
            Notify::FailedToConnect => {
                self.events.push(CarrierEvent::FailedToConnect { id, reason });
            }
            Notify::Silent => {}
        }
    }

    /// Starts closing `conn` gracefully, sending the peer a disconnect notice.
    fn close(
        &mut self,
        conn: &mut Connection,
        now: Instant,
        reason: DisconnectReason,
        notify: Notify,
    ) {
        if matches!(
            conn.state,
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        ) {
            return;
        }
        debug!("{}: closing: {reason}", conn.id);
        self.notify(conn, notify, reason);
        conn.send_system(&SystemMessage::Disconnect { reason }, Reliability::Reliable);
        conn.set_state(ConnectionState::Disconnecting);
        conn.disconnecting_since = Some(now);
        self.handshake.on_disconnect(conn.id);
    }

    /// Deletes `conn` at the end of this update without telling the peer.
    fn delete(&mut self, conn: &mut Connection, reason: DisconnectReason) {
        if matches!(
            conn.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.notify(conn, Notify::for_state(conn.state), reason);
            self.handshake.on_disconnect(conn.id);
        }
        conn.set_state(ConnectionState::Disconnected);
        conn.closed = false;
    }

    fn fail(&mut self, conn: &mut Connection, error: DriverError) {
        warn!("{}: driver error: {error}", conn.id);
        self.events.push(CarrierEvent::DriverError { id: conn.id, error });
        self.delete(conn, DisconnectReason::DriverError);
    }

    fn on_driver_error(
        &mut self,
        connections: &mut AHashMap<ConnectionId, Connection>,
        error: DriverError,
    ) {
        if let DriverError::QueueFull { addr } = error {
            trace!("{addr}: datagram dropped, send queue full");
            return;
        }
        let conn = error.addr().and_then(|addr| {
            connections
                .values_mut()
                .find(|conn| conn.addr == addr && conn.state != ConnectionState::Disconnected)
        });
        match conn {
            Some(conn) => self.fail(conn, error),
            None => {
                warn!("driver error: {error}");
                self.events.push(CarrierEvent::DriverError {
                    id: ConnectionId::INVALID,
                    error,
                });
            }
        }
    }

    fn send_datagram(
        &mut self,
        now: Instant,
        addr: SocketAddr,
        payload: Bytes,
    ) -> Result<(), DriverError> {
        let datagram = match &mut self.simulator {
            Some(sim) => sim.on_outgoing(now, Datagram::new(addr, payload)),
            None => Some(Datagram::new(addr, payload)),
        };
        let Some(datagram) = datagram else {
            return Ok(());
        };
        match self.driver.send(datagram.addr, &datagram.payload) {
            Err(DriverError::QueueFull { addr }) => {
                trace!("{addr}: datagram dropped, send queue full");
                Ok(())
            }
            result => result,
        }
    }

    fn on_packet(&mut self, conn: &mut Connection, now: Instant, len: usize, packet: Packet) {
        let mut security_errors = Vec::new();
        let result = conn.on_packet(
            now,
            self.config.max_reassembly_memory,
            len,
            packet,
            &mut security_errors,
        );
        for error in security_errors {
            self.events.push(CarrierEvent::SecurityError { id: conn.id, error });
        }
        let delivered = match result {
            Ok(delivered) => delivered,
            Err(reason) => {
                let notify = Notify::for_state(conn.state);
                self.close(conn, now, reason, notify);
                return;
            }
        };

        for (channel, mut msg) in delivered {
            if channel.is_system() {
                match msg.read::<SystemMessage>() {
                    Ok(msg) => self.on_system(conn, now, msg),
                    Err(err) => trace!("{}: bad system message: {err:?}", conn.id),
                }
            } else if conn.state != ConnectionState::Disconnected {
                conn.inbox.push((channel, msg));
            }
        }
    }

    fn on_system(&mut self, conn: &mut Connection, now: Instant, msg: SystemMessage) {
        let id = conn.id;
        match msg {
            SystemMessage::ConnectRequest { version, payload } => {
                self.on_connect_request(conn, now, version, &payload);
            }
            SystemMessage::ConnectAck { payload } => {
                if conn.role != Role::Initiator || conn.state != ConnectionState::Connecting {
                    return;
                }
                if self.handshake.on_receive_ack(id, &payload) {
                    debug!("{id}: connected to {}", conn.addr);
                    conn.set_state(ConnectionState::Connected);
                    self.events.push(CarrierEvent::ConnectionEstablished { id });
                } else {
                    self.close(
                        conn,
                        now,
                        DisconnectReason::HandshakeRejected,
                        Notify::FailedToConnect,
                    );
                }
            }
            SystemMessage::Disconnect { reason } => {
                let reason = reason.remote();
                debug!("{id}: peer disconnected: {reason}");
                self.delete(conn, reason);
                // acknowledge the notice before forgetting the connection
                conn.closed = true;
            }
            SystemMessage::ClockSync { host_time } => {
                if self.clock_sync.is_some_and(|sync| !sync.is_host) {
                    self.handle
                        .lock()
                        .clock
                        .sync(now, host_time, conn.traffic.rtt().get());
                }
            }
        }
    }

    fn on_connect_request(
        &mut self,
        conn: &mut Connection,
        now: Instant,
        version: u32,
        payload: &[u8],
    ) {
        let id = conn.id;
        match (conn.role, conn.state) {
            (Role::Acceptor, ConnectionState::Connecting) => {
                if version != self.config.protocol_version {
                    debug!(
                        "{id}: rejecting version {version}, expected {}",
                        self.config.protocol_version
                    );
                    self.close(conn, now, DisconnectReason::VersionMismatch, Notify::Silent);
                    return;
                }
                let mut reply = BytesMut::new();
                match self.handshake.on_receive_request(id, payload, &mut reply) {
                    HandshakeResult::Accept => {
                        debug!("{id}: accepted connection from {}", conn.addr);
                        conn.handshake_payload = reply.freeze();
                        conn.send_system(
                            &SystemMessage::ConnectAck {
                                payload: conn.handshake_payload.clone(),
                            },
                            Reliability::Unreliable,
                        );
                        conn.set_state(ConnectionState::Connected);
                        conn.visible = true;
                        self.events.push(CarrierEvent::IncomingConnection { id });
                    }
                    HandshakeResult::Pending => trace!("{id}: handshake pending"),
                    HandshakeResult::Reject(reason) => {
                        debug!("{id}: handshake rejected connection: {reason}");
                        self.close(conn, now, reason, Notify::Silent);
                    }
                }
            }
            (Role::Acceptor, ConnectionState::Connected) => {
                if self.handshake.on_confirm_request(id, payload) {
                    // our ack was probably lost
                    conn.send_system(
                        &SystemMessage::ConnectAck {
                            payload: conn.handshake_payload.clone(),
                        },
                        Reliability::Unreliable,
                    );
                } else {
                    self.close(
                        conn,
                        now,
                        DisconnectReason::WasAlreadyConnected,
                        Notify::Disconnect,
                    );
                }
            }
            _ => trace!("{id}: ignoring connect request"),
        }
    }

    fn tick(&mut self, conn: &mut Connection, now: Instant, host_time: Option<u32>) {
        if let Some(bytes_per_sec) = conn.traffic.update(now) {
            if conn.visible && conn.state != ConnectionState::Disconnected {
                self.events.push(CarrierEvent::RateChange {
                    id: conn.id,
                    bytes_per_sec,
                });
            }
        }
        let since = |at: Instant| now.saturating_duration_since(at);
        let CarrierConfig {
            protocol_version,
            connection_timeout,
            handshake_timeout,
            handshake_retry_interval,
            disconnect_linger,
            disconnect_detection_packet_loss_threshold: loss_threshold,
            disconnect_detection_rtt_threshold: rtt_threshold,
            ..
        } = self.config;

        match (conn.state, conn.role) {
            (ConnectionState::Connecting, Role::Initiator) => {
                if since(conn.created_at) >= handshake_timeout {
                    self.close(
                        conn,
                        now,
                        DisconnectReason::HandshakeTimeout,
                        Notify::FailedToConnect,
                    );
                } else if conn
                    .last_request_at
                    .is_none_or(|at| since(at) >= handshake_retry_interval)
                {
                    trace!("{}: sending connect request", conn.id);
                    conn.send_system(
                        &SystemMessage::ConnectRequest {
                            version: protocol_version,
                            payload: conn.handshake_payload.clone(),
                        },
                        Reliability::Unreliable,
                    );
                    conn.last_request_at = Some(now);
                }
            }
            (ConnectionState::Connecting, Role::Acceptor) => {
                if since(conn.created_at) >= handshake_timeout {
                    debug!("{}: handshake timed out", conn.id);
                    self.delete(conn, DisconnectReason::HandshakeTimeout);
                }
            }
            (ConnectionState::Connected, _) => {
                if let Some(host_time) = host_time {
                    conn.send_system(
                        &SystemMessage::ClockSync { host_time },
                        Reliability::Unreliable,
                    );
                }
                if self.disconnect_detection {
                    if since(conn.last_recv_at) >= connection_timeout {
                        self.close(conn, now, DisconnectReason::Timeout, Notify::Disconnect);
                    } else if conn.traffic.detects_disconnect(
                        loss_threshold,
                        rtt_threshold,
                    ) {
                        self.close(
                            conn,
                            now,
                            DisconnectReason::DisconnectDetected,
                            Notify::Disconnect,
                        );
                    }
                }
            }
            (ConnectionState::Disconnecting, _) => {
                let lingered = conn
                    .disconnecting_since
                    .is_none_or(|at| since(at) >= disconnect_linger);
                if conn.sender.is_idle() || lingered {
                    conn.set_state(ConnectionState::Disconnected);
                }
            }
            (ConnectionState::Disconnected, _) => {}
        }
    }
}
