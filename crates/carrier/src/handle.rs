//! Thread-safe access to a [`Carrier`](crate::Carrier).

use {
    crate::{
        callback::Callback,
        channel::{ChannelIndex, MAX_CHANNELS, SendOptions},
        clock::Clock,
        connection::{ConnectionId, ConnectionState},
        stats::ConnectionStatistics,
    },
    ahash::AHashMap,
    carrier_io::AddressFamily,
    core::{net::SocketAddr, time::Duration},
    log::{debug, trace},
    octs::Bytes,
    std::{
        collections::VecDeque,
        net::ToSocketAddrs,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
    web_time::Instant,
};

const NUM_USER_CHANNELS: usize = MAX_CHANNELS - 1;

/// Outcome of [`CarrierHandle::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    /// What happened.
    pub state: ReceiveState,
    /// Length of the message that was received, or that did not fit.
    pub num_bytes: usize,
}

/// See [`ReceiveResult::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// The next message was copied into the buffer and removed from the
    /// queue.
    Received,
    /// Nothing is waiting on this channel.
    NoMessageToReceive,
    /// The buffer is too small for the next message, which stays queued.
    UnsufficientBufferSize,
}

impl ReceiveResult {
    const NOTHING: Self = Self {
        state: ReceiveState::NoMessageToReceive,
        num_bytes: 0,
    };
}

pub(crate) enum Command {
    Connect {
        id: ConnectionId,
        addr: SocketAddr,
    },
    Send {
        id: ConnectionId,
        payload: Bytes,
        options: SendOptions,
        callback: Option<Callback>,
    },
    Disconnect {
        id: ConnectionId,
    },
    DebugDelete {
        id: ConnectionId,
    },
    SetDisconnectDetection(bool),
    StartClockSync {
        interval: Duration,
        is_host: bool,
    },
    StopClockSync,
}

/// Snapshot of every connection, written by the carrier during its update.
pub(crate) struct Registry {
    next_id: u32,
    max_connections: usize,
    address_family: AddressFamily,
    pub entries: AHashMap<ConnectionId, Entry>,
    pub by_addr: AHashMap<SocketAddr, ConnectionId>,
    pub clock: Clock,
}

pub(crate) struct Entry {
    pub addr: SocketAddr,
    pub visible: bool,
    pub stats: ConnectionStatistics,
    pub received: [VecDeque<Bytes>; NUM_USER_CHANNELS],
}

impl Registry {
    pub fn new(max_connections: usize, address_family: AddressFamily, clock: Clock) -> Self {
        Self {
            next_id: 1,
            max_connections,
            address_family,
            entries: AHashMap::new(),
            by_addr: AHashMap::new(),
            clock,
        }
    }

    /// Reserves an ID for a new connection to `addr`.
    ///
    /// Returns `None` if no more connections are allowed.
    pub fn allocate(&mut self, addr: SocketAddr, visible: bool) -> Option<ConnectionId> {
        if self.entries.len() >= self.max_connections {
            return None;
        }
        let id = ConnectionId::from_raw(self.next_id);
        if !id.is_specific() {
            return None;
        }
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                addr,
                visible,
                stats: ConnectionStatistics {
                    state: ConnectionState::Connecting,
                    ..Default::default()
                },
                received: Default::default(),
            },
        );
        self.by_addr.insert(addr, id);
        Some(id)
    }

    pub fn remove(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.remove(&id) {
            if self.by_addr.get(&entry.addr) == Some(&id) {
                self.by_addr.remove(&entry.addr);
            }
        }
    }

    fn visible(&self, id: ConnectionId) -> Option<&Entry> {
        self.entries.get(&id).filter(|entry| entry.visible)
    }

    fn connected_mut(&mut self, id: ConnectionId) -> Option<&mut Entry> {
        self.entries
            .get_mut(&id)
            .filter(|entry| entry.visible && entry.stats.state == ConnectionState::Connected)
    }
}

/// Cloneable, thread-safe handle to a [`Carrier`](crate::Carrier).
///
/// Operations which change connections are queued and carried out by the
/// next [`Carrier::update`](crate::Carrier::update). Queries and receiving
/// read the state published by the most recent update.
#[derive(Clone)]
pub struct CarrierHandle {
    registry: Arc<Mutex<Registry>>,
    commands: flume::Sender<Command>,
    wake: flume::Sender<()>,
    instant_response: bool,
}

impl CarrierHandle {
    pub(crate) fn new(
        registry: Arc<Mutex<Registry>>,
        commands: flume::Sender<Command>,
        wake: flume::Sender<()>,
        instant_response: bool,
    ) -> Self {
        Self {
            registry,
            commands,
            wake,
            instant_response,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, command: Command) {
        // the carrier owns the receiver for as long as any handle could matter
        let _ = self.commands.send(command);
        if self.instant_response {
            self.wake();
        }
    }

    /// Cuts short the wait of a [`CarrierThread`](crate::CarrierThread).
    pub(crate) fn wake(&self) {
        let _ = self.wake.try_send(());
    }

    /// Starts connecting to `host:port`.
    ///
    /// The host is resolved synchronously. See
    /// [`CarrierHandle::connect_addr`] for what the returned ID means.
    pub fn connect(&self, host: &str, port: u16) -> ConnectionId {
        let family = self.lock().address_family;
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(err) => {
                debug!("failed to resolve {host}:{port}: {err}");
                return ConnectionId::INVALID;
            }
        };
        let addr = addrs
            .iter()
            .find(|addr| family.matches(addr))
            .or_else(|| addrs.first());
        match addr {
            Some(addr) => self.connect_addr(*addr),
            None => {
                debug!("{host}:{port} resolved to no addresses");
                ConnectionId::INVALID
            }
        }
    }

    /// Starts connecting to `addr`.
    ///
    /// Returns [`ConnectionId::INVALID`] if no more connections are allowed.
    /// If a connection to `addr` already exists, its ID is returned instead.
    /// Otherwise, the outcome is reported by a
    /// [`CarrierListener`](crate::CarrierListener) event.
    pub fn connect_addr(&self, addr: SocketAddr) -> ConnectionId {
        let mut registry = self.lock();
        if let Some(id) = registry.by_addr.get(&addr) {
            return *id;
        }
        let Some(id) = registry.allocate(addr, true) else {
            debug!("refusing to connect to {addr}: too many connections");
            return ConnectionId::INVALID;
        };
        drop(registry);

        self.push(Command::Connect { id, addr });
        id
    }

    /// Closes a connection, or every connection with [`ConnectionId::ALL`].
    pub fn disconnect(&self, id: ConnectionId) {
        {
            let mut registry = self.lock();
            for entry in registry.entries.iter_mut().filter_map(|(entry_id, entry)| {
                (id == ConnectionId::ALL || id == *entry_id).then_some(entry)
            }) {
                if matches!(
                    entry.stats.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) && entry.visible
                {
                    entry.stats.state = ConnectionState::Disconnecting;
                }
            }
        }
        self.push(Command::Disconnect { id });
    }

    /// Queues a message for sending.
    ///
    /// Returns `false` if the connection is not connected, or the channel is
    /// not available to applications. With [`ConnectionId::ALL`] the message
    /// goes to every connected connection, and `false` means there were none.
    pub fn send(&self, id: ConnectionId, data: impl Into<Bytes>, options: SendOptions) -> bool {
        self.send_inner(id, data.into(), options, None)
    }

    /// Queues a message for sending, running `callback` during the
    /// [`Carrier::update`](crate::Carrier::update) in which it was
    /// acknowledged (reliable) or transmitted (unreliable).
    ///
    /// Callbacks of messages on the same connection and channel run in the
    /// order those messages were queued. Broadcasting with a callback is not
    /// supported and returns `false`.
    pub fn send_with_callback(
        &self,
        id: ConnectionId,
        data: impl Into<Bytes>,
        options: SendOptions,
        callback: impl FnOnce() + Send + 'static,
    ) -> bool {
        if id == ConnectionId::ALL {
            return false;
        }
        self.send_inner(id, data.into(), options, Some(Box::new(callback)))
    }

    fn send_inner(
        &self,
        id: ConnectionId,
        payload: Bytes,
        options: SendOptions,
        callback: Option<Callback>,
    ) -> bool {
        if !options.channel.is_user() {
            Self::reject_channel(id, options.channel);
            return false;
        }

        let mut registry = self.lock();
        if id == ConnectionId::ALL {
            let ids = registry
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.visible && entry.stats.state == ConnectionState::Connected
                })
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            drop(registry);
            for id in &ids {
                self.push(Command::Send {
                    id: *id,
                    payload: payload.clone(),
                    options,
                    callback: None,
                });
            }
            return !ids.is_empty();
        }

        if registry.connected_mut(id).is_none() {
            trace!("not sending to {id}: not connected");
            return false;
        }
        drop(registry);
        self.push(Command::Send {
            id,
            payload,
            options,
            callback,
        });
        true
    }

    fn reject_channel(id: ConnectionId, channel: ChannelIndex) {
        debug!("{id}: channel {channel} is not available to the application");
    }

    /// Copies the next message received on `channel` into `buf`.
    ///
    /// If `buf` is too short, the message stays queued and
    /// [`ReceiveResult::num_bytes`] holds its length.
    pub fn receive(&self, buf: &mut [u8], id: ConnectionId, channel: ChannelIndex) -> ReceiveResult {
        if !channel.is_user() {
            Self::reject_channel(id, channel);
            return ReceiveResult::NOTHING;
        }
        let mut registry = self.lock();
        let Some(entry) = registry.connected_mut(id) else {
            return ReceiveResult::NOTHING;
        };
        let queue = &mut entry.received[channel.as_usize()];
        let Some(msg) = queue.front() else {
            return ReceiveResult::NOTHING;
        };
        let num_bytes = msg.len();
        if buf.len() < num_bytes {
            return ReceiveResult {
                state: ReceiveState::UnsufficientBufferSize,
                num_bytes,
            };
        }
        buf[..num_bytes].copy_from_slice(msg);
        queue.pop_front();
        ReceiveResult {
            state: ReceiveState::Received,
            num_bytes,
        }
    }

    /// Takes the next message received on `channel`.
    pub fn receive_bytes(&self, id: ConnectionId, channel: ChannelIndex) -> Option<Bytes> {
        if !channel.is_user() {
            Self::reject_channel(id, channel);
            return None;
        }
        self.lock()
            .connected_mut(id)
            .and_then(|entry| entry.received[channel.as_usize()].pop_front())
    }

    /// Gets the length of the next message received on `channel`, or 0 if
    /// there is none.
    pub fn query_next_receive_message_max_size(
        &self,
        id: ConnectionId,
        channel: ChannelIndex,
    ) -> usize {
        if !channel.is_user() {
            return 0;
        }
        self.lock()
            .connected_mut(id)
            .and_then(|entry| entry.received[channel.as_usize()].front().map(Bytes::len))
            .unwrap_or(0)
    }

    /// Gets the state and traffic statistics of a connection.
    ///
    /// Unknown connections report [`ConnectionState::Disconnected`] and zeroed
    /// statistics.
    pub fn query_statistics(&self, id: ConnectionId) -> ConnectionStatistics {
        self.lock()
            .visible(id)
            .map(|entry| entry.stats)
            .unwrap_or_default()
    }

    /// Gets the number of connections known to the application.
    pub fn num_connections(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.visible)
            .count()
    }

    /// Gets the ID of every connection known to the application, in ascending
    /// order.
    pub fn debug_connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.visible)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Gets the remote address of a connection.
    pub fn connection_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.lock().visible(id).map(|entry| entry.addr)
    }

    /// Deletes a connection without notifying the peer.
    pub fn debug_delete_connection(&self, id: ConnectionId) {
        self.push(Command::DebugDelete { id });
    }

    /// Turns connection timeouts and quality-based disconnects on or off.
    pub fn debug_enable_disconnect_detection(&self, enabled: bool) {
        self.push(Command::SetDisconnectDetection(enabled));
    }

    /// Starts synchronizing clocks with connected peers.
    ///
    /// A host sends its clock to every connection each `interval`; others
    /// follow the clock of the host they receive from.
    pub fn start_clock_sync(&self, interval: Duration, is_host: bool) {
        self.push(Command::StartClockSync { interval, is_host });
    }

    /// Stops synchronizing clocks, going back to the local clock.
    pub fn stop_clock_sync(&self) {
        self.push(Command::StopClockSync);
    }

    /// Gets the current time in milliseconds.
    ///
    /// This is the synchronized clock while clock sync is running, and time
    /// since the carrier was created otherwise.
    pub fn time(&self) -> u32 {
        self.time_at(Instant::now())
    }

    /// Gets the time in milliseconds at `now`.
    pub fn time_at(&self, now: Instant) -> u32 {
        self.lock().clock.time_at(now)
    }
}
