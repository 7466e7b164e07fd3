#![expect(missing_docs, reason = "testing")]

mod common;

use {
    carrier::{
        Carrier, CarrierEvent, ConnectionId, ConnectionState, DisconnectReason, Handshake,
        HandshakeResult,
        carrier_io::{Datagram, Driver, DriverError, MemoryDriver},
        octs::BytesMut,
    },
    common::{CLIENT_PORT, Pair, Peer, SERVER_PORT, builder, config},
    core::{net::SocketAddr, time::Duration},
    std::{
        io,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

fn has_event(events: &[CarrierEvent], f: impl Fn(&CarrierEvent) -> bool) -> bool {
    events.iter().any(f)
}

#[test]
fn connect() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();

    let client_events = pair.client.drain_events();
    assert!(has_event(&client_events, |event| matches!(
        event,
        CarrierEvent::ConnectionEstablished { id } if *id == client_id
    )));
    let server_events = pair.server.drain_events();
    assert!(has_event(&server_events, |event| matches!(
        event,
        CarrierEvent::IncomingConnection { id } if *id == server_id
    )));

    assert_eq!(
        Some(pair.server.carrier.local_addr()),
        pair.client.carrier.connection_address(client_id)
    );
    assert_eq!(
        Some(pair.client.carrier.local_addr()),
        pair.server.carrier.connection_address(server_id)
    );
    assert_eq!(vec![client_id], pair.client.carrier.debug_connection_ids());
}

#[test]
fn connect_to_same_address_twice() {
    let pair = Pair::new();
    let addr = pair.server.carrier.local_addr();
    let first = pair.client.carrier.connect_addr(addr);
    let second = pair.client.carrier.connect_addr(addr);
    assert!(first.is_specific());
    assert_eq!(first, second);
    assert_eq!(1, pair.client.carrier.num_connections());
}

#[test]
fn connect_over_limit() {
    let network = carrier::carrier_io::MemoryNetwork::new();
    let now = web_time::Instant::now();
    let client = Peer::new(
        builder(&network, CLIENT_PORT, config().with_max_connections(1)),
        now,
    );
    let a = client.carrier.connect_addr("127.0.0.1:5000".parse().unwrap());
    let b = client.carrier.connect_addr("127.0.0.1:5001".parse().unwrap());
    assert!(a.is_specific());
    assert_eq!(ConnectionId::INVALID, b);
}

#[test]
fn disconnect_reaches_peer() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();
    pair.client.drain_events();
    pair.server.drain_events();

    pair.client.carrier.disconnect(client_id);
    assert_eq!(
        ConnectionState::Disconnecting,
        pair.client.carrier.query_statistics(client_id).state
    );
    assert!(!pair.client.carrier.send(client_id, "late", Default::default()));

    let closed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0 && pair.server.carrier.num_connections() == 0
    });
    assert!(closed);

    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::UserRequested } if *id == client_id
    )));
    assert!(has_event(&pair.server.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::RemoteRequested } if *id == server_id
    )));
    assert_eq!(
        ConnectionState::Disconnected,
        pair.client.carrier.query_statistics(client_id).state
    );
}

#[test]
fn disconnect_all() {
    let mut pair = Pair::new();
    let (client_id, _) = pair.connect();
    pair.server.carrier.disconnect(ConnectionId::ALL);
    let closed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0 && pair.server.carrier.num_connections() == 0
    });
    assert!(closed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::RemoteRequested } if *id == client_id
    )));
}

#[test]
fn shutdown_notifies_peer() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();

    pair.client.carrier.shutdown_at(pair.now);
    assert_eq!(0, pair.client.carrier.num_connections());
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::ShuttingDown } if *id == client_id
    )));

    pair.run(Duration::from_millis(100));
    assert_eq!(0, pair.server.carrier.num_connections());
    assert!(has_event(&pair.server.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::ShuttingDown } if *id == server_id
    )));
}

#[test]
fn version_mismatch() {
    let mut pair = Pair::with_configs(config().with_protocol_version(2), config());
    let client_id = pair
        .client
        .carrier
        .connect_addr(pair.server.carrier.local_addr());

    let failed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0
    });
    assert!(failed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::FailedToConnect { id, reason: DisconnectReason::VersionMismatch } if *id == client_id
    )));
    assert_eq!(0, pair.server.carrier.num_connections());
    assert!(pair.server.drain_events().is_empty());
}

#[test]
fn handshake_timeout() {
    let mut pair = Pair::with_configs(
        config().with_handshake_timeout(Duration::from_millis(500)),
        config(),
    );
    // nothing is bound here
    let client_id = pair
        .client
        .carrier
        .connect_addr("127.0.0.1:9999".parse().unwrap());
    assert!(client_id.is_specific());

    pair.run(Duration::from_millis(400));
    assert_eq!(
        ConnectionState::Connecting,
        pair.client.carrier.query_statistics(client_id).state
    );

    let failed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0
    });
    assert!(failed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::FailedToConnect { id, reason: DisconnectReason::HandshakeTimeout } if *id == client_id
    )));
}

#[test]
fn server_full() {
    let network = carrier::carrier_io::MemoryNetwork::new();
    let mut now = web_time::Instant::now();
    let server = Peer::new(
        builder(&network, SERVER_PORT, config().with_max_connections(1)),
        now,
    );
    let first = Peer::new(builder(&network, CLIENT_PORT, config()), now);
    let second = Peer::new(
        builder(
            &network,
            CLIENT_PORT + 1,
            config().with_handshake_timeout(Duration::from_secs(1)),
        ),
        now,
    );
    let mut peers = [server, first, second];

    let server_addr = peers[0].carrier.local_addr();
    let first_id = peers[1].carrier.connect_addr(server_addr);
    for _ in 0..10 {
        now += common::STEP;
        for peer in &mut peers {
            peer.carrier.update_at(now);
        }
    }
    let second_id = peers[2].carrier.connect_addr(server_addr);
    for _ in 0..200 {
        now += common::STEP;
        for peer in &mut peers {
            peer.carrier.update_at(now);
        }
    }

    let [server, first, second] = peers;
    assert_eq!(1, server.carrier.num_connections());
    assert_eq!(
        ConnectionState::Connected,
        first.carrier.query_statistics(first_id).state
    );
    assert!(has_event(&second.drain_events(), |event| matches!(
        event,
        CarrierEvent::FailedToConnect { id, reason: DisconnectReason::HandshakeTimeout } if *id == second_id
    )));
}

/// Delivers every datagram, but once armed, reports a failed earlier send to
/// `blame` while sending to `trigger`.
struct BlamingDriver {
    inner: MemoryDriver,
    armed: Arc<Mutex<Option<(SocketAddr, SocketAddr)>>>,
}

impl Driver for BlamingDriver {
    fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        self.inner.local_addr()
    }

    fn max_datagram_size(&self) -> usize {
        self.inner.max_datagram_size()
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), DriverError> {
        self.inner.send(addr, payload)?;
        let mut armed = self.armed.lock().unwrap();
        match *armed {
            Some((trigger, blame)) if trigger == addr => {
                *armed = None;
                Err(DriverError::Send {
                    addr: blame,
                    source: Arc::new(io::Error::other("queued datagram failed")),
                })
            }
            _ => Ok(()),
        }
    }

    fn recv(&mut self) -> Result<Option<Datagram>, DriverError> {
        self.inner.recv()
    }
}

#[test]
fn send_error_fails_only_the_blamed_peer() {
    let network = carrier::carrier_io::MemoryNetwork::new();
    let mut now = web_time::Instant::now();
    let armed = Arc::new(Mutex::new(None));
    let server = Peer::new(
        Carrier::builder(config()).driver(BlamingDriver {
            inner: network.bind_port(SERVER_PORT).unwrap(),
            armed: armed.clone(),
        }),
        now,
    );
    let first = Peer::new(builder(&network, CLIENT_PORT, config()), now);
    let second = Peer::new(builder(&network, CLIENT_PORT + 1, config()), now);
    let mut peers = [server, first, second];
    let mut step = |peers: &mut [Peer; 3], n: usize| {
        for _ in 0..n {
            now += common::STEP;
            for peer in peers.iter_mut() {
                peer.carrier.update_at(now);
            }
        }
    };

    let server_addr = peers[0].carrier.local_addr();
    assert!(peers[1].carrier.connect_addr(server_addr).is_specific());
    let second_id = peers[2].carrier.connect_addr(server_addr);
    step(&mut peers, 10);
    assert_eq!(2, peers[0].carrier.num_connections());
    peers[0].drain_events();

    let first_addr = peers[1].carrier.local_addr();
    let second_addr = peers[2].carrier.local_addr();
    let server_id_of = |addr| {
        peers[0]
            .carrier
            .debug_connection_ids()
            .into_iter()
            .find(|id| peers[0].carrier.connection_address(*id) == Some(addr))
            .unwrap()
    };
    let (server_first, server_second) = (server_id_of(first_addr), server_id_of(second_addr));

    *armed.lock().unwrap() = Some((second_addr, first_addr));
    assert!(peers[0].carrier.send(server_second, "still here", Default::default()));
    step(&mut peers, 5);

    assert!(armed.lock().unwrap().is_none());
    let events = peers[0].drain_events();
    assert!(has_event(&events, |event| matches!(
        event,
        CarrierEvent::DriverError { id, .. } if *id == server_first
    )));
    assert!(!has_event(&events, |event| matches!(
        event,
        CarrierEvent::DriverError { id, .. } if *id == server_second
    )));
    assert_eq!(vec![server_second], peers[0].carrier.debug_connection_ids());
    assert_eq!(
        ConnectionState::Connected,
        peers[2].carrier.query_statistics(second_id).state
    );
    assert_eq!(
        Some(carrier::octs::Bytes::from_static(b"still here")),
        peers[2]
            .carrier
            .receive_bytes(second_id, carrier::ChannelIndex::DEFAULT)
    );
}

/// Defers every request until it has seen a few, then accepts.
struct SlowHandshake {
    requests: Arc<AtomicUsize>,
    defer: usize,
}

impl Handshake for SlowHandshake {
    fn on_initiate(&mut self, _: ConnectionId, _: &mut BytesMut) {}

    fn on_receive_request(
        &mut self,
        _: ConnectionId,
        _: &[u8],
        _: &mut BytesMut,
    ) -> HandshakeResult {
        let seen = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.defer {
            HandshakeResult::Accept
        } else {
            HandshakeResult::Pending
        }
    }

    fn on_receive_ack(&mut self, _: ConnectionId, _: &[u8]) -> bool {
        true
    }
}

#[test]
fn pending_handshake_sees_every_retry() {
    let requests = Arc::new(AtomicUsize::new(0));
    let mut pair = Pair::with(
        |builder| {
            builder.handshake(SlowHandshake {
                requests: Arc::new(AtomicUsize::new(0)),
                defer: 0,
            })
        },
        |builder| {
            builder.handshake(SlowHandshake {
                requests: requests.clone(),
                defer: 3,
            })
        },
    );
    let client_id = pair
        .client
        .carrier
        .connect_addr(pair.server.carrier.local_addr());

    pair.run(Duration::from_millis(150));
    assert_eq!(0, pair.server.carrier.num_connections());
    assert_eq!(
        ConnectionState::Connecting,
        pair.client.carrier.query_statistics(client_id).state
    );

    let connected = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.query_statistics(client_id).state == ConnectionState::Connected
    });
    assert!(connected);
    assert_eq!(1, pair.server.carrier.num_connections());
    assert!(requests.load(Ordering::SeqCst) > 2);
}

#[test]
fn rate_changes_reported_while_connecting() {
    let mut pair = Pair::with(
        |builder| builder,
        |builder| {
            builder.handshake(SlowHandshake {
                requests: Arc::new(AtomicUsize::new(0)),
                defer: 8,
            })
        },
    );
    let client_id = pair
        .client
        .carrier
        .connect_addr(pair.server.carrier.local_addr());
    pair.run(Duration::from_millis(700));

    let stats = pair.client.carrier.query_statistics(client_id);
    assert_eq!(ConnectionState::Connecting, stats.state);
    let rates = pair
        .client
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CarrierEvent::RateChange { id, bytes_per_sec } if id == client_id => {
                Some(bytes_per_sec)
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(Some(&stats.flow.send_rate), rates.last());
}

/// Refuses every connection.
struct Picky;

impl Handshake for Picky {
    fn on_initiate(&mut self, _: ConnectionId, _: &mut BytesMut) {}

    fn on_receive_request(
        &mut self,
        _: ConnectionId,
        _: &[u8],
        _: &mut BytesMut,
    ) -> HandshakeResult {
        HandshakeResult::Reject(DisconnectReason::HandshakeRejected)
    }

    fn on_receive_ack(&mut self, _: ConnectionId, _: &[u8]) -> bool {
        false
    }
}

#[test]
fn server_rejects_request() {
    let mut pair = Pair::with(|builder| builder, |builder| builder.handshake(Picky));
    let client_id = pair
        .client
        .carrier
        .connect_addr(pair.server.carrier.local_addr());
    let failed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0
    });
    assert!(failed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::FailedToConnect { id, reason: DisconnectReason::HandshakeRejected } if *id == client_id
    )));
    assert!(pair.server.drain_events().is_empty());
}

#[test]
fn client_rejects_ack() {
    let mut pair = Pair::with(
        |builder| builder.handshake(Picky),
        |builder| {
            builder.handshake(SlowHandshake {
                requests: Arc::new(AtomicUsize::new(0)),
                defer: 0,
            })
        },
    );
    let client_id = pair
        .client
        .carrier
        .connect_addr(pair.server.carrier.local_addr());
    let closed = pair.run_until(Duration::from_secs(2), |pair| {
        pair.client.carrier.num_connections() == 0 && pair.server.carrier.num_connections() == 0
    });
    assert!(closed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::FailedToConnect { id, reason: DisconnectReason::HandshakeRejected } if *id == client_id
    )));
    assert!(has_event(&pair.server.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect {
            reason: DisconnectReason::HandshakeRejected,
            ..
        }
    )));
}

#[test]
fn debug_delete_times_out_peer() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();
    pair.client.drain_events();

    pair.server.carrier.debug_delete_connection(server_id);
    pair.step();
    assert_eq!(0, pair.server.carrier.num_connections());
    assert!(has_event(&pair.server.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect { id, reason: DisconnectReason::DebugDeleted } if *id == server_id
    )));

    let closed = pair.run_until(Duration::from_secs(8), |pair| {
        pair.client.carrier.num_connections() == 0
    });
    assert!(closed);
    assert!(has_event(&pair.client.drain_events(), |event| matches!(
        event,
        CarrierEvent::Disconnect {
            id,
            reason: DisconnectReason::Timeout | DisconnectReason::DisconnectDetected,
        } if *id == client_id
    )));
    // the server never saw a new connect request
    assert_eq!(0, pair.server.carrier.num_connections());
}

#[test]
fn timeout_without_detection_is_silent() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();

    pair.client.carrier.debug_enable_disconnect_detection(false);
    pair.server.carrier.debug_delete_connection(server_id);
    pair.run(Duration::from_secs(7));
    assert_eq!(
        ConnectionState::Connected,
        pair.client.carrier.query_statistics(client_id).state
    );
}
