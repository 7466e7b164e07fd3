#![allow(dead_code, reason = "not every test uses every helper")]

use {
    carrier::{
        Carrier, CarrierBuilder, CarrierConfig, CarrierEvent, ConnectionId, ConnectionState,
        carrier_io::{
            MemoryNetwork,
            sim::{LinkSimulator, Simulator},
        },
    },
    core::time::Duration,
    std::sync::{Arc, Mutex},
    web_time::Instant,
};

pub const SERVER_PORT: u16 = 1000;
pub const CLIENT_PORT: u16 = 2000;
pub const STEP: Duration = Duration::from_millis(10);

/// Carrier under test, with every event it raises.
pub struct Peer {
    pub carrier: Carrier,
    pub events: flume::Receiver<CarrierEvent>,
}

impl Peer {
    pub fn new(builder: CarrierBuilder, now: Instant) -> Self {
        let (send_events, events) = flume::unbounded();
        let carrier = builder.listener(send_events).build_at(now).unwrap();
        Self { carrier, events }
    }

    pub fn drain_events(&self) -> Vec<CarrierEvent> {
        self.events.drain().collect()
    }
}

pub fn config() -> CarrierConfig {
    CarrierConfig::default()
}

pub fn builder(network: &MemoryNetwork, port: u16, config: CarrierConfig) -> CarrierBuilder {
    Carrier::builder(config).driver(network.bind_port(port).unwrap())
}

pub fn shared_sim(seed: u64) -> Arc<Mutex<LinkSimulator>> {
    Arc::new(Mutex::new(LinkSimulator::new(seed)))
}

/// Client and server carriers on one in-memory network, driven by a fake
/// clock.
pub struct Pair {
    pub network: MemoryNetwork,
    pub client: Peer,
    pub server: Peer,
    pub now: Instant,
}

impl Pair {
    pub fn new() -> Self {
        Self::with(|builder| builder, |builder| builder)
    }

    pub fn with_configs(client: CarrierConfig, server: CarrierConfig) -> Self {
        Self::build(
            |network| builder(network, CLIENT_PORT, client),
            |network| builder(network, SERVER_PORT, server),
        )
    }

    pub fn with(
        client: impl FnOnce(CarrierBuilder) -> CarrierBuilder,
        server: impl FnOnce(CarrierBuilder) -> CarrierBuilder,
    ) -> Self {
        Self::build(
            |network| client(builder(network, CLIENT_PORT, config())),
            |network| server(builder(network, SERVER_PORT, config())),
        )
    }

    pub fn build(
        client: impl FnOnce(&MemoryNetwork) -> CarrierBuilder,
        server: impl FnOnce(&MemoryNetwork) -> CarrierBuilder,
    ) -> Self {
        let network = MemoryNetwork::new();
        let now = Instant::now();
        let server = Peer::new(server(&network), now);
        let client = Peer::new(client(&network), now);
        Self {
            network,
            client,
            server,
            now,
        }
    }

    pub fn step(&mut self) {
        self.now += STEP;
        self.client.carrier.update_at(self.now);
        self.server.carrier.update_at(self.now);
    }

    pub fn run(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.step();
        }
    }

    /// Steps until `done` holds, or `timeout` of fake time passes.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let until = self.now + timeout;
        while self.now < until {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    /// Connects the client to the server, returning the ID of the connection
    /// on each side.
    pub fn connect(&mut self) -> (ConnectionId, ConnectionId) {
        let server_addr = self.server.carrier.local_addr();
        let client_id = self.client.carrier.connect_addr(server_addr);
        assert!(client_id.is_specific());
        let connected = self.run_until(Duration::from_secs(5), |pair| {
            pair.client.carrier.query_statistics(client_id).state == ConnectionState::Connected
                && pair.server.carrier.num_connections() == 1
        });
        assert!(connected, "client should connect to server");
        let server_id = self.server.carrier.debug_connection_ids()[0];
        (client_id, server_id)
    }
}

/// Wraps a shared simulator so that a test keeps control of it.
pub fn sim_handle(sim: &Arc<Mutex<LinkSimulator>>) -> impl Simulator + 'static {
    sim.clone()
}
