#![expect(missing_docs, reason = "testing")]

use {
    carrier::{
        Carrier, CarrierConfig, CarrierHandle, CarrierThread, ChannelIndex, ConnectionId,
        ConnectionState, SendOptions, carrier_io::MemoryNetwork,
    },
    core::time::Duration,
    std::thread,
    web_time::Instant,
};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn spawn(network: &MemoryNetwork, port: u16) -> CarrierThread {
    let config = CarrierConfig::default()
        .with_thread_update_time(Duration::from_millis(5))
        .with_thread_instant_response(true);
    let carrier = Carrier::builder(config)
        .driver(network.bind_port(port).unwrap())
        .build()
        .unwrap();
    CarrierThread::spawn(carrier)
}

fn connected(handle: &CarrierHandle, id: ConnectionId) -> bool {
    handle.query_statistics(id).state == ConnectionState::Connected
}

#[test]
fn exchange_messages_on_threads() {
    let network = MemoryNetwork::new();
    let server = spawn(&network, 1000);
    let client = spawn(&network, 2000);

    let client_id = client.handle().connect("127.0.0.1", 1000);
    assert!(client_id.is_specific());
    let timeout = Duration::from_secs(5);
    assert!(wait_until(timeout, || connected(client.handle(), client_id)));
    assert!(wait_until(timeout, || server.handle().num_connections() == 1));
    assert_eq!(
        Some("127.0.0.1:1000".parse().unwrap()),
        client.handle().connection_address(client_id)
    );
    let server_id = server.handle().debug_connection_ids()[0];

    // handles work from any thread
    let sender = client.handle().clone();
    thread::spawn(move || {
        assert!(sender.send(client_id, "from another thread", SendOptions::default()));
    })
    .join()
    .unwrap();

    let mut msg = None;
    assert!(wait_until(timeout, || {
        msg = server
            .handle()
            .receive_bytes(server_id, ChannelIndex::DEFAULT);
        msg.is_some()
    }));
    assert_eq!(&b"from another thread"[..], &msg.unwrap()[..]);

    let mut client = client.stop();
    let server = server.stop();
    assert_eq!(1, client.num_connections());
    assert_eq!(1, server.num_connections());

    client.shutdown();
    assert_eq!(0, client.num_connections());
}
