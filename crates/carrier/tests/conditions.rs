#![expect(missing_docs, reason = "testing")]

mod common;

use {
    carrier::{
        ChannelIndex, CarrierEvent, ConnectionState, DisconnectReason, SendOptions,
        carrier_io::sim::LinkConditions,
    },
    common::{CLIENT_PORT, Pair, Peer, SERVER_PORT, STEP, builder, config, shared_sim, sim_handle},
    core::time::Duration,
};

#[test]
fn loss_lowers_send_rate() {
    let sim = shared_sim(3);
    let mut pair = Pair::build(
        |network| {
            builder(network, CLIENT_PORT, config().with_disconnect_detection(false))
                .simulator(sim_handle(&sim))
        },
        |network| builder(network, SERVER_PORT, config().with_disconnect_detection(false)),
    );
    let (client_id, _) = pair.connect();
    let initial_rate = pair.client.carrier.query_statistics(client_id).flow.send_rate;
    sim.lock().unwrap().set_outgoing(
        LinkConditions::default()
            .with_loss(2, 2)
            .with_latency(Duration::from_millis(30), Duration::from_millis(30)),
    );
    pair.client.drain_events();

    let mut lowest_rate = initial_rate;
    for _ in 0..500 {
        pair.client
            .carrier
            .send(client_id, vec![0_u8; 1000], SendOptions::default());
        pair.step();
        let rate = pair.client.carrier.query_statistics(client_id).flow.send_rate;
        assert!(rate >= 1000, "send rate {rate} fell below the minimum");
        lowest_rate = lowest_rate.min(rate);
    }

    assert!(lowest_rate < initial_rate / 2);
    let rate_changes = pair
        .client
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CarrierEvent::RateChange { bytes_per_sec, .. } => Some(bytes_per_sec),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(!rate_changes.is_empty());
    assert!(rate_changes.iter().all(|rate| *rate >= 1000));

    let stats = pair.client.carrier.query_statistics(client_id);
    assert!(stats.lifetime.packets_lost > 0);
    assert!(stats.lifetime.packet_loss > 0.2);

    sim.lock().unwrap().set_outgoing(LinkConditions::default());
    for _ in 0..300 {
        pair.client
            .carrier
            .send(client_id, vec![0_u8; 100], SendOptions::default());
        pair.step();
    }
    let recovered = pair
        .client
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CarrierEvent::RateChange { bytes_per_sec, .. } => Some(bytes_per_sec),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(
        recovered.iter().any(|rate| *rate > lowest_rate),
        "send rate never grew back from {lowest_rate}: {recovered:?}"
    );
    assert!(pair.client.carrier.query_statistics(client_id).flow.send_rate > lowest_rate);
}

#[test]
fn poor_link_is_detected() {
    let sim = shared_sim(5);
    let detecting = config()
        .with_disconnect_detection_packet_loss_threshold(0.4)
        .with_disconnect_detection_rtt_threshold(Duration::from_millis(50));
    let mut pair = Pair::build(
        |network| builder(network, CLIENT_PORT, detecting.clone()).simulator(sim_handle(&sim)),
        |network| builder(network, SERVER_PORT, detecting.clone()),
    );
    let (_, server_id) = pair.connect();
    sim.lock()
        .unwrap()
        .set_incoming(LinkConditions::default().with_loss(2, 2));

    let closed = pair.run_until(Duration::from_secs(10), |pair| {
        pair.client.carrier.num_connections() == 0 && pair.server.carrier.num_connections() == 0
    });
    assert!(closed);

    let detected = |events: Vec<CarrierEvent>| {
        events.iter().any(|event| {
            matches!(
                event,
                CarrierEvent::Disconnect {
                    reason: DisconnectReason::DisconnectDetected,
                    ..
                }
            )
        })
    };
    // at least one side sees the loss, and tells the other
    let client_detected = detected(pair.client.drain_events());
    let server_detected = detected(pair.server.drain_events());
    assert!(client_detected || server_detected);
    assert_eq!(
        ConnectionState::Disconnected,
        pair.server.carrier.query_statistics(server_id).state
    );
}

#[test]
fn good_link_is_not_detected() {
    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();
    pair.run(Duration::from_secs(10));
    assert_eq!(
        ConnectionState::Connected,
        pair.client.carrier.query_statistics(client_id).state
    );
    assert_eq!(
        ConnectionState::Connected,
        pair.server.carrier.query_statistics(server_id).state
    );
}

#[test]
fn latency_shows_in_rtt() {
    let sim = shared_sim(9);
    let mut pair = Pair::with(|builder| builder.simulator(sim_handle(&sim)), |builder| builder);
    sim.lock().unwrap().set_outgoing(
        LinkConditions::default()
            .with_latency(Duration::from_millis(40), Duration::from_millis(40)),
    );
    let (client_id, server_id) = pair.connect();
    pair.run(Duration::from_secs(3));

    let stats = pair.client.carrier.query_statistics(client_id);
    assert!(stats.last_second.rtt >= Duration::from_millis(40));
    assert!(stats.last_second.rtt < Duration::from_millis(100));
    assert!(stats.last_second.packets_sent > 0);
    assert!(stats.last_second.packets_received > 0);
    assert!(stats.lifetime.packets_sent >= stats.last_second.packets_sent);
    assert!(stats.last_second.packet_loss < f32::EPSILON);

    let server_stats = pair.server.carrier.query_statistics(server_id);
    assert!(server_stats.lifetime.bytes_received > 0);
}

#[test]
fn statistics_after_one_message_each_way() {
    const PAYLOAD: usize = 300;

    let mut pair = Pair::new();
    let (client_id, server_id) = pair.connect();
    assert!(
        pair.client
            .carrier
            .send(client_id, vec![1_u8; PAYLOAD], SendOptions::default())
    );
    assert!(
        pair.server
            .carrier
            .send(server_id, vec![2_u8; PAYLOAD], SendOptions::default())
    );
    let delivered = pair.run_until(Duration::from_secs(1), |pair| {
        let queued = |peer: &Peer, id| {
            peer.carrier
                .query_statistics(id)
                .flow
                .queued_receive_messages
        };
        queued(&pair.server, server_id) > 0 && queued(&pair.client, client_id) > 0
    });
    assert!(delivered);
    pair.run(Duration::from_millis(100));

    for (peer, id) in [(&pair.client, client_id), (&pair.server, server_id)] {
        let stats = peer.carrier.query_statistics(id);
        assert!(stats.lifetime.rtt > Duration::ZERO);
        assert!(stats.lifetime.packets_sent > 0);
        assert!(stats.lifetime.packets_received > 0);
        assert!(stats.lifetime.bytes_sent > PAYLOAD as u64);
        assert!(stats.lifetime.bytes_received > PAYLOAD as u64);
        assert!(stats.lifetime.packets_acked <= stats.lifetime.packets_sent);
        assert_eq!(0, stats.flow.queued_send_messages);
        assert!(peer.carrier.receive_bytes(id, ChannelIndex::DEFAULT).is_some());
    }
}

#[test]
fn clocks_follow_host() {
    let network = carrier::carrier_io::MemoryNetwork::new();
    let start = web_time::Instant::now();
    let mut server = Peer::new(builder(&network, SERVER_PORT, config()), start);
    let mut now = start + Duration::from_secs(10);
    let mut client = Peer::new(builder(&network, CLIENT_PORT, config()), now);
    assert!(server.carrier.time_at(now) >= 10_000);
    assert!(client.carrier.time_at(now) < 100);

    let client_id = client.carrier.connect_addr(server.carrier.local_addr());
    let mut step = |client: &mut Peer, server: &mut Peer, n: usize| {
        for _ in 0..n {
            now += STEP;
            client.carrier.update_at(now);
            server.carrier.update_at(now);
        }
        now
    };
    step(&mut client, &mut server, 10);
    assert_eq!(
        ConnectionState::Connected,
        client.carrier.query_statistics(client_id).state
    );

    server
        .carrier
        .start_clock_sync(Duration::from_millis(100), true);
    client
        .carrier
        .start_clock_sync(Duration::from_millis(100), false);
    let now = step(&mut client, &mut server, 50);

    let host_time = server.carrier.time_at(now);
    let follower_time = client.carrier.time_at(now);
    assert!(host_time.abs_diff(follower_time) <= 30);

    client.carrier.stop_clock_sync();
    let now = step(&mut client, &mut server, 1);
    assert!(client.carrier.time_at(now) < 1000);
}
