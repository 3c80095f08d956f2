//! Handshake and lifecycle scenarios over a lossless in-memory link.

use riptide::{Client, ClientEvent, ClientId, DisconnectReason, PeerConfig, Server, ServerEvent};
use riptide_channel::{ChannelNetwork, ChannelTransport};
use web_time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);

fn server_and_clients(count: usize) -> (Server<ChannelTransport>, Vec<Client<ChannelTransport>>) {
    let network = ChannelNetwork::new();
    let start = Instant::now();
    let server_transport = network.open();
    let server_addr = server_transport.addr();
    let server = Server::new(server_transport, PeerConfig::default(), start);
    let clients = (0..count)
        .map(|_| {
            let mut client = Client::new(network.open(), PeerConfig::default(), start);
            client.connect(server_addr);
            client
        })
        .collect();
    (server, clients)
}

#[test]
fn concurrent_handshakes_assign_sequential_ids() {
    let (mut server, mut clients) = server_and_clients(3);
    let start = Instant::now();

    let mut server_events = Vec::new();
    let mut client_events = vec![Vec::new(); 3];
    for k in 1..=20 {
        let now = start + TICK * k;
        server_events.extend(server.tick(now));
        for (client, events) in clients.iter_mut().zip(&mut client_events) {
            events.extend(client.tick(now));
        }
    }

    // ids are handed out in connection order, starting at 1
    for (i, client) in clients.iter().enumerate() {
        assert!(client.is_connected());
        assert_eq!(ClientId(u16::try_from(i).unwrap() + 1), client.id());
    }
    assert_eq!(3, server.client_count());
    let connected = server_events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::ClientConnected { client_id } => Some(*client_id),
            ServerEvent::ClientDisconnected { .. } => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(vec![ClientId(1), ClientId(2), ClientId(3)], connected);

    // already connected clients hear about each later arrival
    for id in [2, 3] {
        assert!(client_events[0].contains(&ClientEvent::PeerConnected {
            client_id: ClientId(id)
        }));
    }
    assert!(client_events[1].contains(&ClientEvent::PeerConnected {
        client_id: ClientId(3)
    }));
}

#[test]
fn graceful_disconnect_is_broadcast_within_one_tick() {
    let (mut server, mut clients) = server_and_clients(2);
    let start = Instant::now();

    for k in 1..=20 {
        let now = start + TICK * k;
        server.tick(now);
        for client in &mut clients {
            client.tick(now);
        }
    }
    let mut b = clients.pop().unwrap();
    let mut a = clients.pop().unwrap();
    assert!(a.is_connected() && b.is_connected());
    let a_id = a.id();

    // the disconnect notice leaves a immediately...
    a.disconnect();
    assert!(!a.is_connected());
    let now = start + TICK * 21;
    assert!(a.tick(now).contains(&ClientEvent::Disconnected {
        reason: DisconnectReason::Disconnected
    }));

    // ...the server observes it on its next tick and broadcasts...
    let server_events = server.tick(now);
    assert!(server_events.contains(&ServerEvent::ClientDisconnected {
        client_id: a_id,
        reason: DisconnectReason::Disconnected,
    }));
    assert_eq!(1, server.client_count());

    // ...and b hears about it one tick after the notice reached the server
    let b_events = b.tick(now);
    assert!(b_events.contains(&ClientEvent::PeerDisconnected { client_id: a_id }));
}

#[test]
fn server_side_kick_reaches_the_client() {
    let (mut server, mut clients) = server_and_clients(1);
    let start = Instant::now();
    for k in 1..=20 {
        let now = start + TICK * k;
        server.tick(now);
        clients[0].tick(now);
    }
    let id = clients[0].id();
    assert!(clients[0].is_connected());

    server.disconnect_client(id);
    assert_eq!(0, server.client_count());
    let events = clients[0].tick(start + TICK * 21);
    assert!(events.contains(&ClientEvent::Disconnected {
        reason: DisconnectReason::Disconnected
    }));
}

#[test]
fn connect_gives_up_after_max_attempts() {
    let network = ChannelNetwork::new();
    let start = Instant::now();
    // a server address which exists but never answers
    let silent = network.open();
    let config = PeerConfig::default();
    let mut client = Client::new(network.open(), config.clone(), start);
    client.connect(silent.addr());

    let mut events = Vec::new();
    let budget = config.heartbeat_interval * u32::from(config.max_connect_attempts)
        + config.heartbeat_interval;
    let mut k = 0;
    while TICK * k < budget {
        k += 1;
        events.extend(client.tick(start + TICK * k));
    }
    assert!(events.contains(&ClientEvent::ConnectFailed));
    assert!(!client.is_connected());
}
