//! Delivery scenarios over conditioned (lossy) links.

use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use riptide::{
    Client, PeerConfig, SendMode, Server,
    condition::{ConditionedTransport, ConditionerConfig},
};
use riptide_channel::{ChannelNetwork, ChannelTransport};
use web_time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);
const MSG_ECHO: u16 = 1;
const MSG_COUNT: u16 = 1000;

type Lossy = ConditionedTransport<ChannelTransport>;

/// Server and client over two independently conditioned legs, with the
/// handshake already completed (losslessly, so setup cannot flake).
fn connected_pair(start: Instant) -> (Server<Lossy>, Client<Lossy>) {
    let network = ChannelNetwork::new();
    let lossless = ConditionerConfig::default();
    let server_transport = ConditionedTransport::new(network.open(), &lossless, 42);
    let server_addr = server_transport.inner().addr();
    let client_transport = ConditionedTransport::new(network.open(), &lossless, 43);

    let mut server = Server::new(server_transport, PeerConfig::default(), start);
    let mut client = Client::new(client_transport, PeerConfig::default(), start);
    client.connect(server_addr);
    for k in 1..=10 {
        let now = start + TICK * k;
        server.tick(now);
        client.tick(now);
    }
    assert!(client.is_connected());
    (server, client)
}

/// A client fires 1000 numbered reliable messages at an echoing server with
/// 30 % loss on both legs; every echo must ultimately come back.
#[test]
fn reliable_echo_survives_heavy_loss() {
    let start = Instant::now();
    let (mut server, mut client) = connected_pair(start);
    let lossy = ConditionerConfig {
        loss_rate: 0.3,
        ..ConditionerConfig::default()
    };
    server.transport_mut().set_config(&lossy);
    client.transport_mut().set_config(&lossy);

    server.on_message(MSG_ECHO, |server, from, msg| {
        let n = msg.read::<u16>()?;
        let mut reply = server.message(SendMode::Reliable, MSG_ECHO);
        let _ = reply.write(&n);
        server.send(reply, from);
        Ok(())
    });
    let echoed = Rc::new(RefCell::new(BTreeSet::new()));
    client.on_message(MSG_ECHO, {
        let echoed = Rc::clone(&echoed);
        move |_, msg| {
            echoed.borrow_mut().insert(msg.read::<u16>()?);
            Ok(())
        }
    });

    for n in 0..MSG_COUNT {
        let mut msg = client.message(SendMode::Reliable, MSG_ECHO);
        msg.write(&n).unwrap();
        client.send(msg);
    }

    let mut k = 10;
    while echoed.borrow().len() < usize::from(MSG_COUNT) {
        k += 1;
        assert!(k < 60_000, "echoes incomplete: {}", echoed.borrow().len());
        let now = start + TICK * k;
        server.tick(now);
        client.tick(now);
    }
    // order is irrelevant, completeness is not
    assert_eq!(usize::from(MSG_COUNT), echoed.borrow().len());
    assert!(client.is_connected());
}

/// A client fires 1000 unreliable messages through 10 % loss; statistically
/// (and exactly, under the fixed seed) the server sees 850 to 950 of them.
#[test]
fn unreliable_messages_are_lost_but_not_duplicated() {
    let start = Instant::now();
    let (mut server, mut client) = connected_pair(start);
    server.transport_mut().set_config(&ConditionerConfig {
        loss_rate: 0.1,
        ..ConditionerConfig::default()
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    server.on_message(MSG_ECHO, {
        let seen = Rc::clone(&seen);
        move |_, _, msg| {
            seen.borrow_mut().push(msg.read::<u16>()?);
            Ok(())
        }
    });

    for n in 0..MSG_COUNT {
        let mut msg = client.message(SendMode::Unreliable, MSG_ECHO);
        msg.write(&n).unwrap();
        client.send(msg);
    }
    for k in 11..=30 {
        let now = start + TICK * k;
        server.tick(now);
        client.tick(now);
    }

    let seen = seen.borrow();
    assert!(
        (850..=950).contains(&seen.len()),
        "received {} of {MSG_COUNT}",
        seen.len()
    );
    // no duplication on the unreliable path
    let unique = seen.iter().collect::<BTreeSet<_>>();
    assert_eq!(unique.len(), seen.len());
}
