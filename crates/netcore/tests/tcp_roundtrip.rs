//! Listen on an ephemeral port, connect from the same engine, exchange
//! one message, and check the event sequence each side observes.

mod support;

use std::net::SocketAddr;
use std::time::Duration;

use netcore::Event;
use support::{drive_until, LOCALHOST};

#[test]
fn connect_and_echo() {
    let (engine, mut worker) = netcore::spawn_standalone().expect("spawn_standalone");

    let listener = engine
        .listen_at(1, SocketAddr::from((LOCALHOST, 0)), 16)
        .expect("listen");

    let mut listen_port = 0u16;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Open { id, opaque, listen_port: port, .. } if *id == listener => {
            assert_eq!(*opaque, 1);
            assert!(*port > 0, "auto-bound listener must report its real port");
            listen_port = *port;
            true
        }
        _ => false,
    });
    assert_ne!(listen_port, 0, "never saw SOCKET_OPEN for the listener");
    engine.resume(listener, 1).expect("resume listener");

    let connector = engine
        .connect(2, "127.0.0.1", listen_port)
        .expect("connect");

    let mut accepted_id = None;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Accept { listener: l, opaque, new_id, .. } if *l == listener => {
            assert_eq!(*opaque, 1);
            accepted_id = Some(*new_id);
            true
        }
        _ => false,
    });
    let accepted_id = accepted_id.expect("never saw SOCKET_ACCEPT");
    engine.resume(accepted_id, 1).expect("resume accepted socket");

    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        matches!(ev, Event::Open { id, opaque: 2, .. } if *id == connector)
    });

    engine.send(connector, b"ping".to_vec()).expect("send");

    let mut got_ping = false;
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        if let Event::Data { id, opaque, payload } = ev {
            if *id == accepted_id && payload == b"ping" {
                assert_eq!(*opaque, 1);
                got_ping = true;
                return true;
            }
        }
        false
    });
    assert!(got_ping, "accepted side never observed the \"ping\" payload");
}
