//! Two UDP endpoints exchange a datagram and see each other's address on
//! the wire, over both IPv4 and IPv6 loopback.

mod support;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use netcore::Event;
use support::{drive_until, LOCALHOST};

#[test]
fn udp_v4_roundtrip_reports_sender_address() {
    let (engine, mut worker) = netcore::spawn_standalone().expect("spawn_standalone");

    let server = engine
        .udp_listen(1, SocketAddr::from((LOCALHOST, 0)))
        .expect("udp_listen");

    let mut server_port = 0u16;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Open { id, listen_port, .. } if *id == server => {
            server_port = *listen_port;
            true
        }
        _ => false,
    });
    assert_ne!(server_port, 0, "never saw SOCKET_OPEN for the udp server");

    let client = engine.udp_open(2, None).expect("udp_open");
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        matches!(ev, Event::Open { id, .. } if *id == client)
    });

    let dest = SocketAddr::from((LOCALHOST, server_port));
    engine
        .send_udp(client, Some(dest), b"hello".to_vec())
        .expect("send_udp");

    let mut client_addr = None;
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        if let Event::Udp { id, payload, source, .. } = ev {
            if *id == server && payload == b"hello" {
                client_addr = Some(source.socket_addr());
                return true;
            }
        }
        false
    });
    let client_addr = client_addr.expect("server never received the datagram");
    assert_eq!(client_addr.ip(), LOCALHOST);

    // Reply straight back to the address carried on the inbound packet,
    // with no prior udp_connect on either side.
    engine
        .send_udp(server, Some(client_addr), b"world".to_vec())
        .expect("send_udp reply");

    let mut got_reply = false;
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        if let Event::Udp { id, payload, .. } = ev {
            if *id == client && payload == b"world" {
                got_reply = true;
                return true;
            }
        }
        false
    });
    assert!(got_reply, "client never received the reply datagram");
}

#[test]
fn udp_v6_roundtrip() {
    let (engine, mut worker) = netcore::spawn_standalone().expect("spawn_standalone");

    let v6_loopback = IpAddr::V6(Ipv6Addr::LOCALHOST);
    let server = match engine.udp_listen(1, SocketAddr::from((v6_loopback, 0))) {
        Ok(id) => id,
        Err(_) => return, // host has no ipv6 loopback configured
    };

    let mut server_port = 0u16;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Open { id, listen_port, .. } if *id == server => {
            server_port = *listen_port;
            true
        }
        _ => false,
    });
    assert_ne!(server_port, 0);

    let client = engine
        .udp_dial(2, "::1", server_port)
        .expect("udp_dial to v6 loopback");
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        matches!(ev, Event::Open { id, .. } if *id == client)
    });

    // dialed socket has a default peer, so send() with no destination works.
    engine.send(client, b"ping6".to_vec()).expect("send");

    let mut got = false;
    drive_until(&mut worker, Duration::from_secs(2), |ev| {
        if let Event::Udp { id, payload, source, .. } = ev {
            if *id == server && payload == b"ping6" {
                assert_eq!(source.socket_addr().ip(), v6_loopback);
                got = true;
                return true;
            }
        }
        false
    });
    assert!(got, "server never received the v6 datagram");
}
