//! A clean remote half-close, and a write-queue warning when the peer
//! stops reading.

mod support;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use netcore::{Event, SocketId, SocketStatus};
use support::{drive_until, pump, LOCALHOST};

fn connect_pair(engine: &netcore::Engine, worker: &mut netcore::StandaloneWorker) -> (SocketId, SocketId) {
    let listener = engine
        .listen_at(1, SocketAddr::from((LOCALHOST, 0)), 16)
        .expect("listen");
    let mut port = 0u16;
    drive_until(worker, Duration::from_secs(2), |ev| match ev {
        Event::Open { id, listen_port, .. } if *id == listener => {
            port = *listen_port;
            true
        }
        _ => false,
    });
    engine.resume(listener, 1).expect("resume listener");

    let connector = engine.connect(2, "127.0.0.1", port).expect("connect");

    let mut accepted = None;
    drive_until(worker, Duration::from_secs(2), |ev| match ev {
        Event::Accept { new_id, .. } => {
            accepted = Some(*new_id);
            true
        }
        _ => false,
    });
    let accepted = accepted.expect("never accepted");
    engine.resume(accepted, 1).expect("resume accepted");

    drive_until(worker, Duration::from_secs(2), |ev| {
        matches!(ev, Event::Open { id, opaque: 2, .. } if *id == connector)
    });

    (connector, accepted)
}

/// A genuine remote half-close has to come from outside the engine — use a
/// plain `TcpStream` as the peer so `shutdown(Write)` is a real `SHUT_WR`
/// on a socket the engine doesn't own.
#[test]
fn remote_half_close_then_local_close_finishes() {
    let (engine, mut worker) = netcore::spawn_standalone().expect("spawn_standalone");

    let listener = engine
        .listen_at(1, SocketAddr::from((LOCALHOST, 0)), 16)
        .expect("listen");
    let mut port = 0u16;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Open { id, listen_port, .. } if *id == listener => {
            port = *listen_port;
            true
        }
        _ => false,
    });
    engine.resume(listener, 1).expect("resume listener");

    let mut peer = TcpStream::connect((LOCALHOST, port)).expect("peer connect");

    let mut accepted = None;
    drive_until(&mut worker, Duration::from_secs(2), |ev| match ev {
        Event::Accept { new_id, .. } => {
            accepted = Some(*new_id);
            true
        }
        _ => false,
    });
    let accepted = accepted.expect("never accepted");
    engine.resume(accepted, 1).expect("resume accepted");

    peer.shutdown(std::net::Shutdown::Write).expect("peer shutdown(WR)");

    // No event is emitted for the half-close itself (only force_close ever
    // emits SOCKET_CLOSE/SOCKET_RST) — poll until the engine's own status
    // view shows the transition into the half-closed state.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut half_closed = false;
    while Instant::now() < deadline {
        pump(&mut worker, Duration::from_millis(20));
        if engine
            .info()
            .iter()
            .any(|s| s.id == accepted && s.status == SocketStatus::Closing)
        {
            half_closed = true;
            break;
        }
    }
    assert!(half_closed, "accepted side never transitioned to half-closed-read after the peer's FIN");

    // The accepted side can still write after the peer half-closed its read...
    engine.send(accepted, b"still here".to_vec()).expect("send after half-close");
    let mut buf = [0u8; 32];
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = peer.read(&mut buf).expect("peer read after half-close");
    assert_eq!(&buf[..n], b"still here");

    // ...and a close request now (queues empty) force-closes and reports exactly once.
    engine.close(accepted, 1).expect("close");
    let closed = drive_until(&mut worker, Duration::from_secs(2), |ev| {
        matches!(ev, Event::Close { id, .. } | Event::Rst { id, .. } if *id == accepted)
    });
    assert!(
        closed.iter().any(|ev| matches!(ev, Event::Close { .. } | Event::Rst { .. })),
        "accepted side never finished closing after the local close request"
    );
}

#[test]
fn backpressure_warns_then_drains_once_reader_resumes() {
    let (engine, mut worker) = netcore::spawn_standalone().expect("spawn_standalone");
    let (connector, accepted) = connect_pair(&engine, &mut worker);

    // Stop the accepting side from reading so the OS socket buffers and then
    // our own write queue back up behind it.
    engine.pause(accepted, 1).expect("pause accepted");

    // 8 MiB in 64 KiB chunks comfortably exceeds the OS's default TCP send
    // and receive buffers combined, forcing our own queue to hold backlog.
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 128;
    for i in 0..CHUNKS {
        let chunk = vec![(i & 0xFF) as u8; CHUNK];
        engine.send(connector, chunk).expect("send");
    }

    let mut saw_warning = false;
    let events = drive_until(&mut worker, Duration::from_secs(5), |ev| {
        if matches!(ev, Event::Warning { id, .. } if *id == connector) {
            saw_warning = true;
            return true;
        }
        false
    });
    assert!(
        saw_warning,
        "never saw a backpressure warning after queuing {} bytes with the reader paused; events: {:?}",
        CHUNK * CHUNKS,
        events
    );

    // Let the receiver resume and drain the backlog, and pump both sides
    // until the queue empties and every byte shows up the other side.
    engine.resume(accepted, 1).expect("resume accepted");
    let mut total_received = 0usize;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while total_received < CHUNK * CHUNKS && std::time::Instant::now() < deadline {
        for ev in pump(&mut worker, Duration::from_millis(200)) {
            if let Event::Data { id, payload, .. } = ev {
                if id == accepted {
                    total_received += payload.len();
                }
            }
        }
    }
    assert_eq!(total_received, CHUNK * CHUNKS, "receiver never drained the full backlog");
}
