//! Shared helper for the integration tests: drive a [`StandaloneWorker`]
//! in a polling loop, the same `loop { ... thread::sleep }` shape as
//! driving `TcpConnector::poll_with` directly, except `poll_once` already
//! blocks briefly inside the poller instead of spinning, so no extra
//! sleep is needed between calls.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use netcore::{Event, StandaloneWorker};

/// Poll `worker` until `on_event` returns `true` for some event, or
/// `timeout` elapses. Returns every event observed along the way.
pub fn drive_until(
    worker: &mut StandaloneWorker,
    timeout: Duration,
    mut on_event: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(Duration::from_millis(50));
        match worker.poll_once(Some(slice)).expect("worker poll failed") {
            Some(ev) => {
                let hit = on_event(&ev);
                seen.push(ev);
                if hit {
                    return seen;
                }
            }
            None => continue,
        }
    }
    seen
}

/// Poll `worker` for a fixed span, collecting every event (used to drain
/// backlogged traffic rather than wait for one specific event).
pub fn pump(worker: &mut StandaloneWorker, span: Duration) -> Vec<Event> {
    let deadline = Instant::now() + span;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(Duration::from_millis(50));
        if let Some(ev) = worker.poll_once(Some(slice)).expect("worker poll failed") {
            seen.push(ev);
        }
    }
    seen
}

pub const LOCALHOST: std::net::IpAddr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
