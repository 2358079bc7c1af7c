//! Shared plumbing for the integration scenarios: library setup, event
//! polling with deadlines, and handshake helpers.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use cci::{Attribute, Connection, Endpoint, Event, EventKind, Flags, Status, WakeHandle};
use std::time::{Duration, Instant};

/// Initialise logging and the library; refcounted, so every test may call
/// it.
pub fn setup() -> Result<()> {
    cci::logging::init();
    cci::init(cci::ABI_VERSION, 0)?;
    Ok(())
}

/// Poll for the next event, driving progress, until `timeout` elapses.
pub fn next_event(endpoint: &Endpoint, timeout: Duration) -> Result<Event> {
    let deadline = Instant::now() + timeout;
    loop {
        match endpoint.get_event() {
            Ok(Some(event)) => return Ok(event),
            Ok(None) | Err(Status::NoBufferSpace) => {
                if Instant::now() >= deadline {
                    bail!("no event within {timeout:?}");
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// A connected endpoint pair with both connection handles.
pub struct Pair {
    pub client: Endpoint,
    pub client_wake: WakeHandle,
    pub client_conn: Connection,
    pub server: Endpoint,
    pub server_wake: WakeHandle,
    pub server_conn: Connection,
}

/// Create two endpoints on the default device and run the full handshake.
pub fn connected_pair(attr: Attribute, payload: &[u8]) -> Result<Pair> {
    setup()?;
    let (server, server_wake) = cci::create_endpoint(None, 0)?;
    let (client, client_wake) = cci::create_endpoint(None, 0)?;

    client.connect(&server.uri(), payload, attr, 0xc11e47, Flags::NONE, None)?;

    // Server: request in, accept, wait for the accept completion.
    let mut request = next_event(&server, Duration::from_secs(5))?;
    match request.kind() {
        EventKind::ConnectRequest { attribute } => {
            assert_eq!(*attribute, attr);
            assert_eq!(request.data(), payload);
        }
        other => bail!("expected connect request, got {other:?}"),
    }
    server.accept(&request, 0x5e87e4)?;
    server.return_event(&mut request)?;

    let mut accept = next_event(&server, Duration::from_secs(5))?;
    let server_conn = match accept.kind() {
        EventKind::Accept {
            status: Status::Success,
            connection: Some(conn),
            ..
        } => conn.clone(),
        other => bail!("expected accept success, got {other:?}"),
    };
    server.return_event(&mut accept)?;

    // Client: connect completion.
    let mut connect = next_event(&client, Duration::from_secs(5))?;
    let client_conn = match connect.kind() {
        EventKind::Connect {
            status: Status::Success,
            context,
            connection: Some(conn),
        } => {
            assert_eq!(*context, 0xc11e47);
            conn.clone()
        }
        other => bail!("expected connect success, got {other:?}"),
    };
    client.return_event(&mut connect)?;

    Ok(Pair {
        client,
        client_wake,
        client_conn,
        server,
        server_wake,
        server_conn,
    })
}

/// Send with flow control: on `NoBufferSpace`, hand ready events to the
/// caller (who must return them) and retry.
pub fn send_flow_controlled(
    endpoint: &Endpoint,
    conn: &Connection,
    msg: &[u8],
    context: u64,
    flags: Flags,
    on_event: &mut dyn FnMut(Event) -> Result<()>,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match conn.send(msg, context, flags) {
            Ok(()) => return Ok(()),
            Err(Status::NoBufferSpace) => {
                if Instant::now() >= deadline {
                    bail!("send stalled on buffer space");
                }
                match endpoint.get_event() {
                    Ok(Some(event)) => on_event(event)?,
                    _ => std::thread::sleep(Duration::from_micros(200)),
                }
            }
            Err(other) => return Err(anyhow!("send failed: {other}")),
        }
    }
}

/// Drain events until `want` of them satisfy `visit`, within `timeout`.
pub fn collect_events(
    endpoint: &Endpoint,
    want: usize,
    timeout: Duration,
    visit: &mut dyn FnMut(&Event) -> Result<bool>,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut seen = 0;
    while seen < want {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("only {seen}/{want} events before timeout"))?;
        let mut event = next_event(endpoint, remaining)?;
        if visit(&event)? {
            seen += 1;
        }
        endpoint.return_event(&mut event)?;
    }
    Ok(())
}

/// Simple 64-bit checksum used by the RMA scenarios to cross-check a
/// transferred window without shipping the whole buffer back.
pub fn checksum64(data: &[u8]) -> u64 {
    let mut sum: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        sum ^= byte as u64;
        sum = sum.wrapping_mul(0x1000_0000_01b3);
    }
    sum
}

/// Deterministic pseudo-random fill so both sides can agree on content.
pub fn fill_pattern(buf: &mut [u8], seed: u64) {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    for byte in buf.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
}
