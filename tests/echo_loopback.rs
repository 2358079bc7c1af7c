//! Echo loopback: a reliable-unordered client/server pair exchanges 1000
//! messages of 128 bytes and both sides account for every send and receive.

mod common;

use anyhow::{bail, Result};
use cci::{Attribute, EventKind, Flags, Status};
use common::{connected_pair, next_event, send_flow_controlled};
use std::collections::HashSet;
use std::time::Duration;

const MESSAGES: usize = 1000;
const MESSAGE_LEN: usize = 128;

fn payload(index: u64) -> Vec<u8> {
    let mut msg = index.to_be_bytes().to_vec();
    msg.resize(MESSAGE_LEN, 0);
    msg
}

#[test]
fn echo_round_trip() -> Result<()> {
    let pair = connected_pair(Attribute::Ru, b"echo")?;
    let (server, server_conn) = (pair.server.clone(), pair.server_conn.clone());

    // Server: echo every received message back, until it has seen 1000
    // receives and 1000 send completions.
    let server_side = std::thread::spawn(move || -> Result<()> {
        let mut recvs = 0usize;
        let mut sends = 0usize;
        let mut pending: std::collections::VecDeque<Vec<u8>> = std::collections::VecDeque::new();
        while recvs < MESSAGES || sends < MESSAGES {
            let mut event = next_event(&server, Duration::from_secs(30))?;
            match event.kind() {
                EventKind::Recv { .. } => {
                    assert_eq!(event.data().len(), MESSAGE_LEN);
                    pending.push_back(event.data().to_vec());
                    recvs += 1;
                }
                EventKind::Send { status, .. } => {
                    assert_eq!(*status, Status::Success);
                    sends += 1;
                }
                other => bail!("unexpected server event {other:?}"),
            }
            server.return_event(&mut event)?;
            // Echo as far as the TX pool allows; completions free it up.
            while let Some(bytes) = pending.front() {
                match server_conn.send(bytes, recvs as u64, Flags::NONE) {
                    Ok(()) => {
                        pending.pop_front();
                    }
                    Err(Status::NoBufferSpace) => break,
                    Err(other) => bail!("echo send failed: {other}"),
                }
            }
        }
        Ok(())
    });

    // Client: pump 1000 messages, then account for 1000 completions and
    // 1000 echoes. RU delivers in arbitrary order, so track a set. The
    // counters live in cells so the drain closure and the loop conditions
    // can share them.
    let client = &pair.client;
    let sends = std::cell::Cell::new(0usize);
    let echoes: std::cell::RefCell<HashSet<u64>> = std::cell::RefCell::new(HashSet::new());
    let mut on_event = |mut event: cci::Event| -> Result<()> {
        match event.kind() {
            EventKind::Send { status, .. } => {
                assert_eq!(*status, Status::Success);
                sends.set(sends.get() + 1);
            }
            EventKind::Recv { .. } => {
                let data = event.data();
                assert_eq!(data.len(), MESSAGE_LEN);
                let index = u64::from_be_bytes(data[..8].try_into().unwrap());
                assert!((index as usize) < MESSAGES);
                assert!(data[8..].iter().all(|&b| b == 0), "corrupt echo payload");
                assert!(echoes.borrow_mut().insert(index), "duplicate echo for {index}");
            }
            other => bail!("unexpected client event {other:?}"),
        }
        client.return_event(&mut event)?;
        Ok(())
    };

    for index in 0..MESSAGES as u64 {
        let msg = payload(index);
        send_flow_controlled(client, &pair.client_conn, &msg, index, Flags::NONE, &mut on_event)?;
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while sends.get() < MESSAGES || echoes.borrow().len() < MESSAGES {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .ok_or_else(|| {
                anyhow::anyhow!("stalled: {} sends, {} echoes", sends.get(), echoes.borrow().len())
            })?;
        let event = next_event(client, remaining)?;
        on_event(event)?;
    }
    assert_eq!(sends.get(), MESSAGES);
    assert_eq!(echoes.borrow().len(), MESSAGES);

    server_side.join().expect("server thread panicked")?;
    Ok(())
}

/// A gather send produces the same bytes as the equivalent contiguous send.
#[test]
fn sendv_gathers() -> Result<()> {
    let pair = connected_pair(Attribute::Ru, &[])?;
    pair.client_conn
        .sendv(&[b"gather", b"-", b"scatter"], 7, Flags::NONE)?;

    let mut got_recv = false;
    let mut got_send = false;
    let deadline = Duration::from_secs(10);
    while !got_recv {
        let mut event = next_event(&pair.server, deadline)?;
        if let EventKind::Recv { .. } = event.kind() {
            assert_eq!(event.data(), b"gather-scatter");
            got_recv = true;
        }
        pair.server.return_event(&mut event)?;
    }
    while !got_send {
        let mut event = next_event(&pair.client, deadline)?;
        if let EventKind::Send { status, context, .. } = event.kind() {
            assert_eq!(*status, Status::Success);
            assert_eq!(*context, 7);
            got_send = true;
        }
        pair.client.return_event(&mut event)?;
    }
    Ok(())
}

/// SILENT suppresses the local completion but still delivers the message.
#[test]
fn silent_send_has_no_completion() -> Result<()> {
    let pair = connected_pair(Attribute::Ru, &[])?;
    pair.client_conn.send(b"quiet", 9, Flags::SILENT)?;

    let mut event = next_event(&pair.server, Duration::from_secs(10))?;
    let mut saw = false;
    if let EventKind::Recv { .. } = event.kind() {
        assert_eq!(event.data(), b"quiet");
        saw = true;
    }
    pair.server.return_event(&mut event)?;
    assert!(saw);

    // No client event should surface for the silent send.
    assert!(next_event(&pair.client, Duration::from_millis(300)).is_err());
    Ok(())
}

/// BLOCKING returns only after the completion, with its status.
#[test]
fn blocking_send_returns_status() -> Result<()> {
    let pair = connected_pair(Attribute::Ro, &[])?;
    pair.client_conn.send(b"wait for me", 3, Flags::BLOCKING)?;

    let mut event = next_event(&pair.server, Duration::from_secs(10))?;
    let mut saw = false;
    if let EventKind::Recv { .. } = event.kind() {
        assert_eq!(event.data(), b"wait for me");
        saw = true;
    }
    pair.server.return_event(&mut event)?;
    assert!(saw);
    Ok(())
}
