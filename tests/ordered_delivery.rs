//! Reliable-ordered delivery under injected packet loss, driven through a
//! configuration file: the device drops 20% of egress datagrams and the
//! sliding window has to recover ordering and completeness.

mod common;

use anyhow::{bail, Result};
use cci::{Attribute, EventKind, Flags, Status};
use common::{next_event, send_flow_controlled};
use std::io::Write;
use std::time::Duration;

const MESSAGES: usize = 1000;

/// One test per binary: the configuration travels through the CCI_CONFIG
/// environment variable, which is process-global.
#[test]
fn ordered_delivery_under_loss() -> Result<()> {
    let mut config = tempfile::NamedTempFile::new()?;
    write!(
        config,
        "[lossy]\n\
         transport = udp\n\
         ip = 127.0.0.1\n\
         loss = 20\n\
         default = 1\n"
    )?;
    std::env::set_var("CCI_CONFIG", config.path());

    cci::logging::init();
    cci::init(cci::ABI_VERSION, 0)?;

    // The configured device is what init enumerated.
    let devices = cci::devices()?;
    assert!(devices.iter().any(|d| d.name == "lossy" && d.is_default && d.up));

    let (server, _server_wake) = cci::create_endpoint(None, 0)?;
    let (client, _client_wake) = cci::create_endpoint(None, 0)?;

    client.connect(&server.uri(), b"", Attribute::Ro, 1, Flags::NONE, None)?;

    let mut request = next_event(&server, Duration::from_secs(10))?;
    assert!(matches!(request.kind(), EventKind::ConnectRequest { .. }));
    server.accept(&request, 2)?;
    server.return_event(&mut request)?;

    let mut accept = next_event(&server, Duration::from_secs(10))?;
    let EventKind::Accept { status: Status::Success, .. } = accept.kind() else {
        bail!("accept failed: {:?}", accept.kind());
    };
    server.return_event(&mut accept)?;

    let mut connect = next_event(&client, Duration::from_secs(10))?;
    let client_conn = match connect.kind() {
        EventKind::Connect {
            status: Status::Success,
            connection: Some(conn),
            ..
        } => conn.clone(),
        other => bail!("connect failed: {other:?}"),
    };
    client.return_event(&mut connect)?;

    // Five-second send deadline, as the scenario prescribes.
    client_conn.set_opt(cci::ConnectionOption::SendTimeout, 5_000_000)?;

    // Server consumer: receives must arrive strictly in send order.
    let server_side = std::thread::spawn(move || -> Result<()> {
        let mut expected: u64 = 0;
        while (expected as usize) < MESSAGES {
            let mut event = next_event(&server, Duration::from_secs(60))?;
            if let EventKind::Recv { .. } = event.kind() {
                let index = u64::from_be_bytes(event.data().try_into().unwrap());
                if index != expected {
                    bail!("out of order: got {index}, expected {expected}");
                }
                expected += 1;
            }
            server.return_event(&mut event)?;
        }
        Ok(())
    });

    // Client producer: completions must also come back in issue order. The
    // counter lives in a cell so the drain closure and the loop condition
    // can share it.
    let completed = std::cell::Cell::new(0u64);
    let mut on_event = |mut event: cci::Event| -> Result<()> {
        if let EventKind::Send { status, context, .. } = event.kind() {
            assert_eq!(*status, Status::Success);
            assert_eq!(*context, completed.get(), "completions out of order");
            completed.set(completed.get() + 1);
        }
        client.return_event(&mut event)?;
        Ok(())
    };
    for index in 0..MESSAGES as u64 {
        send_flow_controlled(
            &client,
            &client_conn,
            &index.to_be_bytes(),
            index,
            Flags::NONE,
            &mut on_event,
        )?;
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(60);
    while (completed.get() as usize) < MESSAGES {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .ok_or_else(|| {
                anyhow::anyhow!("only {}/{MESSAGES} completions", completed.get())
            })?;
        let event = next_event(&client, remaining)?;
        on_event(event)?;
    }

    server_side.join().expect("server thread panicked")?;
    Ok(())
}
