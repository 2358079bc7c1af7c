//! RMA scenarios: bulk write with a completion message at offsets, read
//! round trip, FENCE ordering, unknown-handle rejection, and deregister
//! semantics.

mod common;

use anyhow::{bail, Result};
use cci::{Attribute, EventKind, Flags, RmaRemoteHandle, Status};
use common::{checksum64, connected_pair, fill_pattern, next_event};
use std::time::Duration;

const REGION: usize = 4 * 1024 * 1024;
const TRANSFER: usize = 1024 * 1024;
const LOCAL_OFFSET: u64 = 65536;
const REMOTE_OFFSET: u64 = 131072;

/// Wait for one SEND completion with the given context and return its
/// status, returning every event drained on the way.
fn wait_completion(endpoint: &cci::Endpoint, context: u64) -> Result<Status> {
    let deadline = Duration::from_secs(30);
    loop {
        let mut event = next_event(endpoint, deadline)?;
        let found = match event.kind() {
            EventKind::Send {
                status,
                context: seen,
                ..
            } if *seen == context => Some(*status),
            _ => None,
        };
        endpoint.return_event(&mut event)?;
        if let Some(status) = found {
            return Ok(status);
        }
    }
}

#[test]
fn write_with_completion_message_at_offsets() -> Result<()> {
    let pair = connected_pair(Attribute::Ro, b"rma")?;

    let mut source = vec![0u8; REGION];
    fill_pattern(&mut source, 41);
    let local = pair.client.rma_register(source.clone(), Flags::READ | Flags::WRITE)?;
    let target = pair.server.rma_register(vec![0u8; REGION], Flags::READ | Flags::WRITE)?;
    let remote = RmaRemoteHandle::from_descriptor(&target.descriptor())?;

    let written = &source[LOCAL_OFFSET as usize..LOCAL_OFFSET as usize + TRANSFER];
    let mut completion = checksum64(written).to_be_bytes().to_vec();
    completion.extend_from_slice(&(TRANSFER as u64).to_be_bytes());
    assert_eq!(completion.len(), 16);

    pair.client_conn.rma(
        Some(&completion),
        &local,
        LOCAL_OFFSET,
        &remote,
        REMOTE_OFFSET,
        TRANSFER as u64,
        77,
        Flags::WRITE,
    )?;

    // The server's only event is the completion message, and by the time it
    // arrives every data fragment has been applied.
    let mut event = next_event(&pair.server, Duration::from_secs(30))?;
    let EventKind::Recv { .. } = event.kind() else {
        bail!("expected completion message, got {:?}", event.kind());
    };
    assert_eq!(event.data().len(), 16);
    let claimed = u64::from_be_bytes(event.data()[..8].try_into().unwrap());
    let length = u64::from_be_bytes(event.data()[8..].try_into().unwrap());
    assert_eq!(length as usize, TRANSFER);
    pair.server.return_event(&mut event)?;

    let mut landed = vec![0u8; TRANSFER];
    target.read_at(REMOTE_OFFSET, &mut landed)?;
    assert_eq!(checksum64(&landed), claimed);
    assert_eq!(&landed[..], written);

    assert_eq!(wait_completion(&pair.client, 77)?, Status::Success);
    Ok(())
}

#[test]
fn read_round_trip() -> Result<()> {
    let pair = connected_pair(Attribute::Ru, b"read")?;

    let mut source = vec![0u8; REGION];
    fill_pattern(&mut source, 97);
    let target = pair.server.rma_register(source.clone(), Flags::READ)?;
    let local = pair.client.rma_register(vec![0u8; TRANSFER], Flags::READ | Flags::WRITE)?;
    let remote = RmaRemoteHandle::from_descriptor(&target.descriptor())?;

    pair.client_conn.rma(
        None,
        &local,
        0,
        &remote,
        REMOTE_OFFSET,
        TRANSFER as u64 / 4,
        88,
        Flags::READ,
    )?;
    assert_eq!(wait_completion(&pair.client, 88)?, Status::Success);

    let want = &source[REMOTE_OFFSET as usize..REMOTE_OFFSET as usize + TRANSFER / 4];
    let mut got = vec![0u8; TRANSFER / 4];
    local.read_at(0, &mut got)?;
    assert_eq!(&got[..], want);
    Ok(())
}

/// A fenced operation's completion message proves every byte of the
/// operations before it has landed.
#[test]
fn fence_orders_operations() -> Result<()> {
    let pair = connected_pair(Attribute::Ro, b"fence")?;

    let mut source = vec![0u8; TRANSFER];
    fill_pattern(&mut source, 7);
    let local = pair.client.rma_register(source.clone(), Flags::READ)?;
    let target = pair.server.rma_register(vec![0u8; REGION], Flags::READ | Flags::WRITE)?;
    let remote = RmaRemoteHandle::from_descriptor(&target.descriptor())?;

    // Bulk operation, silent.
    pair.client_conn.rma(
        None,
        &local,
        0,
        &remote,
        0,
        TRANSFER as u64,
        1,
        Flags::WRITE | Flags::SILENT,
    )?;
    // Fenced marker with a completion message: may not issue until the bulk
    // data is remotely acknowledged.
    pair.client_conn.rma(
        Some(b"fence-done"),
        &local,
        0,
        &remote,
        REGION as u64 - 8,
        8,
        2,
        Flags::WRITE | Flags::FENCE,
    )?;

    let mut event = next_event(&pair.server, Duration::from_secs(30))?;
    let EventKind::Recv { .. } = event.kind() else {
        bail!("expected fence completion, got {:?}", event.kind());
    };
    assert_eq!(event.data(), b"fence-done");
    pair.server.return_event(&mut event)?;

    let mut landed = vec![0u8; TRANSFER];
    target.read_at(0, &mut landed)?;
    assert_eq!(&landed[..], &source[..]);

    assert_eq!(wait_completion(&pair.client, 2)?, Status::Success);
    Ok(())
}

#[test]
fn unknown_remote_handle_is_rejected() -> Result<()> {
    let pair = connected_pair(Attribute::Ro, b"bogus")?;
    let local = pair.client.rma_register(vec![1u8; 4096], Flags::READ)?;

    // A descriptor nobody registered.
    let mut descriptor = [0u8; cci::RMA_DESCRIPTOR_LEN];
    descriptor[..8].copy_from_slice(&0x1bad_b002_dead_beefu64.to_be_bytes());
    descriptor[8..16].copy_from_slice(&(REGION as u64).to_be_bytes());
    descriptor[16..24].copy_from_slice(&(Flags::WRITE.bits() as u64).to_be_bytes());
    let remote = RmaRemoteHandle::from_descriptor(&descriptor)?;

    pair.client_conn
        .rma(None, &local, 0, &remote, 0, 4096, 5, Flags::WRITE)?;
    assert_eq!(wait_completion(&pair.client, 5)?, Status::RmaHandle);
    Ok(())
}

#[test]
fn write_requires_remote_write_permission() -> Result<()> {
    let pair = connected_pair(Attribute::Ro, b"prot")?;
    let local = pair.client.rma_register(vec![1u8; 4096], Flags::READ)?;
    let target = pair.server.rma_register(vec![0u8; 4096], Flags::READ)?;
    let remote = RmaRemoteHandle::from_descriptor(&target.descriptor())?;

    pair.client_conn
        .rma(None, &local, 0, &remote, 0, 4096, 6, Flags::WRITE)?;
    assert_eq!(wait_completion(&pair.client, 6)?, Status::RmaHandle);
    Ok(())
}

#[test]
fn deregister_returns_buffer_and_invalidates_handle() -> Result<()> {
    common::setup()?;
    let (endpoint, _wake) = cci::create_endpoint(None, 0)?;
    let handle = endpoint.rma_register(vec![42u8; 1024], Flags::READ | Flags::WRITE)?;
    let token = handle.token();
    assert_ne!(token, 0);

    let buf = endpoint.rma_deregister(&handle)?;
    assert_eq!(buf, vec![42u8; 1024]);

    // The stale handle has no backing region any more.
    let mut out = [0u8; 4];
    assert_eq!(handle.read_at(0, &mut out).unwrap_err(), Status::Invalid);
    assert_eq!(endpoint.rma_deregister(&handle).unwrap_err(), Status::Invalid);
    Ok(())
}

#[test]
fn rma_argument_validation() -> Result<()> {
    let reliable = connected_pair(Attribute::Ro, b"args")?;
    let local = reliable.client.rma_register(vec![0u8; 4096], Flags::READ)?;
    let target = reliable.server.rma_register(vec![0u8; 4096], Flags::READ | Flags::WRITE)?;
    let remote = RmaRemoteHandle::from_descriptor(&target.descriptor())?;

    // Both directions, neither direction, zero length, out-of-range window.
    let both = Flags::READ | Flags::WRITE;
    assert_eq!(
        reliable.client_conn.rma(None, &local, 0, &remote, 0, 16, 0, both).unwrap_err(),
        Status::Invalid
    );
    assert_eq!(
        reliable.client_conn.rma(None, &local, 0, &remote, 0, 16, 0, Flags::NONE).unwrap_err(),
        Status::Invalid
    );
    assert_eq!(
        reliable.client_conn.rma(None, &local, 0, &remote, 0, 0, 0, Flags::WRITE).unwrap_err(),
        Status::Invalid
    );
    assert_eq!(
        reliable
            .client_conn
            .rma(None, &local, 4000, &remote, 0, 800, 0, Flags::WRITE)
            .unwrap_err(),
        Status::Invalid
    );

    // RMA needs a reliable connection.
    let unreliable = connected_pair(Attribute::Uu, b"uu")?;
    let uu_local = unreliable.client.rma_register(vec![0u8; 64], Flags::READ)?;
    assert_eq!(
        unreliable
            .client_conn
            .rma(None, &uu_local, 0, &remote, 0, 16, 0, Flags::WRITE)
            .unwrap_err(),
        Status::Invalid
    );
    Ok(())
}
