use std::{io::ErrorKind, net::SocketAddr, time::Duration};

use anyhow::Result;
use tcp_fanout::relay::Relay;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

/// The wire has no acknowledgements, so tests give the relay a moment to
/// apply registrations and disconnects before acting on them.
const SETTLE: Duration = Duration::from_millis(100);

async fn start_relay() -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay = Relay::new(listener);
    let addr = relay.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = relay.run_until(shutdown).await;
    });

    Ok((addr, shutdown_tx, server))
}

async fn read_chunk(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = [0u8; 64];
    let count = timeout(Duration::from_secs(1), stream.read(&mut buf)).await??;
    Ok(buf[..count].to_vec())
}

fn assert_no_data(stream: &TcpStream) {
    let mut buf = [0u8; 64];
    match stream.try_read(&mut buf) {
        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
        Ok(0) => panic!("connection unexpectedly closed"),
        Ok(count) => panic!("expected no data, got {count} bytes"),
        Err(err) => panic!("unexpected read error: {err}"),
    }
}

#[tokio::test]
async fn payload_fans_out_to_every_other_client() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let mut alice = TcpStream::connect(addr).await?;
    let mut bob = TcpStream::connect(addr).await?;
    let mut carol = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    alice.write_all(b"hi").await?;
    assert_eq!(read_chunk(&mut bob).await?, b"hi");
    assert_eq!(read_chunk(&mut carol).await?, b"hi");

    // Bob and carol already received, so the dispatch step that would have
    // written back to alice has long finished.
    sleep(SETTLE).await;
    assert_no_data(&alice);

    // Bob leaves; only carol hears the next message.
    bob.shutdown().await?;
    drop(bob);
    sleep(SETTLE).await;

    alice.write_all(b"bye").await?;
    assert_eq!(read_chunk(&mut carol).await?, b"bye");

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn payload_arrives_byte_for_byte() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let mut alice = TcpStream::connect(addr).await?;
    let mut bob = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    // Arbitrary bytes, not text: no encoding or framing on the wire.
    let payload = [0x00, 0xff, 0x7f, b'\n', 0x01];
    alice.write_all(&payload).await?;
    assert_eq!(read_chunk(&mut bob).await?, payload);

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn relay_keeps_serving_after_clients_leave() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let alice = TcpStream::connect(addr).await?;
    let mut bob = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    // Alice drops without a word; the relay carries on.
    drop(alice);
    sleep(SETTLE).await;

    let mut carol = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    bob.write_all(b"anyone there?").await?;
    assert_eq!(read_chunk(&mut carol).await?, b"anyone there?");

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn shutdown_is_prompt_while_clients_are_connected() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    // Connected readers sit blocked on their sockets; shutdown must cancel
    // them rather than wait for them to hang up.
    let _alice = TcpStream::connect(addr).await?;
    let _bob = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    let _ = shutdown.send(());
    timeout(Duration::from_secs(2), server)
        .await
        .expect("relay should shut down promptly with clients connected")
        .expect("relay task");

    Ok(())
}

#[tokio::test]
async fn lone_client_hears_nothing_back() -> Result<()> {
    let (addr, shutdown, server) = start_relay().await?;

    let mut alice = TcpStream::connect(addr).await?;
    sleep(SETTLE).await;

    alice.write_all(b"echo?").await?;
    sleep(SETTLE).await;
    assert_no_data(&alice);

    let _ = shutdown.send(());
    let _ = server.await;
    Ok(())
}
