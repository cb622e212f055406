//! Connection lifecycle and broadcast dispatch.
//!
//! The accept loop and every per-connection reader task feed one bounded
//! mpsc channel; a single dispatcher task consumes it and owns the registry
//! of connected clients. Broadcast writes happen inline in the dispatcher
//! step, so a slow peer stalls delivery to everyone behind it. That
//! head-of-line blocking is inherited behavior and deliberately not fixed
//! here; per-client write queues would be the hardening step.

use std::{collections::HashMap, future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::Event;

/// Bytes pulled from a connection per read. A payload is at most this large;
/// larger sends simply arrive as several events.
const READ_BUFFER_LEN: usize = 64;

/// Event channel bound. Producers suspend when the dispatcher falls behind.
const EVENT_QUEUE_DEPTH: usize = 64;

type Writer = tokio::net::tcp::OwnedWriteHalf;

pub struct Relay {
    listener: TcpListener,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` completes or accepting fails.
    ///
    /// Bind and accept failures are fatal for the whole relay; everything
    /// else (read errors, peer write failures) stays local to the connection
    /// that caused it.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener } = self;
        let (events, inbox) = mpsc::channel::<Event<Writer>>(EVENT_QUEUE_DEPTH);
        let dispatcher = tokio::spawn(dispatch(inbox));

        // Parent of every connection's token. Cancelled on the way out so
        // reader tasks stop, release their channel senders, and let the
        // dispatcher drain.
        let connections = CancellationToken::new();

        tokio::pin!(shutdown);
        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(err) = register_connection(stream, addr, &events, &connections).await {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err).context("failed to accept connection"),
                },
            }
        };

        // Live readers each hold a sender clone, so cancelling them is what
        // actually closes the channel; the dispatcher then drains and exits.
        connections.cancel();
        drop(events);
        dispatcher.await.context("dispatcher task panicked")?;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn register_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: &mpsc::Sender<Event<Writer>>,
    connections: &CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let cancel = connections.child_token();

    // Sent before the reader task exists, so the dispatcher always observes
    // `Connected` ahead of any `Message` from this peer.
    events
        .send(Event::Connected {
            addr,
            writer: write_half,
            cancel: cancel.clone(),
        })
        .await
        .ok()
        .context("dispatcher stopped accepting events")?;

    let events = events.clone();
    tokio::spawn(read_session(addr, read_half, cancel, events));
    Ok(())
}

/// Single consumer of the event channel and sole owner of the registry.
/// Events are applied strictly one at a time.
async fn dispatch(mut inbox: mpsc::Receiver<Event<Writer>>) {
    let mut registry = Registry::new();
    while let Some(event) = inbox.recv().await {
        registry.apply(event).await;
    }
    debug!("event channel closed, dispatcher exiting");
}

/// Reads from one connection until EOF, a read error, or cancellation by the
/// dispatcher, then reports exactly one `Disconnected` for it. Read failures
/// are terminal; there is no retry.
async fn read_session<R, W>(
    addr: SocketAddr,
    mut reader: R,
    cancel: CancellationToken,
    events: mpsc::Sender<Event<W>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_LEN];
    loop {
        select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(count) => {
                    let message = Event::Message {
                        addr,
                        payload: buf[..count].to_vec(),
                        cancel: cancel.clone(),
                    };
                    if events.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%addr, error = ?err, "read failed");
                    break;
                }
            },
        }
    }

    // Dropping the read half closes it; the write half is dropped by the
    // dispatcher when it applies the disconnect.
    drop(reader);
    let _ = events.send(Event::Disconnected { addr }).await;
}

struct Client<W> {
    writer: W,
    cancel: CancellationToken,
}

/// Mapping from connection identity to its client entry. Exactly one entry
/// exists per live, registered connection; a connection must be registered
/// before any message from it is considered valid.
struct Registry<W> {
    clients: HashMap<SocketAddr, Client<W>>,
}

impl<W: AsyncWrite + Unpin> Registry<W> {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    async fn apply(&mut self, event: Event<W>) {
        match event {
            Event::Connected {
                addr,
                writer,
                cancel,
            } => {
                info!(%addr, "client connected");
                // A reconnect from the same endpoint silently replaces the
                // old entry, matching the unguarded original behavior.
                self.clients.insert(addr, Client { writer, cancel });
            }
            Event::Disconnected { addr } => {
                // Idempotent: the entry may already be gone if the peer was
                // dropped on a write failure.
                if self.clients.remove(&addr).is_some() {
                    info!(%addr, "client disconnected");
                }
            }
            Event::Message {
                addr,
                payload,
                cancel,
            } => {
                if !self.clients.contains_key(&addr) {
                    // The message raced past its author's removal. Sever the
                    // connection and let its reader task report the
                    // disconnect; no broadcast.
                    warn!(%addr, "message from unregistered client, closing connection");
                    cancel.cancel();
                    return;
                }
                debug!(%addr, len = payload.len(), "client sent message");
                self.broadcast(addr, &payload).await;
            }
        }
    }

    /// Writes `payload` to every client except `author`. A peer that fails
    /// the write is treated as having disconnected: its entry is removed and
    /// its reader task cancelled; the remaining peers still get the payload.
    async fn broadcast(&mut self, author: SocketAddr, payload: &[u8]) {
        let mut failed = Vec::new();
        for (addr, client) in self.clients.iter_mut() {
            if *addr == author {
                continue;
            }
            if let Err(err) = client.writer.write_all(payload).await {
                debug!(%addr, error = ?err, "failed to deliver message to client");
                failed.push(*addr);
            }
        }
        for addr in failed {
            if let Some(client) = self.clients.remove(&addr) {
                client.cancel.cancel();
                info!(%addr, "client dropped after write failure");
            }
        }
    }
}
