//! Inbound command listener.
//!
//! Accepts any number of concurrent connections from the cloud node. Each
//! connection runs its own framing loop and hands every decoded envelope to
//! the shared [`CommandHandler`], one at a time and in arrival order. Bad
//! input and handler faults are answered with an `error_response` on the
//! same connection; neither closes it.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;

use tether_core::message::{new_correlation_id, Message};
use tether_core::wire::{decode_line, encode_frame, FrameDecoder, READ_CHUNK};
use tether_core::{Envelope, MessageKind, Payload};

/// `error` field of the reply to a line that failed to decode.
pub const INVALID_MESSAGE: &str = "Invalid message received";
/// `error` field of the reply when the handler fails or panics.
pub const INTERNAL_ERROR: &str = "Internal server error during message processing";

/// What the listener sends back for a handled envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: MessageKind,
    pub payload: Payload,
}

impl Reply {
    /// A `local_response_to_remote` reply.
    pub fn response(payload: Payload) -> Self {
        Self {
            kind: MessageKind::LocalResponseToRemote,
            payload,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Command dispatch seam. Invoked concurrently from every open connection.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// `Ok(None)` sends nothing. An `Err` is answered with an internal-error
    /// `error_response` carrying the envelope's correlation id.
    async fn handle(&self, envelope: &Envelope, conn: &ConnectionWriter) -> Result<Option<Reply>>;
}

/// Write side of one inbound connection.
#[derive(Clone)]
pub struct ConnectionWriter {
    peer: SocketAddr,
    half: Arc<Mutex<OwnedWriteHalf>>,
}

impl ConnectionWriter {
    fn new(peer: SocketAddr, half: OwnedWriteHalf) -> Self {
        Self {
            peer,
            half: Arc::new(Mutex::new(half)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Frame, write and flush one envelope.
    pub async fn send(&self, envelope: &Envelope) -> io::Result<()> {
        let frame = encode_frame(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut half = self.half.lock().await;
        half.write_all(&frame).await?;
        half.flush().await
    }

    async fn shutdown(&self) {
        let _ = self.half.lock().await.shutdown().await;
    }
}

pub struct CommandListener {
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
}

impl CommandListener {
    pub async fn bind(addr: &str, handler: Arc<dyn CommandHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires, then stop every connection loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!(%addr, "command listener started");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(open = connections.len(), "command listener shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&self.handler),
                        shutdown.resubscribe(),
                    ));
                }

                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!(error = %e, "connection task ended abnormally");
                    }
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn CommandHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut read, write) = stream.into_split();
    let writer = ConnectionWriter::new(peer, write);
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    tracing::info!(%peer, "command connection opened");

    'conn: loop {
        let n = tokio::select! {
            _ = shutdown.recv() => break 'conn,
            r = read.read(&mut buf) => match r {
                Ok(0) => break 'conn,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "read failed");
                    break 'conn;
                }
            },
        };
        decoder.extend(&buf[..n]);

        while let Some(line) = decoder.next_line() {
            let result = match line {
                Ok(line) => process_line(&line, handler.as_ref(), &writer).await,
                Err(e) if e.is_unrecoverable() => {
                    tracing::warn!(%peer, error = %e, "unrecoverable framing error");
                    break 'conn;
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "unreadable frame");
                    let reply = Envelope::error_response(new_correlation_id(), INVALID_MESSAGE, &e.to_string());
                    writer.send(&reply).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(%peer, error = %e, "write failed");
                break 'conn;
            }
        }
    }

    writer.shutdown().await;
    tracing::info!(%peer, "command connection closed");
}

/// Decode, dispatch and answer one line. Only write errors are returned.
async fn process_line(line: &str, handler: &dyn CommandHandler, writer: &ConnectionWriter) -> io::Result<()> {
    let envelope = match decode_line(line) {
        Ok(env) => env,
        Err(e) => {
            let correlation_id = e
                .correlation_id()
                .map(str::to_string)
                .unwrap_or_else(new_correlation_id);
            tracing::warn!(peer = %writer.peer, error = %e, %correlation_id, "invalid message");
            let reply = Envelope::error_response(correlation_id, INVALID_MESSAGE, &e.to_string());
            return writer.send(&reply).await;
        }
    };
    tracing::debug!(peer = %writer.peer, kind = %envelope.kind, correlation_id = %envelope.correlation_id, "message received");

    let outcome = AssertUnwindSafe(handler.handle(&envelope, writer))
        .catch_unwind()
        .await;
    let reply = match outcome {
        Ok(Ok(Some(reply))) => match Message::parse(reply.kind, &reply.payload) {
            Ok(_) => envelope.reply(reply.kind, reply.payload),
            Err(e) => {
                tracing::error!(error = %e, correlation_id = %envelope.correlation_id, "command handler returned an invalid reply");
                Envelope::error_response(envelope.correlation_id.clone(), INTERNAL_ERROR, &e.to_string())
            }
        },
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            tracing::error!(error = %format!("{e:#}"), correlation_id = %envelope.correlation_id, "command handler failed");
            Envelope::error_response(envelope.correlation_id.clone(), INTERNAL_ERROR, &format!("{e:#}"))
        }
        Err(panic) => {
            let details = panic_message(panic.as_ref());
            tracing::error!(%details, correlation_id = %envelope.correlation_id, "command handler panicked");
            Envelope::error_response(envelope.correlation_id.clone(), INTERNAL_ERROR, &details)
        }
    };
    writer.send(&reply).await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
