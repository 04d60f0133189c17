//! Boundary between the session server and whatever carries the bytes.
//!
//! Transports (the daemon's SSH listener, in-memory pipes in tests) hand the
//! server already-authenticated [`Connection`]s through the [`Listener`] trait.

use crate::error::UnlockResult;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub width: u32,
    pub height: u32,
}

/// Interactive terminal negotiated by the client.
#[derive(Debug)]
pub struct PtyRequest {
    pub size: PtySize,
    /// Live window-change notifications, if the transport forwards them.
    pub resizes: Option<mpsc::UnboundedReceiver<PtySize>>,
}

pub trait DuplexStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send + ?Sized> DuplexStream for T {}

pub type BoxedStream = Pin<Box<dyn DuplexStream>>;

/// One accepted client session.
pub struct Connection {
    pub peer: String,
    pub pty: Option<PtyRequest>,
    pub stream: BoxedStream,
    exit: Option<oneshot::Sender<u32>>,
}

impl Connection {
    /// Wrap a stream; the returned receiver yields the exit status once the
    /// session is over, after every byte written to `stream` was flushed.
    pub fn new<S>(
        peer: impl Into<String>,
        pty: Option<PtyRequest>,
        stream: S,
    ) -> (Self, oneshot::Receiver<u32>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (exit_tx, exit_rx) = oneshot::channel();
        let conn = Self {
            peer: peer.into(),
            pty,
            stream: Box::pin(stream),
            exit: Some(exit_tx),
        };
        (conn, exit_rx)
    }

    /// Split into parts the session needs, keeping the exit reporter.
    pub(crate) fn into_parts(self) -> (String, Option<PtyRequest>, BoxedStream, ExitReporter) {
        (self.peer, self.pty, self.stream, ExitReporter(self.exit))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("pty", &self.pty)
            .finish_non_exhaustive()
    }
}

/// Sends the session's exit status back to the transport.
pub(crate) struct ExitReporter(Option<oneshot::Sender<u32>>);

impl ExitReporter {
    pub(crate) fn report(mut self, code: u32) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(code);
        }
    }
}

/// Source of incoming connections.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next connection. `Ok(None)` means the listener was closed
    /// cleanly and no further connections will arrive.
    async fn accept(&mut self) -> UnlockResult<Option<Connection>>;
}

/// Listener fed from an in-process channel. Used by tests and by transports
/// whose accept loop runs in its own task.
pub struct ChannelListener {
    incoming: mpsc::Receiver<UnlockResult<Connection>>,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (mpsc::Sender<UnlockResult<Connection>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { incoming: rx })
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&mut self) -> UnlockResult<Option<Connection>> {
        match self.incoming.recv().await {
            Some(Ok(conn)) => Ok(Some(conn)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}
