//! Accept loop that hands every connection its own unlock session.

use crate::completion::CompletionSignal;
use crate::error::UnlockResult;
use crate::provider::VolumeProvider;
use crate::session::{Terminal, UnlockSession};
use crate::transport::{Connection, Listener};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const NO_PTY: &[u8] = b"No PTY requested.\n";

/// Runs unlock sessions for incoming connections until closed.
pub struct SessionServer<P: ?Sized> {
    provider: Arc<P>,
    completion: Arc<CompletionSignal>,
    closed: CancellationToken,
}

impl<P> SessionServer<P>
where
    P: VolumeProvider + ?Sized + 'static,
{
    pub fn new(provider: Arc<P>, completion: Arc<CompletionSignal>) -> Self {
        Self {
            provider,
            completion,
            closed: CancellationToken::new(),
        }
    }

    /// Accept connections until [`SessionServer::close`] is called or the
    /// listener reports a clean close. Accept errors are returned.
    ///
    /// Sessions already running are left alone when the server stops; they
    /// end on their next read or write once the transport goes away.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> UnlockResult<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.closed.cancelled() => {
                    info!("session server closed");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let Some(conn) = accepted else {
                info!("listener closed");
                return Ok(());
            };

            info!("accepted session from {}", conn.peer);
            let provider = Arc::clone(&self.provider);
            let completion = Arc::clone(&self.completion);
            tokio::spawn(handle_connection(provider, completion, conn));
        }
    }

    /// Stop accepting; wakes a pending `serve` immediately.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Run one connection to completion and report its exit status.
async fn handle_connection<P>(provider: Arc<P>, completion: Arc<CompletionSignal>, conn: Connection)
where
    P: VolumeProvider + ?Sized + 'static,
{
    let (peer, pty, mut stream, exit) = conn.into_parts();

    let Some(pty) = pty else {
        warn!("rejecting session from {peer}: no pty requested");
        if let Err(err) = stream.write_all(NO_PTY).await {
            debug!("could not notify {peer}: {err}");
        }
        let _ = stream.shutdown().await;
        drop(stream);
        exit.report(1);
        return;
    };

    let session = UnlockSession::new(provider, completion, Terminal::new(stream, pty), peer.clone());
    let code = match session.run().await {
        Ok(end) => end.exit_code(),
        Err(err) => {
            debug!("session from {peer} lost its connection: {err}");
            1
        }
    };
    exit.report(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnlockError;
    use crate::transport::{ChannelListener, PtyRequest, PtySize};
    use crate::unlock::tests::MockProvider;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::timeout;

    fn server(volumes: &[(&str, &str)]) -> Arc<SessionServer<MockProvider>> {
        Arc::new(SessionServer::new(
            Arc::new(MockProvider::new(volumes)),
            Arc::new(CompletionSignal::new()),
        ))
    }

    #[tokio::test]
    async fn rejects_connections_without_pty() {
        let server = server(&[("tank/a", "pw")]);
        let (tx, listener) = ChannelListener::new(4);
        let serve = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let (local, mut remote) = duplex(1024);
        let (conn, exit) = Connection::new("10.0.0.2:5555", None, local);
        tx.send(Ok(conn)).await.unwrap();

        let code = timeout(Duration::from_secs(5), exit).await.unwrap().unwrap();
        assert_eq!(code, 1);
        let mut text = String::new();
        remote.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "No PTY requested.\n");

        server.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pty_sessions_report_exit_status() {
        let server = server(&[]);
        let (tx, listener) = ChannelListener::new(4);
        let serve = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let (local, mut remote) = duplex(1024);
        let pty = PtyRequest {
            size: PtySize {
                width: 80,
                height: 24,
            },
            resizes: None,
        };
        let (conn, exit) = Connection::new("10.0.0.3:5555", Some(pty), local);
        tx.send(Ok(conn)).await.unwrap();

        let code = timeout(Duration::from_secs(5), exit).await.unwrap().unwrap();
        assert_eq!(code, 0);
        let mut text = String::new();
        remote.read_to_string(&mut text).await.unwrap();
        assert!(text.contains("All volumes are unlocked."));
        assert!(server.completion.is_fired());

        drop(tx);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let server = server(&[("tank/a", "pw")]);
        let (_tx, listener) = ChannelListener::new(1);
        let serve = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        tokio::task::yield_now().await;
        server.close();
        assert!(server.is_closed());
        timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve should stop after close")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn accept_errors_are_returned() {
        let server = server(&[]);
        let (tx, listener) = ChannelListener::new(1);
        tx.send(Err(UnlockError::Transport("accept failed".into())))
            .await
            .unwrap();

        let err = server.serve(listener).await.unwrap_err();
        assert!(matches!(err, UnlockError::Transport(_)));
    }
}
