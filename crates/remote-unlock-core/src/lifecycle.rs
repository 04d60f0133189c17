//! Supervises the session server, waits for every volume to be unlocked,
//! and shuts down exactly once.
//!
//! Three tasks share one cancellation scope: the accept loop, a completion
//! watcher and a shutdown watcher. The first task to finish with a terminal
//! result (an error, the all-unlocked event, or the listener closing on its
//! own) cancels the scope; the others then wind down and the group result
//! says which one it was.

use crate::completion::CompletionSignal;
use crate::error::{UnlockError, UnlockResult};
use crate::provider::VolumeProvider;
use crate::server::SessionServer;
use crate::transport::Listener;
use log::{debug, info};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a lifecycle task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskExit {
    /// Stopped without deciding the group's outcome.
    Finished,
    /// The completion signal fired.
    AllVolumesUnlocked,
}

/// Serve sessions until every volume is unlocked, then resume the boot.
///
/// Returns `Ok(())` once `resume_boot` succeeded. Cancelling `cancel` ends the
/// run with [`UnlockError::Cancelled`] and never resumes the boot.
pub async fn run<P, L>(cancel: CancellationToken, provider: Arc<P>, listener: L) -> UnlockResult<()>
where
    P: VolumeProvider + ?Sized + 'static,
    L: Listener,
{
    supervise(cancel, Arc::clone(&provider), listener).await?;

    info!("all volumes unlocked; resuming boot");
    tokio::task::spawn_blocking(move || provider.resume_boot()).await?
}

/// Run the supervised task group. `Ok(())` means every volume was unlocked;
/// any other ending is the first error raised inside the group.
pub async fn supervise<P, L>(
    cancel: CancellationToken,
    provider: Arc<P>,
    listener: L,
) -> UnlockResult<()>
where
    P: VolumeProvider + ?Sized + 'static,
    L: Listener,
{
    let scope = cancel.child_token();
    let completion = Arc::new(CompletionSignal::new());
    let server = Arc::new(SessionServer::new(provider, Arc::clone(&completion)));

    let mut tasks: JoinSet<UnlockResult<TaskExit>> = JoinSet::new();

    {
        let scope = scope.clone();
        let server = Arc::clone(&server);
        tasks.spawn(async move {
            server.serve(listener).await?;
            if scope.is_cancelled() {
                Ok(TaskExit::Finished)
            } else {
                Err(UnlockError::ServerStopped)
            }
        });
    }

    {
        let scope = scope.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => Err(UnlockError::Cancelled),
                _ = completion.wait() => Ok(TaskExit::AllVolumesUnlocked),
            }
        });
    }

    {
        let scope = scope.clone();
        let server = Arc::clone(&server);
        tasks.spawn(async move {
            scope.cancelled().await;
            debug!("scope cancelled; closing session server");
            server.close();
            Ok(TaskExit::Finished)
        });
    }

    let mut outcome: Option<UnlockResult<()>> = None;
    while let Some(joined) = tasks.join_next().await {
        let terminal = match joined.map_err(UnlockError::from).and_then(|exit| exit) {
            Ok(TaskExit::Finished) => continue,
            Ok(TaskExit::AllVolumesUnlocked) => Ok(()),
            Err(err) => Err(err),
        };

        if outcome.is_none() {
            if let Err(err) = &terminal {
                debug!("lifecycle task failed first: {err}");
            }
            outcome = Some(terminal);
            scope.cancel();
        }
    }

    // Every path out of the group records an outcome; the serve task only
    // finishes quietly once the scope is cancelled, which sets one.
    outcome.unwrap_or(Err(UnlockError::ServerStopped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelListener, Connection, PtyRequest, PtySize};
    use crate::unlock::tests::MockProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    fn pty() -> Option<PtyRequest> {
        Some(PtyRequest {
            size: PtySize {
                width: 80,
                height: 24,
            },
            resizes: None,
        })
    }

    /// Listener that records being dropped, i.e. closed by the server.
    struct TrackedListener {
        inner: ChannelListener,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for TrackedListener {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Listener for TrackedListener {
        async fn accept(&mut self) -> UnlockResult<Option<Connection>> {
            self.inner.accept().await
        }
    }

    async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        timeout(LIMIT, async {
            while !seen.contains(needle) {
                let mut buf = [0u8; 512];
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "closed before {needle:?}: {seen:?}");
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unlocking_everything_resumes_boot_once() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "p1"), ("tank/b", "p2")]));
        let (tx, listener) = ChannelListener::new(4);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(run(cancel.clone(), provider.clone(), listener));

        let (local, mut remote) = duplex(4096);
        let (conn, exit) = Connection::new("peer-1", pty(), local);
        tx.send(Ok(conn)).await.unwrap();

        read_until(&mut remote, "Password: ").await;
        remote.write_all(b"p1\r").await.unwrap();
        read_until(&mut remote, "Password: ").await;
        remote.write_all(b"p2\r").await.unwrap();
        read_until(&mut remote, "All volumes are unlocked.").await;

        timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
        assert_eq!(*provider.resume_calls.lock().unwrap(), 1);
        assert_eq!(timeout(LIMIT, exit).await.unwrap().unwrap(), 0);
        assert!(!cancel.is_cancelled(), "the caller's token is never cancelled by the group");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_completions_resume_boot_once() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "pw")]));
        provider.unlock("tank/a");
        let (tx, listener) = ChannelListener::new(8);
        let run = tokio::spawn(run(CancellationToken::new(), provider.clone(), listener));

        let mut remotes = Vec::new();
        for i in 0..4 {
            let (local, remote) = duplex(4096);
            let (conn, _exit) = Connection::new(format!("peer-{i}"), pty(), local);
            tx.send(Ok(conn)).await.unwrap();
            remotes.push(remote);
        }

        timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
        assert_eq!(*provider.resume_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_volume_set_completes_on_first_session() {
        let provider = Arc::new(MockProvider::new(&[]));
        let (tx, listener) = ChannelListener::new(1);
        let run = tokio::spawn(run(CancellationToken::new(), provider.clone(), listener));

        let (local, _remote) = duplex(4096);
        let (conn, _exit) = Connection::new("peer", pty(), local);
        tx.send(Ok(conn)).await.unwrap();

        timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
        assert_eq!(*provider.resume_calls.lock().unwrap(), 1);
        assert!(provider.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_closes_listener_and_skips_resume() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "pw")]));
        let (_tx, inner) = ChannelListener::new(1);
        let dropped = Arc::new(AtomicBool::new(false));
        let listener = TrackedListener {
            inner,
            dropped: dropped.clone(),
        };
        let cancel = CancellationToken::new();
        let run = tokio::spawn(run(cancel.clone(), provider.clone(), listener));

        tokio::task::yield_now().await;
        cancel.cancel();

        let err = timeout(LIMIT, run).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(dropped.load(Ordering::SeqCst), "listener should be closed");
        assert_eq!(*provider.resume_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_leaves_running_sessions_alone() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "pw")]));
        let (tx, listener) = ChannelListener::new(1);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(run(cancel.clone(), provider.clone(), listener));

        let (local, mut remote) = duplex(4096);
        let (conn, exit) = Connection::new("peer", pty(), local);
        tx.send(Ok(conn)).await.unwrap();
        read_until(&mut remote, "Password: ").await;

        cancel.cancel();
        let err = timeout(LIMIT, run).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The in-flight session still answers until its client leaves.
        remote.write_all(b"wrong\r").await.unwrap();
        read_until(&mut remote, "Please try again.\x1b[0m\r\nPassword: ").await;
        drop(remote);
        assert_eq!(timeout(LIMIT, exit).await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn listener_closing_early_stops_the_group() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "pw")]));
        let (tx, listener) = ChannelListener::new(1);
        drop(tx);

        let err = timeout(LIMIT, run(CancellationToken::new(), provider.clone(), listener))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, UnlockError::ServerStopped), "{err}");
        assert_eq!(*provider.resume_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn confirmation_is_delivered_before_boot_resumes() {
        let provider = Arc::new(MockProvider::new(&[]));
        let (tx, listener) = ChannelListener::new(1);
        let run = tokio::spawn(run(CancellationToken::new(), provider.clone(), listener));

        // Too small for the banner and the confirmation together.
        let (local, mut remote) = duplex(48);
        let (conn, _exit) = Connection::new("slow-reader", pty(), local);
        tx.send(Ok(conn)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished(), "boot resumed before the client was told");
        assert_eq!(*provider.resume_calls.lock().unwrap(), 0);

        read_until(&mut remote, "All volumes are unlocked.\x1b[0m\r\n").await;
        timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
        assert_eq!(*provider.resume_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn accept_failure_propagates_as_error() {
        let provider = Arc::new(MockProvider::new(&[("tank/a", "pw")]));
        let (tx, listener) = ChannelListener::new(1);
        tx.send(Err(UnlockError::Transport("listener died".into())))
            .await
            .unwrap();

        let err = timeout(LIMIT, run(CancellationToken::new(), provider.clone(), listener))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, UnlockError::Transport(_)), "{err}");
        assert_eq!(*provider.resume_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn resume_boot_failure_is_the_result() {
        struct StuckBoot;

        impl VolumeProvider for StuckBoot {
            fn list_volumes(&self) -> UnlockResult<crate::provider::VolumeSet> {
                Ok(Default::default())
            }

            fn attempt_password(
                &self,
                _volume: &str,
                _password: &str,
            ) -> UnlockResult<crate::provider::AttemptOutcome> {
                unreachable!("no volumes to attempt")
            }

            fn resume_boot(&self) -> UnlockResult<()> {
                Err(UnlockError::Provider("killall exited with code 1".into()))
            }
        }

        let (tx, listener) = ChannelListener::new(1);
        let (local, _remote) = duplex(4096);
        let (conn, _exit) = Connection::new("peer", pty(), local);
        tx.send(Ok(conn)).await.unwrap();

        let err = timeout(LIMIT, run(CancellationToken::new(), Arc::new(StuckBoot), listener))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, UnlockError::Provider(_)), "{err}");
    }
}
