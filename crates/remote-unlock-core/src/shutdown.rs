//! Two-step shutdown: the first request cancels cooperatively, the second
//! forces the process down.

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What ended an [`escalate`] watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The scope was cancelled by something other than a trigger.
    Idle,
    /// One trigger arrived and cancelled the scope.
    Cancelled,
    /// A second trigger arrived and `force` was called.
    Forced,
}

/// Watch `triggers` (named shutdown requests such as `"SIGINT"`).
///
/// The first trigger cancels `cancel`; a second one calls `force`. If `cancel`
/// fires before any trigger the watcher returns without doing anything. A
/// closed trigger channel ends the watch as well.
pub async fn escalate<F>(
    mut triggers: mpsc::Receiver<&'static str>,
    cancel: CancellationToken,
    force: F,
) -> Escalation
where
    F: FnOnce(),
{
    tokio::select! {
        biased;
        trigger = triggers.recv() => match trigger {
            Some(name) => {
                warn!("received {name}; shutting down (repeat to force)");
                cancel.cancel();
            }
            None => return Escalation::Idle,
        },
        _ = cancel.cancelled() => {
            debug!("shutdown watcher idle: scope already cancelled");
            return Escalation::Idle;
        }
    }

    match triggers.recv().await {
        Some(name) => {
            warn!("received {name} again; forcing exit");
            force();
            Escalation::Forced
        }
        None => Escalation::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn flag() -> (Arc<AtomicBool>, impl FnOnce()) {
        let forced = Arc::new(AtomicBool::new(false));
        let setter = forced.clone();
        (forced, move || setter.store(true, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn first_trigger_cancels() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let (forced, force) = flag();

        tx.send("SIGTERM").await.unwrap();
        drop(tx);

        let outcome = escalate(rx, cancel.clone(), force).await;
        assert_eq!(outcome, Escalation::Cancelled);
        assert!(cancel.is_cancelled());
        assert!(!forced.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn second_trigger_forces() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let (forced, force) = flag();

        tx.send("SIGINT").await.unwrap();
        tx.send("SIGINT").await.unwrap();

        let outcome = timeout(Duration::from_secs(5), escalate(rx, cancel.clone(), force))
            .await
            .unwrap();
        assert_eq!(outcome, Escalation::Forced);
        assert!(cancel.is_cancelled());
        assert!(forced.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn external_cancel_ends_watch() {
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let (forced, force) = flag();

        let watcher = tokio::spawn(escalate(rx, cancel.clone(), force));
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Escalation::Idle);
        assert!(!forced.load(Ordering::SeqCst));
    }
}
