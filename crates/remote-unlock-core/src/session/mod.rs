//! Interactive unlock session: the prompt/retry protocol run per connection.

mod terminal;


pub use terminal::{truncate, Terminal, GREEN, MAX_LINE, RED, RESET};

use crate::completion::CompletionSignal;
use crate::error::{UnlockError, UnlockResult};
use crate::provider::{count_locked, VolumeProvider, VolumeSet};
use crate::unlock::apply_password;
use log::{info, warn};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

pub const BANNER: &str = "🔑 Welcome to remote-unlock!\n";

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No locked volumes remained; the completion signal was raised.
    Completed,
    /// The client hung up or interrupted the prompt.
    Aborted,
    /// Volume status could not be read, so the session could not continue.
    Failed,
}

impl SessionEnd {
    /// Exit status reported back to the client.
    pub fn exit_code(self) -> u32 {
        match self {
            SessionEnd::Completed | SessionEnd::Aborted => 0,
            SessionEnd::Failed => 1,
        }
    }
}

/// Why the session goes back to the password prompt.
enum Retry {
    Empty,
    NotUtf8,
    WrongPassword,
    Failed(UnlockError),
}

enum State {
    Rendering,
    Prompting,
    Unlocking(Zeroizing<String>),
    Retrying(Retry),
    Done(SessionEnd),
}

/// One connection's walk through render → prompt → unlock.
pub struct UnlockSession<P: ?Sized, S> {
    provider: Arc<P>,
    completion: Arc<CompletionSignal>,
    term: Terminal<S>,
    peer: String,
}

impl<P, S> UnlockSession<P, S>
where
    P: VolumeProvider + ?Sized + 'static,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        provider: Arc<P>,
        completion: Arc<CompletionSignal>,
        term: Terminal<S>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            completion,
            term,
            peer: peer.into(),
        }
    }

    /// Drive the session until it completes or the client goes away.
    ///
    /// Only transport failures are returned as errors; provider failures are
    /// shown to the client and handled inside the state machine.
    pub async fn run(mut self) -> io::Result<SessionEnd> {
        self.term.write_str(BANNER).await?;

        let mut state = State::Rendering;
        loop {
            state = match state {
                State::Rendering => self.render().await?,
                State::Prompting => self.prompt().await?,
                State::Unlocking(password) => self.unlock(password).await?,
                State::Retrying(reason) => self.retry(reason).await?,
                State::Done(end) => {
                    info!("session from {} ended: {:?}", self.peer, end);
                    return Ok(end);
                }
            };
        }
    }

    async fn render(&mut self) -> io::Result<State> {
        let volumes = match self.list_volumes().await {
            Ok(volumes) => volumes,
            Err(err) => {
                warn!("listing volumes for {} failed: {}", self.peer, err);
                self.term
                    .write_str(&format!("Error getting encrypted volumes: {err}\n"))
                    .await?;
                return Ok(State::Done(SessionEnd::Failed));
            }
        };

        if count_locked(&volumes) == 0 {
            // The client hears about it before the boot is resumed.
            let written = self
                .term
                .write_str(&format!("{GREEN}\n✓ All volumes are unlocked.{RESET}\n"))
                .await;
            if self.completion.fire() {
                info!("all volumes unlocked (observed by {})", self.peer);
            }
            written?;
            return Ok(State::Done(SessionEnd::Completed));
        }

        let block = status_block(&volumes, self.term.size().width as usize);
        self.term.write_str(&block).await?;
        Ok(State::Prompting)
    }

    async fn prompt(&mut self) -> io::Result<State> {
        let Some(mut bytes) = self.term.read_password("Password: ").await? else {
            return Ok(State::Done(SessionEnd::Aborted));
        };
        if bytes.is_empty() {
            return Ok(State::Retrying(Retry::Empty));
        }
        match String::from_utf8(std::mem::take(&mut *bytes)) {
            Ok(text) => Ok(State::Unlocking(Zeroizing::new(text))),
            Err(err) => {
                // Re-wrap so the rejected bytes are wiped on drop.
                drop(Zeroizing::new(err.into_bytes()));
                Ok(State::Retrying(Retry::NotUtf8))
            }
        }
    }

    async fn unlock(&mut self, password: Zeroizing<String>) -> io::Result<State> {
        let provider = Arc::clone(&self.provider);
        let outcome = tokio::task::spawn_blocking(move || apply_password(&*provider, &password))
            .await
            .map_err(UnlockError::from)
            .and_then(|result| result);

        match outcome {
            Ok(0) => Ok(State::Retrying(Retry::WrongPassword)),
            Ok(count) => {
                info!("{} unlocked {} volume(s)", self.peer, count);
                let noun = if count == 1 { "volume" } else { "volumes" };
                self.term
                    .write_str(&format!("{GREEN}Unlocked {count} {noun}.{RESET}\n"))
                    .await?;
                Ok(State::Rendering)
            }
            Err(err) => {
                warn!("unlock attempt from {} failed: {}", self.peer, err);
                Ok(State::Retrying(Retry::Failed(err)))
            }
        }
    }

    async fn retry(&mut self, reason: Retry) -> io::Result<State> {
        let message = match reason {
            Retry::Empty => "Invalid password: nothing was entered.".to_string(),
            Retry::NotUtf8 => "Invalid password: input is not valid UTF-8.".to_string(),
            Retry::WrongPassword => "Invalid password. Please try again.".to_string(),
            Retry::Failed(err) => format!("Error: {err}"),
        };
        self.term
            .write_str(&format!("{RED}{message}{RESET}\n"))
            .await?;
        Ok(State::Prompting)
    }

    async fn list_volumes(&mut self) -> UnlockResult<VolumeSet> {
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || provider.list_volumes()).await?
    }
}

/// Blank-line-delimited status list, one coloured marker and name per volume.
///
/// A width of 0 means the client did not report one; names are then printed
/// in full.
fn status_block(volumes: &VolumeSet, width: usize) -> String {
    // "⬤  " plus a little margin.
    let name_width = match width {
        0 => usize::MAX,
        w => w.saturating_sub(4).max(8),
    };
    let mut out = String::from("\n");
    for (name, state) in volumes {
        let colour = if state.is_locked() { RED } else { GREEN };
        out.push_str(&format!(
            "{colour}⬤ {RESET} {}\n",
            truncate(name, name_width)
        ));
    }
    out.push('\n');
    out
}
