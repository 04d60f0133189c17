pub mod completion;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod provider;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod unlock;

pub use completion::CompletionSignal;
pub use config::{BootCfg, RemoteUnlockConfig, ServerCfg, ZfsCfg};
pub use error::{UnlockError, UnlockResult};
pub use provider::{count_locked, AttemptOutcome, LockState, VolumeProvider, VolumeSet};
pub use server::SessionServer;
pub use session::{SessionEnd, UnlockSession};
pub use transport::{ChannelListener, Connection, Listener, PtyRequest, PtySize};
pub use unlock::apply_password;
