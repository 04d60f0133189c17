//! SSH transport: accepts clients on the overlay address and turns each
//! interactive channel into a core [`Connection`].

use async_trait::async_trait;
use log::{debug, info, warn};
use remote_unlock_core::config::RemoteUnlockConfig;
use remote_unlock_core::error::{UnlockError, UnlockResult};
use remote_unlock_core::transport::{ChannelListener, Connection, Listener, PtyRequest, PtySize};
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodSet, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Bytes buffered in each direction between the SSH channel and the session.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending connections handed from SSH sessions to the accept loop.
const BACKLOG: usize = 16;

/// Key material and policy for the SSH server.
pub struct SshSettings {
    pub host_keys: Vec<KeyPair>,
    /// `None` accepts every client; the overlay network is the trust boundary.
    pub authorized_keys: Option<Vec<PublicKey>>,
    pub inactivity_timeout: Option<Duration>,
}

impl SshSettings {
    /// Load host keys and the optional `authorized_keys` file named in the config.
    pub fn from_config(config: &RemoteUnlockConfig) -> UnlockResult<Self> {
        let mut host_keys = Vec::new();
        for path in &config.server.host_keys {
            if !path.exists() {
                warn!("host key {} not found; skipping", path.display());
                continue;
            }
            let key = russh_keys::load_secret_key(path, None).map_err(|err| {
                UnlockError::InvalidConfig(format!(
                    "failed to load host key {}: {err}",
                    path.display()
                ))
            })?;
            host_keys.push(key);
        }
        if host_keys.is_empty() {
            return Err(UnlockError::InvalidConfig(
                "no usable host key among server.host_keys".into(),
            ));
        }

        let authorized_keys = config
            .server
            .authorized_keys
            .as_deref()
            .map(load_authorized_keys)
            .transpose()?;

        Ok(Self {
            host_keys,
            authorized_keys,
            inactivity_timeout: config.inactivity_timeout(),
        })
    }

    fn server_config(self) -> server::Config {
        let methods = if self.authorized_keys.is_some() {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::NONE | MethodSet::PUBLICKEY
        };
        server::Config {
            keys: self.host_keys,
            methods,
            inactivity_timeout: self.inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        }
    }
}

/// Parse an OpenSSH `authorized_keys` file. Options before the key type are
/// ignored; so are blank lines and comments.
pub fn load_authorized_keys(path: &Path) -> UnlockResult<Vec<PublicKey>> {
    let contents = fs::read_to_string(path)?;
    let mut keys = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let key = tokens
            .windows(2)
            .find(|pair| is_key_type(pair[0]))
            .and_then(|pair| russh_keys::parse_public_key_base64(pair[1]).ok())
            .ok_or_else(|| {
                UnlockError::InvalidConfig(format!(
                    "{}:{}: unrecognised public key",
                    path.display(),
                    lineno + 1
                ))
            })?;
        keys.push(key);
    }
    Ok(keys)
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

/// TCP listener speaking SSH. Dropping it stops accepting new clients;
/// sessions already running keep their own tasks.
pub struct SshListener {
    inner: ChannelListener,
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl SshListener {
    pub async fn bind(addr: SocketAddr, settings: SshSettings) -> UnlockResult<Self> {
        let authorized = Arc::new(settings.authorized_keys.clone());
        let config = Arc::new(settings.server_config());
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, inner) = ChannelListener::new(BACKLOG);

        let acceptor = tokio::spawn(accept_loop(socket, config, authorized, tx));
        info!("ssh listener bound on {local_addr}");
        Ok(Self {
            inner,
            local_addr,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SshListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl Listener for SshListener {
    async fn accept(&mut self) -> UnlockResult<Option<Connection>> {
        self.inner.accept().await
    }
}

async fn accept_loop(
    socket: TcpListener,
    config: Arc<server::Config>,
    authorized: Arc<Option<Vec<PublicKey>>>,
    tx: mpsc::Sender<UnlockResult<Connection>>,
) {
    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                let _ = tx
                    .send(Err(UnlockError::Transport(format!("accept failed: {err}"))))
                    .await;
                return;
            }
        };
        debug!("tcp connection from {peer}");

        let handler = SessionHandler {
            peer,
            authorized: Arc::clone(&authorized),
            connections: tx.clone(),
            channels: HashMap::new(),
        };
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let session = match server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(err) => {
                    debug!("ssh handshake with {peer} failed: {err}");
                    return;
                }
            };
            if let Err(err) = session.await {
                debug!("ssh session with {peer} ended: {err}");
            }
        });
    }
}

/// Per-channel state collected before the shell starts.
struct PendingChannel {
    channel: Option<Channel<Msg>>,
    pty: Option<PtySize>,
    resizes: Option<mpsc::UnboundedSender<PtySize>>,
}

/// Handles one SSH connection.
struct SessionHandler {
    peer: SocketAddr,
    authorized: Arc<Option<Vec<PublicKey>>>,
    connections: mpsc::Sender<UnlockResult<Connection>>,
    channels: HashMap<ChannelId, PendingChannel>,
}

impl SessionHandler {
    fn is_authorized(&self, key: &PublicKey) -> bool {
        match self.authorized.as_ref() {
            None => true,
            Some(keys) => {
                let fingerprint = key.fingerprint();
                keys.iter().any(|known| known.fingerprint() == fingerprint)
            }
        }
    }

    /// Turn the channel into a core connection and start pumping bytes.
    async fn start(&mut self, id: ChannelId, session: &mut Session) -> bool {
        let Some(pending) = self.channels.get_mut(&id) else {
            return false;
        };
        let Some(channel) = pending.channel.take() else {
            // A second shell/exec on the same channel.
            return false;
        };

        let pty = pending.pty.map(|size| {
            let (tx, rx) = mpsc::unbounded_channel();
            pending.resizes = Some(tx);
            PtyRequest {
                size,
                resizes: Some(rx),
            }
        });

        let (local, remote) = duplex(PIPE_CAPACITY);
        let (conn, exit) = Connection::new(self.peer.to_string(), pty, local);
        if self.connections.send(Ok(conn)).await.is_err() {
            info!("refusing session from {}: server is closed", self.peer);
            return false;
        }

        tokio::spawn(pump(channel, session.handle(), remote, exit));
        true
    }
}

#[async_trait]
impl server::Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.authorized.is_none() {
            info!("{user}@{} authenticated (no key required)", self.peer);
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PUBLICKEY),
        })
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.is_authorized(key) {
            info!("{user}@{} authenticated with {}", self.peer, key.fingerprint());
            return Ok(Auth::Accept);
        }
        warn!("rejected key {} for {user}@{}", key.fingerprint(), self.peer);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            PendingChannel {
                channel: Some(channel),
                pty: None,
                resizes: None,
            },
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(pending) => {
                debug!("{} requested a {term} pty {col_width}x{row_height}", self.peer);
                pending.pty = Some(PtySize {
                    width: col_width,
                    height: row_height,
                });
                let _ = session.channel_success(channel);
            }
            None => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.start(channel, session).await {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    /// Commands are ignored: every session runs the unlock prompt.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shell_request(channel, session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("refusing subsystem {name} for {}", self.peer);
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .channels
            .get(&channel)
            .and_then(|pending| pending.resizes.as_ref())
        {
            let _ = tx.send(PtySize {
                width: col_width,
                height: row_height,
            });
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Shuttle bytes between the SSH channel and the session's stream, then send
/// the exit status and close the channel.
async fn pump(
    mut channel: Channel<Msg>,
    handle: Handle,
    mut remote: DuplexStream,
    exit: oneshot::Receiver<u32>,
) {
    let id = channel.id();
    let mut buf = vec![0u8; 4096];
    let mut client_open = true;

    loop {
        tokio::select! {
            read = remote.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if handle.data(id, CryptoVec::from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            },
            msg = channel.wait(), if client_open => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if remote.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | None => {
                    client_open = false;
                    let _ = remote.shutdown().await;
                }
                Some(_) => {}
            },
        }
    }
    drop(remote);

    let code = exit.await.unwrap_or(1);
    debug!("channel {id:?} finished with status {code}");
    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}
