//! SSH transport using russh
//!
//! Each [`SshConnection::run`] opens a fresh session channel on the shared
//! SSH connection and starts the command. Output is then collected by three
//! short-lived tasks:
//!
//! - a channel pump that forwards SSH data messages into a stdout pipe and a
//!   stderr pipe, and delivers the interrupt signal on cancellation
//! - two readers, each draining one pipe into memory and publishing the
//!   result (text or error) on its own channel
//!
//! [`settle`] then waits for whichever comes first: cancellation, a reader
//! error, or stdout completing. Stderr is collected after stdout, so a
//! command that floods stderr while holding stdout open blocks until stdout
//! closes.

use async_trait::async_trait;
use russh::client::{Handle, Handler, Msg};
use russh::keys::key::{KeyPair, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::config::{expand_path, SshConfig};
use super::known_hosts::{HostKeyStatus, KnownHosts};
use super::{CmdResult, Connection, ConnectionError, ConnectionResult, RusshError};

/// Chunks of one output stream, as forwarded by the channel pump
type Pipe = mpsc::UnboundedReceiver<io::Result<Vec<u8>>>;
type PipeWriter = mpsc::UnboundedSender<io::Result<Vec<u8>>>;

// ============================================================================
// Host key verification
// ============================================================================

/// How server host keys are checked
#[derive(Debug, Clone)]
pub enum HostKeyVerifier {
    /// Accept any key
    Insecure,
    /// Require a matching known_hosts entry
    KnownHosts(KnownHosts),
}

impl HostKeyVerifier {
    /// Returns true when the key is acceptable for `host:port`.
    pub fn accepts(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let known = match self {
            HostKeyVerifier::Insecure => {
                warn!(host = %host, "Host key checking disabled, accepting server key");
                return true;
            }
            HostKeyVerifier::KnownHosts(known) => known,
        };

        match known.verify(host, port, key) {
            HostKeyStatus::Verified => {
                debug!(host = %host, "Host key verified against known_hosts");
                true
            }
            HostKeyStatus::Unknown => {
                warn!(host = %host, "Host not found in known_hosts, rejecting");
                false
            }
            HostKeyStatus::Mismatch => {
                warn!(
                    host = %host,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                false
            }
            HostKeyStatus::Revoked => false,
        }
    }
}

/// russh client handler that applies a [`HostKeyVerifier`]
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, verifier: HostKeyVerifier) -> Self {
        Self {
            host: host.into(),
            port,
            verifier,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .verifier
            .accepts(&self.host, self.port, server_public_key))
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// One authentication method offered to the server
#[derive(Clone)]
pub enum AuthMethod {
    /// Key supplied inline in the config
    PrivateKey(Arc<KeyPair>),
    /// Key loaded from a file
    PrivateKeyFile(Arc<KeyPair>),
    Password(String),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey(_) => "private key",
            AuthMethod::PrivateKeyFile(_) => "private key file",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds the auth methods in offer order: inline key, key file, password.
pub fn resolve_auth_methods(config: &SshConfig) -> ConnectionResult<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(key) = config.private_key.as_deref().filter(|k| !k.is_empty()) {
        let pair = russh::keys::decode_secret_key(key, None).map_err(|e| {
            ConnectionError::InvalidConfig(format!("Failed to parse private key: {}", e))
        })?;
        methods.push(AuthMethod::PrivateKey(Arc::new(pair)));
    }

    if let Some(path) = config.private_key_path.as_deref().filter(|p| !p.is_empty()) {
        let path = expand_path(path);
        let pair = russh::keys::load_secret_key(&path, None).map_err(|e| {
            ConnectionError::InvalidConfig(format!(
                "Failed to load private key {}: {}",
                path.display(),
                e
            ))
        })?;
        methods.push(AuthMethod::PrivateKeyFile(Arc::new(pair)));
    }

    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        methods.push(AuthMethod::Password(password.to_string()));
    }

    Ok(methods)
}

async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
) -> ConnectionResult<()> {
    for method in methods {
        let accepted = match method {
            AuthMethod::PrivateKey(key) | AuthMethod::PrivateKeyFile(key) => {
                session.authenticate_publickey(user, key.clone()).await?
            }
            AuthMethod::Password(password) => {
                session.authenticate_password(user, password).await?
            }
        };

        if accepted {
            debug!(user = %user, method = %method.name(), "SSH authentication succeeded");
            return Ok(());
        }
        trace!(user = %user, method = %method.name(), "SSH authentication method rejected");
    }

    Err(ConnectionError::AuthenticationFailed(format!(
        "server rejected all offered methods ({:?}) for {}",
        methods, user
    )))
}

// ============================================================================
// SSH Connection
// ============================================================================

/// Connection to a Windows host running OpenSSH
pub struct SshConnection {
    identifier: String,
    handle: RwLock<Option<Handle<ClientHandler>>>,
}

impl SshConnection {
    /// Dial and authenticate.
    ///
    /// Configuration, known_hosts and key problems are reported as
    /// [`ConnectionError::InvalidConfig`] before the TCP connection is opened.
    pub async fn connect(config: SshConfig) -> ConnectionResult<Self> {
        let resolved = config.resolve()?;

        let verifier = match &resolved.known_hosts {
            Some(path) => HostKeyVerifier::KnownHosts(KnownHosts::load(path)?),
            None => HostKeyVerifier::Insecure,
        };

        let methods = resolve_auth_methods(&config)?;

        let addr = format!("{}:{}", resolved.host, resolved.port);
        debug!(addr = %addr, user = %resolved.username, "Connecting over SSH");

        let socket =
            tokio::time::timeout(resolved.timeout, tokio::net::TcpStream::connect(&addr))
                .await
                .map_err(|_| ConnectionError::Timeout(resolved.timeout.as_secs()))?
                .map_err(|e| {
                    ConnectionError::ConnectionFailed(format!(
                        "Failed to connect to {}: {}",
                        addr, e
                    ))
                })?;

        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler::new(&resolved.host, resolved.port, verifier);
        let ssh_config = Arc::new(russh::client::Config::default());

        let mut session = russh::client::connect_stream(ssh_config, socket, handler)
            .await
            .map_err(|RusshError(e)| match e {
                russh::Error::UnknownKey => ConnectionError::HostKeyRejected(addr.clone()),
                other => {
                    ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", other))
                }
            })?;

        authenticate(&mut session, &resolved.username, &methods).await?;

        debug!(addr = %addr, "SSH connection established");
        Ok(Self {
            identifier: format!("{}@{}:{}", resolved.username, resolved.host, resolved.port),
            handle: RwLock::new(Some(session)),
        })
    }

    async fn open_channel(&self) -> ConnectionResult<Channel<Msg>> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        Ok(handle.channel_open_session().await?)
    }
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("identifier", &self.identifier)
            .finish()
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> ConnectionResult<CmdResult> {
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }

        trace!(host = %self.identifier, command = %cmd, "Executing remote command");

        let channel = self
            .open_channel()
            .await
            .map_err(|e| ConnectionError::command(cmd, e))?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ConnectionError::command(cmd, e))?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupt_rx) = oneshot::channel();

        let pump = tokio::spawn(pump_channel(channel, stdout_tx, stderr_tx, interrupt_rx));
        let streams = StreamResults::spawn(stdout_rx, stderr_rx);

        match settle(cancel, streams).await {
            Settled::Done { stdout, stderr } => {
                let exit_status = pump.await.ok().flatten();
                trace!(
                    exit_status = ?exit_status,
                    stdout_len = %stdout.len(),
                    stderr_len = %stderr.len(),
                    "Command completed"
                );
                Ok(CmdResult {
                    stdout,
                    stderr,
                    exit_code: exit_status.map(|code| code as i32),
                })
            }
            Settled::Cancelled => {
                debug!(host = %self.identifier, "Command cancelled, interrupting remote session");
                // the pump signals and exits on its own
                let _ = interrupt_tx.send(());
                Err(ConnectionError::Cancelled)
            }
            Settled::Failed(e) => {
                pump.abort();
                Err(ConnectionError::command(cmd, e))
            }
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        if let Some(handle) = self.handle.write().await.take() {
            debug!(host = %self.identifier, "Closing SSH connection");
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Output collection
// ============================================================================

/// Forwards channel data into the two pipes until the channel closes or an
/// interrupt is requested. Returns the exit status, if the server sent one.
async fn pump_channel(
    mut channel: Channel<Msg>,
    stdout: PipeWriter,
    stderr: PipeWriter,
    mut interrupt: oneshot::Receiver<()>,
) -> Option<u32> {
    let mut exit_status = None;
    let mut saw_eof = false;
    let mut interrupt_armed = true;

    loop {
        tokio::select! {
            signal = &mut interrupt, if interrupt_armed => {
                interrupt_armed = false;
                if signal.is_ok() {
                    if let Err(e) = channel.signal(Sig::INT).await {
                        debug!(error = %e, "Failed to send SIGINT to remote session");
                    }
                    return exit_status;
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    let _ = stdout.send(Ok(data.to_vec()));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    let _ = stderr.send(Ok(data.to_vec()));
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code);
                }
                Some(ChannelMsg::Eof) => saw_eof = true,
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => {
                    if !saw_eof {
                        let _ = stdout.send(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "SSH channel closed before end of output",
                        )));
                    }
                    break;
                }
            },
        }
    }

    exit_status
}

/// Reads a pipe to the end. An error chunk aborts the read.
pub(crate) async fn drain(mut pipe: Pipe) -> io::Result<String> {
    let mut buf = Vec::new();
    while let Some(chunk) = pipe.recv().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Per-stream result channels fed by the two reader tasks
pub(crate) struct StreamResults {
    stdout: oneshot::Receiver<String>,
    stderr: oneshot::Receiver<String>,
    errors: mpsc::Receiver<io::Error>,
}

impl StreamResults {
    /// Spawns one reader task per pipe.
    pub(crate) fn spawn(stdout: Pipe, stderr: Pipe) -> Self {
        let (errors_tx, errors) = mpsc::channel(2);
        let (stdout_tx, stdout_rx) = oneshot::channel();
        let (stderr_tx, stderr_rx) = oneshot::channel();

        spawn_reader(stdout, stdout_tx, errors_tx.clone());
        spawn_reader(stderr, stderr_tx, errors_tx);

        Self {
            stdout: stdout_rx,
            stderr: stderr_rx,
            errors,
        }
    }

    /// The error a reader published before dropping its result channel.
    fn reader_error(&mut self) -> io::Error {
        self.errors.try_recv().unwrap_or_else(|_| {
            io::Error::new(io::ErrorKind::Other, "output reader stopped unexpectedly")
        })
    }
}

fn spawn_reader(pipe: Pipe, done: oneshot::Sender<String>, errors: mpsc::Sender<io::Error>) {
    tokio::spawn(async move {
        match drain(pipe).await {
            Ok(text) => {
                let _ = done.send(text);
            }
            Err(e) => {
                let _ = errors.try_send(e);
            }
        }
    });
}

/// Outcome of waiting on a running command
#[derive(Debug)]
pub(crate) enum Settled {
    Done { stdout: String, stderr: String },
    Cancelled,
    Failed(io::Error),
}

/// Waits for cancellation, the first reader error, or stdout completing,
/// whichever happens first. After stdout, stderr is awaited unconditionally.
pub(crate) async fn settle(cancel: &CancellationToken, mut streams: StreamResults) -> Settled {
    let stdout = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Settled::Cancelled,
        Some(err) = streams.errors.recv() => return Settled::Failed(err),
        out = &mut streams.stdout => match out {
            Ok(text) => text,
            Err(_) => return Settled::Failed(streams.reader_error()),
        },
    };

    match (&mut streams.stderr).await {
        Ok(stderr) => Settled::Done { stdout, stderr },
        Err(_) => Settled::Failed(streams.reader_error()),
    }
}
