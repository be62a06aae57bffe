//! SSH transport tests against an in-process russh server
//!
//! The server understands a handful of exec commands:
//!
//! - `echo`: writes `out` to stdout and `err` to stderr, exits 3
//! - `big`: writes 256 KiB to each stream in interleaved chunks, exits 0
//! - `hang`: produces nothing until it receives a signal
//!
//! Anything else exits 127 with a "not recognized" message on stderr.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use psremote::connection::{Connection, ConnectionError, SshConfig, SshConnection};
use psremote::powershell;
use russh::keys::key::KeyPair;
use russh::keys::PublicKeyBase64;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Sig};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const USER: &str = "admin";
const PASSWORD: &str = "Passw0rd!";
const BIG_LEN: usize = 256 * 1024;

// ============================================================================
// Test server
// ============================================================================

/// What the server saw, shared across connections
#[derive(Clone, Default)]
struct Recorder {
    commands: Arc<Mutex<Vec<String>>>,
    signals: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn signals(&self) -> Vec<String> {
        self.signals.lock().unwrap().clone()
    }
}

struct ExecHandler {
    recorder: Recorder,
}

#[async_trait]
impl server::Handler for ExecHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.recorder.commands.lock().unwrap().push(command.clone());
        session.channel_success(channel);

        let handle = session.handle();
        tokio::spawn(async move { respond(handle, channel, &command).await });
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.recorder
            .signals
            .lock()
            .unwrap()
            .push(format!("{:?}", signal));
        session.exit_status_request(channel, 130);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }
}

async fn finish(handle: &server::Handle, channel: ChannelId, exit_status: u32) {
    let _ = handle.exit_status_request(channel, exit_status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn respond(handle: server::Handle, channel: ChannelId, command: &str) {
    match command {
        "echo" => {
            let _ = handle.data(channel, CryptoVec::from_slice(b"out")).await;
            let _ = handle
                .extended_data(channel, 1, CryptoVec::from_slice(b"err"))
                .await;
            finish(&handle, channel, 3).await;
        }
        "big" => {
            let chunk = [b'x'; 16 * 1024];
            for _ in 0..BIG_LEN / chunk.len() {
                let _ = handle.data(channel, CryptoVec::from_slice(&chunk)).await;
                let _ = handle
                    .extended_data(channel, 1, CryptoVec::from_slice(&chunk))
                    .await;
            }
            finish(&handle, channel, 0).await;
        }
        "hang" => {}
        _ => {
            let message = b"The term is not recognized as a cmdlet\r\n";
            let _ = handle
                .extended_data(channel, 1, CryptoVec::from_slice(message))
                .await;
            finish(&handle, channel, 127).await;
        }
    }
}

struct TestServer {
    port: u16,
    host_key: KeyPair,
    recorder: Recorder,
}

impl TestServer {
    async fn start() -> Self {
        let host_key = KeyPair::generate_ed25519().unwrap();
        let config = Arc::new(server::Config {
            keys: vec![host_key.clone()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorder = Recorder::default();

        let shared = recorder.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = ExecHandler {
                    recorder: shared.clone(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self {
            port,
            host_key,
            recorder,
        }
    }

    fn config(&self) -> SshConfig {
        SshConfig::new("127.0.0.1", USER)
            .with_port(self.port)
            .with_password(PASSWORD)
    }

    async fn connect(&self) -> SshConnection {
        SshConnection::connect(self.config().with_insecure(true))
            .await
            .unwrap()
    }

    /// A known_hosts line for this server carrying `key`
    fn known_hosts_line(&self, key: &KeyPair) -> String {
        let public = key.clone_public_key().unwrap();
        format!(
            "[127.0.0.1]:{} {} {}",
            self.port,
            public.name(),
            public.public_key_base64()
        )
    }
}

fn known_hosts_file(line: &str) -> NamedTempFile {
    use std::io::Write;

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", line).unwrap();
    file
}

async fn wait_for_signal(recorder: &Recorder) -> Vec<String> {
    for _ in 0..100 {
        let signals = recorder.signals();
        if !signals.is_empty() {
            return signals;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    recorder.signals()
}

// ============================================================================
// Running commands
// ============================================================================

#[tokio::test]
async fn test_run_collects_streams_and_exit_status() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    let result = conn.run(&CancellationToken::new(), "echo").await.unwrap();
    assert_eq!(result.stdout, "out");
    assert_eq!(result.stderr, "err");
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(conn.identifier(), format!("admin@127.0.0.1:{}", server.port));

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_large_output_on_both_streams() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        conn.run(&CancellationToken::new(), "big"),
    )
    .await
    .expect("large output should not stall")
    .unwrap();

    assert_eq!(result.stdout.len(), BIG_LEN);
    assert_eq!(result.stderr.len(), BIG_LEN);
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_run_with_powershell_sends_encoded_command() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    let result = conn
        .run_with_powershell(&CancellationToken::new(), "Get-Date")
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(127));
    assert!(result.has_stderr());

    assert_eq!(server.recorder.commands(), vec![powershell::encode_command("Get-Date")]);
}

#[tokio::test]
async fn test_sequential_runs_share_the_connection() {
    let server = TestServer::start().await;
    let conn = server.connect().await;
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let result = conn.run(&cancel, "echo").await.unwrap();
        assert_eq!(result.stdout, "out");
    }
    assert_eq!(server.recorder.commands().len(), 3);
}

// ============================================================================
// Cancellation and close
// ============================================================================

#[tokio::test]
async fn test_cancel_interrupts_remote_command() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(10), conn.run(&cancel, "hang"))
        .await
        .expect("cancellation should end the run");
    assert!(matches!(outcome, Err(ConnectionError::Cancelled)));

    assert_eq!(wait_for_signal(&server.recorder).await, vec!["INT".to_string()]);

    // the connection stays usable after a cancelled command
    let result = conn.run(&CancellationToken::new(), "echo").await.unwrap();
    assert_eq!(result.stdout, "out");
    assert_eq!(result.exit_code, Some(3));
}

#[tokio::test]
async fn test_cancelled_token_sends_nothing() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = conn.run(&cancel, "echo").await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(server.recorder.commands().is_empty());
}

#[tokio::test]
async fn test_run_after_close() {
    let server = TestServer::start().await;
    let conn = server.connect().await;

    conn.close().await.unwrap();
    // closing twice is harmless
    conn.close().await.unwrap();

    let err = conn
        .run(&CancellationToken::new(), "echo")
        .await
        .unwrap_err();
    assert_eq!(err.failed_command(), Some("echo"));
    assert!(matches!(err.root(), ConnectionError::ConnectionClosed));
}

// ============================================================================
// Authentication and host keys
// ============================================================================

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let server = TestServer::start().await;
    let err = SshConnection::connect(
        SshConfig::new("127.0.0.1", USER)
            .with_port(server.port)
            .with_password("wrong")
            .with_insecure(true),
    )
    .await
    .unwrap_err();

    match err {
        ConnectionError::AuthenticationFailed(message) => {
            assert!(message.contains(USER), "{message}");
        }
        other => panic!("expected an authentication failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_known_hosts_accepts_server_key() {
    let server = TestServer::start().await;
    let known_hosts = known_hosts_file(&server.known_hosts_line(&server.host_key));

    let conn = SshConnection::connect(
        server
            .config()
            .with_known_hosts(known_hosts.path().to_string_lossy()),
    )
    .await
    .unwrap();

    let result = conn.run(&CancellationToken::new(), "echo").await.unwrap();
    assert_eq!(result.exit_code, Some(3));
}

#[tokio::test]
async fn test_known_hosts_rejects_changed_key() {
    let server = TestServer::start().await;
    let other = KeyPair::generate_ed25519().unwrap();
    let known_hosts = known_hosts_file(&server.known_hosts_line(&other));

    let err = SshConnection::connect(
        server
            .config()
            .with_known_hosts(known_hosts.path().to_string_lossy()),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectionError::HostKeyRejected(_)), "{err}");
    assert!(server.recorder.commands().is_empty());
}
