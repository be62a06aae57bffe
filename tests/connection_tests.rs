//! Transport selection and connection setup tests
//!
//! None of these need a Windows host: they cover validation that must fail
//! before network I/O, dial failures against local sockets, and the
//! transport-independent `Connection` surface through the mock.

mod common;

use std::io::Write;
use std::time::Duration;

use common::MockConnection;
use pretty_assertions::assert_eq;
use psremote::connection::{
    CmdResult, Config, Connection, ConnectionError, SshConfig, SshConnection, Transport,
    WinRmConfig,
};
use psremote::powershell;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ============================================================================
// Transport selection
// ============================================================================

#[tokio::test]
async fn test_transport_requires_exactly_one_config() {
    let neither = Transport::connect(Config::default()).await.unwrap_err();
    assert!(matches!(neither, ConnectionError::InvalidConfig(_)));

    let both = Transport::connect(Config {
        winrm: Some(WinRmConfig::new("win01", "admin", "pw")),
        ssh: Some(SshConfig::new("win01", "admin").with_password("pw")),
    })
    .await
    .unwrap_err();
    assert!(matches!(both, ConnectionError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_winrm_transport_builds_without_io() {
    // nothing listens here; construction must still succeed
    let port = closed_port().await;
    let conn = Transport::connect(Config::winrm(
        WinRmConfig::new("127.0.0.1", "admin", "pw").with_port(port),
    ))
    .await
    .unwrap();

    assert_eq!(conn.kind(), "winrm");
    assert_eq!(conn.identifier(), format!("admin@127.0.0.1:{}", port));
}

#[tokio::test]
async fn test_winrm_unreachable_host_fails_on_run() {
    let port = closed_port().await;
    let conn = Transport::connect(Config::winrm(
        WinRmConfig::new("127.0.0.1", "admin", "pw").with_port(port),
    ))
    .await
    .unwrap();

    let err = conn
        .run(&CancellationToken::new(), "hostname")
        .await
        .unwrap_err();
    assert_eq!(err.failed_command(), Some("hostname"));
    assert!(matches!(err.root(), ConnectionError::Http(_)));
}

// ============================================================================
// SSH setup
// ============================================================================

#[tokio::test]
async fn test_ssh_missing_fields_fail_before_dialing() {
    let port = closed_port().await;

    for config in [
        SshConfig::new("", "admin").with_password("pw"),
        SshConfig::new("127.0.0.1", "").with_password("pw"),
        SshConfig::new("127.0.0.1", "admin"),
    ] {
        let err = SshConnection::connect(config.with_port(port).with_insecure(true))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidConfig(_)), "{err}");
    }
}

#[tokio::test]
async fn test_ssh_missing_known_hosts_fails_before_dialing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("known_hosts");

    let err = SshConnection::connect(
        SshConfig::new("127.0.0.1", "admin")
            .with_port(closed_port().await)
            .with_password("pw")
            .with_known_hosts(missing.to_string_lossy()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidConfig(_)), "{err}");
}

#[tokio::test]
async fn test_ssh_connection_refused() {
    let port = closed_port().await;
    let err = SshConnection::connect(
        SshConfig::new("127.0.0.1", "admin")
            .with_port(port)
            .with_password("pw")
            .with_insecure(true),
    )
    .await
    .unwrap_err();

    match err {
        ConnectionError::ConnectionFailed(message) => {
            assert!(message.contains(&format!("127.0.0.1:{}", port)), "{message}");
        }
        other => panic!("expected a connection failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ssh_handshake_with_non_ssh_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
        }
    });

    let mut known_hosts = NamedTempFile::new().unwrap();
    writeln!(known_hosts, "# no entries").unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        SshConnection::connect(
            SshConfig::new("127.0.0.1", "admin")
                .with_port(port)
                .with_password("pw")
                .with_known_hosts(known_hosts.path().to_string_lossy()),
        ),
    )
    .await
    .expect("handshake should fail promptly");

    assert!(matches!(result, Err(ConnectionError::ConnectionFailed(_))));
}

// ============================================================================
// Connection surface
// ============================================================================

#[tokio::test]
async fn test_run_with_powershell_sends_encoded_line() {
    let mock = MockConnection::new("admin@win01:22");
    mock.set_script_result("hostname", CmdResult::new("WIN01\r\n", "").with_exit_code(0));

    let cancel = CancellationToken::new();
    let result = mock.run_with_powershell(&cancel, "hostname").await.unwrap();

    assert_eq!(result.stdout, "WIN01\r\n");
    assert_eq!(result.exit_code, Some(0));

    let commands = mock.get_commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("powershell.exe -NoProfile -EncodedCommand "));
    assert_eq!(commands[0], powershell::encode_command("hostname"));
}

#[tokio::test]
async fn test_connection_as_trait_object() {
    let mock = MockConnection::new("admin@win01:5985");
    mock.set_command_result("whoami", CmdResult::new("win01\\admin", ""));

    let conn: Box<dyn Connection> = Box::new(mock);
    let cancel = CancellationToken::new();

    let result = conn.run(&cancel, "whoami").await.unwrap();
    assert_eq!(result.stdout, "win01\\admin");
    assert!(!result.has_stderr());

    conn.close().await.unwrap();
    let err = conn.run(&cancel, "whoami").await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionClosed));
}
