//! Handshake and authentication scenarios against the scripted backend.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use hermod::backend::{AuthState, BackendCommand, BackendConnection, BackendError};
use hermod::config::BackendConfig;
use hermod::monitor::MonitorEvent;
use hermod::protocol::capabilities::*;
use hermod::protocol::{password_token, scramble_response, ErrPacket, PacketCodec};
use hermod::router::{ChannelUpstream, ErrorType, ReplyEvent};
use hermod::session::{ClientSession, SessionState};

use crate::mock::{self, SCRAMBLE, WAIT};

fn session() -> ClientSession {
    ClientSession::new("maxuser")
        .with_password("secret")
        .with_database("test")
}

#[tokio::test]
async fn test_handshake_response_fields() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    let response = harness.authenticate().await;
    assert_eq!(response.sequence_id, 1);

    let payload = &response.payload;
    let caps = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    assert!(caps & CLIENT_PROTOCOL_41 != 0);
    assert!(caps & CLIENT_PLUGIN_AUTH != 0);
    assert!(caps & CLIENT_CONNECT_WITH_DB != 0, "database was specified");
    assert!(caps & CLIENT_SESSION_TRACK != 0, "server offered tracking");
    assert_eq!(caps & CLIENT_DEPRECATE_EOF, 0, "never advertised");
    assert_eq!(caps & CLIENT_COMPRESS, 0, "compression unsupported");

    // Username starts after the 32-byte fixed prefix
    assert_eq!(&payload[32..40], b"maxuser\0");

    // Scramble response computed against the greeting's scramble
    let token = password_token("secret").unwrap();
    let expected = scramble_response(&SCRAMBLE, &token);
    assert_eq!(payload[40] as usize, expected.len());
    assert_eq!(&payload[41..61], &expected);

    assert_eq!(&payload[61..66], b"test\0");
    assert_eq!(&payload[66..], b"mysql_native_password\0");
}

#[tokio::test]
async fn test_delay_queue_drains_after_auth() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    // Command arrives before the server has even greeted us
    harness
        .commands
        .send(BackendCommand::query("SELECT 1"))
        .await
        .unwrap();

    harness
        .server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let response = harness.recv_server().await;
    assert_eq!(response.sequence_id, 1);

    // Nothing but the handshake response may reach the server pre-auth
    assert!(
        timeout(Duration::from_millis(100), harness.server.next())
            .await
            .is_err(),
        "command leaked to the backend before authentication completed"
    );

    harness.server.send(mock::ok(2)).await.unwrap();

    // The delayed command arrives only now
    let query = harness.recv_server().await;
    assert_eq!(&query.payload[..], b"\x03SELECT 1");
}

#[tokio::test]
async fn test_auth_switch_during_initial_handshake_reloads_scramble() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    harness
        .server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let _response = harness.recv_server().await;

    // Re-key the same plugin with a fresh scramble
    let fresh = *b"fresh-scramble-bytes";
    harness
        .server
        .send(mock::auth_switch(2, &fresh))
        .await
        .unwrap();

    let switch_response = harness.recv_server().await;
    assert_eq!(switch_response.sequence_id, 3);
    let token = password_token("secret").unwrap();
    assert_eq!(
        &switch_response.payload[..],
        &scramble_response(&fresh, &token),
        "response must use the reloaded scramble"
    );

    harness.server.send(mock::ok(4)).await.unwrap();

    // Authentication is complete, commands flow
    harness
        .commands
        .send(BackendCommand::query("SELECT 1"))
        .await
        .unwrap();
    let query = harness.recv_server().await;
    assert_eq!(&query.payload[..], b"\x03SELECT 1");
}

#[tokio::test]
async fn test_host_blocked_flags_server_for_maintenance() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    harness
        .server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let _response = harness.recv_server().await;

    harness
        .server
        .send(mock::err(2, 1129, "HY000", "Host is blocked"))
        .await
        .unwrap();

    let mut stopped = harness.join().await;
    assert!(matches!(stopped.result, Err(BackendError::Handshake(_))));
    assert_eq!(stopped.connection.auth_state(), AuthState::FailHandshake);

    // The monitor collaborator was asked to pull the server
    let event = timeout(WAIT, stopped.monitor_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        MonitorEvent::SetMaintenance { server, .. } => assert_eq!(server, "db1"),
    }

    // The upstream saw a permanent failure with the generic 2003 packet
    match timeout(WAIT, stopped.replies.recv()).await.unwrap().unwrap() {
        ReplyEvent::Error {
            error_type,
            message,
            ..
        } => {
            assert_eq!(error_type, ErrorType::Permanent);
            let err = ErrPacket::parse(&message[4..]).unwrap();
            assert_eq!(err.error_code, 2003);
            assert!(err.error_message.contains("db1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_access_denied_fails_handshake_without_monitor_side_effects() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    harness
        .server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let _response = harness.recv_server().await;
    harness
        .server
        .send(mock::err(2, 1045, "28000", "Access denied for user"))
        .await
        .unwrap();

    let mut stopped = harness.join().await;
    assert_eq!(stopped.connection.auth_state(), AuthState::FailHandshake);
    // Only 1129 has monitor side effects
    assert!(stopped.monitor_events.try_recv().is_err());
}

#[tokio::test]
async fn test_backend_tls_is_refused() {
    let config = BackendConfig {
        name: "tls-db".to_string(),
        host: "127.0.0.1".to_string(),
        port: 3306,
        user: "maxuser".to_string(),
        password: String::new(),
        database: None,
        proxy_protocol: false,
        ssl: true,
        persistent: false,
        session_track: true,
    };

    let (upstream, _replies) = ChannelUpstream::channel();
    let session = Arc::new(ClientSession::new("maxuser"));
    let result = BackendConnection::connect(&config, session, Box::new(upstream)).await;
    assert!(matches!(result, Err(BackendError::TlsUnsupported)));
}

#[tokio::test]
async fn test_proxy_protocol_header_precedes_mysql_bytes() {
    let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
    let session = Arc::new(ClientSession::new("maxuser").with_addresses(
        "192.168.1.10:41000".parse().unwrap(),
        "10.0.0.5:3306".parse().unwrap(),
    ));
    let (upstream, _replies) = ChannelUpstream::channel();

    let mut settings = mock::settings("db1");
    settings.proxy_protocol = true;
    let connection = BackendConnection::new(client_side, settings, session, Box::new(upstream));

    let (commands, command_rx) = tokio::sync::mpsc::channel(4);
    let driver = mock::spawn_driver(connection, command_rx);

    // The very first bytes on the wire are the ASCII header line
    let expected = b"PROXY TCP4 192.168.1.10 10.0.0.5 41000 3306\r\n";
    let mut header = vec![0u8; expected.len()];
    timeout(WAIT, server_side.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&header[..], expected);

    // MySQL bytes only after the header
    let mut server = Framed::new(server_side, PacketCodec);
    server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let response = timeout(WAIT, server.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(response.sequence_id, 1);

    drop(commands);
    let _ = timeout(WAIT, driver).await.unwrap();
}

#[tokio::test]
async fn test_writes_discarded_after_auth_failure() {
    let mut harness = mock::start(session(), mock::settings("db1"));

    harness
        .server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let _response = harness.recv_server().await;
    harness
        .server
        .send(mock::err(2, 1045, "28000", "Access denied"))
        .await
        .unwrap();

    let stopped = harness.join().await;
    let mut connection = stopped.connection;

    // The failed connection swallows the write instead of queueing it
    connection.write(BackendCommand::query("SELECT 1")).unwrap();
    assert!(!connection.established());
    assert_eq!(connection.ignore_replies(), 0);
}

#[tokio::test]
async fn test_hangup_while_stopping_is_not_reported_upstream() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let session = Arc::new(session());
    let (upstream, mut replies) = ChannelUpstream::channel();
    let connection = BackendConnection::new(
        client_side,
        mock::settings("db1"),
        session.clone(),
        Box::new(upstream),
    );

    let (commands, command_rx) = tokio::sync::mpsc::channel(4);
    let driver = mock::spawn_driver(connection, command_rx);

    let mut server = Framed::new(server_side, PacketCodec);
    server
        .send(mock::greeting(&SCRAMBLE, mock::default_server_capabilities(), 7))
        .await
        .unwrap();
    let _response = timeout(WAIT, server.next()).await.unwrap().unwrap().unwrap();
    server.send(mock::ok(2)).await.unwrap();

    // The session is already shutting down when the peer hangs up
    session.set_state(SessionState::Stopping);
    drop(server);

    let (_connection, result) = timeout(WAIT, driver).await.unwrap().unwrap();
    assert!(matches!(result, Err(BackendError::Hangup)));
    assert!(
        replies.try_recv().is_err(),
        "no upstream error while the session is stopping"
    );
    drop(commands);
}
