//! Reply-tracking scenarios: result sets, multi-statement replies, errors,
//! result collection and 16 MiB row continuations.

use std::time::Duration;

use bytes::BytesMut;
use futures::SinkExt;
use tokio::time::timeout;

use hermod::backend::BackendCommand;
use hermod::protocol::packet::{Command, MAX_PAYLOAD_SIZE, SERVER_MORE_RESULTS_EXIST};
use hermod::protocol::Packet;
use hermod::router::ReplyEvent;
use hermod::session::ClientSession;

use crate::mock;

fn session() -> ClientSession {
    ClientSession::new("maxuser").with_password("secret")
}

#[tokio::test]
async fn test_simple_select_round_trip() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SELECT 1"))
        .await
        .unwrap();
    let query = harness.recv_server().await;
    assert_eq!(&query.payload[..], b"\x03SELECT 1");

    harness.server.send(mock::column_count(1, 1)).await.unwrap();
    harness.server.send(mock::coldef(2)).await.unwrap();
    harness.server.send(mock::eof(3, 2)).await.unwrap();
    harness.server.send(mock::row(4, b"1")).await.unwrap();
    harness.server.send(mock::eof(5, 2)).await.unwrap();

    let (events, reply) = harness.drain_until_complete().await;
    assert_eq!(events, 5, "every packet of the reply is forwarded");
    assert_eq!(reply.command(), Command::Query);
    assert_eq!(reply.field_count(), 1);
    assert_eq!(reply.rows(), 1);
    assert!(reply.error().is_none());
}

#[tokio::test]
async fn test_multi_statement_reply() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SELECT 1; SELECT 2"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;

    for round in 0..2u16 {
        harness.server.send(mock::column_count(1, 1)).await.unwrap();
        harness.server.send(mock::coldef(2)).await.unwrap();
        harness.server.send(mock::eof(3, 2)).await.unwrap();
        harness.server.send(mock::row(4, b"1")).await.unwrap();
        let status = if round == 0 {
            SERVER_MORE_RESULTS_EXIST
        } else {
            2
        };
        harness.server.send(mock::eof(5, status)).await.unwrap();
    }

    let (_events, reply) = harness.drain_until_complete().await;
    assert_eq!(reply.rows(), 2);
    assert_eq!(reply.field_count(), 2);
}

#[tokio::test]
async fn test_error_reply_is_forwarded_and_connection_survives() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SELECT bogus"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;
    harness
        .server
        .send(mock::err(1, 1054, "42S22", "Unknown column 'bogus'"))
        .await
        .unwrap();

    match harness.next_reply().await {
        ReplyEvent::Data { buffer, reply, .. } => {
            assert!(reply.is_complete());
            let error = reply.error().unwrap();
            assert_eq!(error.code, 1054);
            assert_eq!(error.sql_state, "42S22");
            // The ERR packet itself is forwarded as-is
            assert_eq!(buffer[4], 0xff);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The connection is still usable afterwards
    harness
        .commands
        .send(BackendCommand::query("SELECT 1"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;
    harness.server.send(mock::ok(1)).await.unwrap();
    let (_events, reply) = harness.drain_until_complete().await;
    assert!(reply.is_ok());
}

#[tokio::test]
async fn test_collect_result_forwards_one_buffer() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SELECT 1").collect_result())
        .await
        .unwrap();
    let _query = harness.recv_server().await;

    let packets = [
        mock::column_count(1, 1),
        mock::coldef(2),
        mock::eof(3, 2),
        mock::row(4, b"1"),
        mock::eof(5, 2),
    ];
    let mut expected = BytesMut::new();
    for packet in &packets {
        packet.encode(&mut expected);
        harness.server.send(packet.clone()).await.unwrap();
    }

    // One event carrying the whole result
    match harness.next_reply().await {
        ReplyEvent::Data { buffer, reply, .. } => {
            assert!(reply.is_complete());
            assert_eq!(reply.rows(), 1);
            assert_eq!(&buffer[..], &expected[..]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_sixteen_mib_row_is_one_logical_row() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SELECT blob FROM t"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;

    harness.server.send(mock::column_count(1, 1)).await.unwrap();
    harness.server.send(mock::coldef(2)).await.unwrap();
    harness.server.send(mock::eof(3, 2)).await.unwrap();

    // A row of exactly 2^24-1 payload bytes, continued in a 500-byte packet
    // whose first byte would otherwise classify as EOF
    let send_big = async {
        harness
            .server
            .send(Packet::new(4, vec![0x61; MAX_PAYLOAD_SIZE]))
            .await
            .unwrap();
        let mut tail = vec![0xfe];
        tail.extend_from_slice(&[0x62; 499]);
        harness.server.send(Packet::new(5, tail)).await.unwrap();
        harness.server.send(mock::eof(6, 2)).await.unwrap();
    };
    send_big.await;

    let (_events, reply) = harness.drain_until_complete().await;
    assert_eq!(reply.rows(), 1, "continuation must not count as a row");
    assert!(reply.error().is_none());
}

#[tokio::test]
async fn test_reply_dropped_when_session_not_routable() {
    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness.session.set_routable(false);
    harness
        .commands
        .send(BackendCommand::query("SELECT 1"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;
    harness.server.send(mock::ok(1)).await.unwrap();

    // The reply is consumed but never surfaces upstream
    assert!(
        timeout(Duration::from_millis(100), harness.replies.recv())
            .await
            .is_err()
    );

    // Tracking stayed consistent, the next command works once routable again
    harness.session.set_routable(true);
    harness
        .commands
        .send(BackendCommand::query("SELECT 2"))
        .await
        .unwrap();
    let _query = harness.recv_server().await;
    harness.server.send(mock::ok(1)).await.unwrap();
    let (_events, reply) = harness.drain_until_complete().await;
    assert!(reply.is_ok());
}

#[tokio::test]
async fn test_session_track_variables_reach_the_reply() {
    use hermod::protocol::encoding::{put_lenenc_int, put_lenenc_str};
    use hermod::protocol::packet::SERVER_SESSION_STATE_CHANGED;

    let mut harness = mock::start(session(), mock::settings("db1"));
    harness.authenticate().await;

    harness
        .commands
        .send(BackendCommand::query("SET SESSION autocommit=0").track_state())
        .await
        .unwrap();
    let _query = harness.recv_server().await;

    // OK packet carrying a tracked system variable
    let mut entry = BytesMut::new();
    put_lenenc_str(&mut entry, b"autocommit");
    put_lenenc_str(&mut entry, b"OFF");

    let mut state_info = BytesMut::new();
    state_info.extend_from_slice(&[0x00]);
    put_lenenc_int(&mut state_info, entry.len() as u64);
    state_info.extend_from_slice(&entry);

    let mut payload = BytesMut::new();
    payload.extend_from_slice(&[0x00, 0x00, 0x00]);
    payload.extend_from_slice(&SERVER_SESSION_STATE_CHANGED.to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00]);
    put_lenenc_str(&mut payload, b"");
    put_lenenc_int(&mut payload, state_info.len() as u64);
    payload.extend_from_slice(&state_info);

    harness
        .server
        .send(Packet::new(1, payload.freeze()))
        .await
        .unwrap();

    let (_events, reply) = harness.drain_until_complete().await;
    assert_eq!(reply.variable("autocommit"), Some("OFF"));
}
