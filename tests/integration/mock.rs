//! Scripted in-process backend server speaking the server side of MySQL
//! protocol 10 over an in-memory duplex stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use hermod::backend::{BackendCommand, BackendConnection, BackendError, BackendSettings};
use hermod::monitor::{self, MonitorEvent};
use hermod::protocol::{capabilities::*, ErrPacket, Packet, PacketCodec};
use hermod::router::{ChannelUpstream, ReplyEvent};
use hermod::session::ClientSession;

/// Scramble carried in the mock greeting
pub const SCRAMBLE: [u8; 20] = *b"abcdefghij0123456789";

pub const WAIT: Duration = Duration::from_secs(5);

pub fn default_server_capabilities() -> u32 {
    DEFAULT_BACKEND_CAPABILITIES | CLIENT_SESSION_TRACK | CLIENT_MULTI_STATEMENTS
}

pub fn settings(name: &str) -> BackendSettings {
    BackendSettings {
        server_name: name.to_string(),
        proxy_protocol: false,
        persistent: false,
        session_track: true,
    }
}

pub fn greeting(scramble: &[u8; 20], caps: u32, thread_id: u32) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(10);
    buf.extend_from_slice(b"10.5.9-MariaDB-mock\0");
    buf.put_u32_le(thread_id);
    buf.extend_from_slice(&scramble[..8]);
    buf.put_u8(0);
    buf.put_u16_le((caps & 0xFFFF) as u16);
    buf.put_u8(0x21);
    buf.put_u16_le(0x0002);
    buf.put_u16_le((caps >> 16) as u16);
    buf.put_u8(21); // scramble length including the NUL
    buf.extend_from_slice(&[0u8; 10]);
    buf.extend_from_slice(&scramble[8..]);
    buf.put_u8(0);
    buf.extend_from_slice(b"mysql_native_password\0");
    Packet::new(0, buf.freeze())
}

pub fn ok(seq: u8) -> Packet {
    ok_status(seq, 0x0002, 0)
}

pub fn ok_status(seq: u8, status: u16, warnings: u16) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    buf.put_u8(0x00); // affected rows
    buf.put_u8(0x00); // last insert id
    buf.put_u16_le(status);
    buf.put_u16_le(warnings);
    Packet::new(seq, buf.freeze())
}

pub fn eof(seq: u8, status: u16) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0xfe);
    buf.put_u16_le(0); // warnings
    buf.put_u16_le(status);
    Packet::new(seq, buf.freeze())
}

pub fn err(seq: u8, code: u16, sql_state: &str, message: &str) -> Packet {
    ErrPacket::new(code, sql_state, message).encode(seq)
}

pub fn auth_switch(seq: u8, scramble: &[u8; 20]) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0xfe);
    buf.extend_from_slice(b"mysql_native_password\0");
    buf.extend_from_slice(scramble);
    buf.put_u8(0);
    Packet::new(seq, buf.freeze())
}

pub fn column_count(seq: u8, count: u8) -> Packet {
    Packet::new(seq, vec![count])
}

pub fn coldef(seq: u8) -> Packet {
    Packet::new(seq, Bytes::from_static(b"\x03def"))
}

pub fn row(seq: u8, value: &[u8]) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(value.len() as u8);
    buf.extend_from_slice(value);
    Packet::new(seq, buf.freeze())
}

/// The prepare-OK header: statement id, column count, parameter count
pub fn prepare_ok(seq: u8, stmt_id: u32, columns: u16, params: u16) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    buf.put_u32_le(stmt_id);
    buf.put_u16_le(columns);
    buf.put_u16_le(params);
    buf.put_u8(0);
    buf.put_u16_le(0);
    Packet::new(seq, buf.freeze())
}

/// A running backend connection wired to a scripted server
pub struct Harness {
    pub server: Framed<DuplexStream, PacketCodec>,
    pub commands: mpsc::Sender<BackendCommand>,
    pub replies: mpsc::UnboundedReceiver<ReplyEvent>,
    pub monitor_events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub session: Arc<ClientSession>,
    driver: JoinHandle<(BackendConnection<DuplexStream>, Result<(), BackendError>)>,
}

/// A harness whose driver loop has exited
pub struct Stopped {
    pub connection: BackendConnection<DuplexStream>,
    pub result: Result<(), BackendError>,
    pub server: Framed<DuplexStream, PacketCodec>,
    pub replies: mpsc::UnboundedReceiver<ReplyEvent>,
    pub monitor_events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub session: Arc<ClientSession>,
}

pub fn start(session: ClientSession, settings: BackendSettings) -> Harness {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let session = Arc::new(session);
    let (upstream, replies) = ChannelUpstream::channel();
    let (monitor, monitor_events) = monitor::channel();

    let connection = BackendConnection::new(
        client_side,
        settings,
        session.clone(),
        Box::new(upstream),
    )
    .with_monitor(monitor);

    let (commands, command_rx) = mpsc::channel(16);
    let driver = spawn_driver(connection, command_rx);

    Harness {
        server: Framed::new(server_side, PacketCodec),
        commands,
        replies,
        monitor_events,
        session,
        driver,
    }
}

pub fn spawn_driver(
    connection: BackendConnection<DuplexStream>,
    mut command_rx: mpsc::Receiver<BackendCommand>,
) -> JoinHandle<(BackendConnection<DuplexStream>, Result<(), BackendError>)> {
    tokio::spawn(async move {
        let mut connection = connection;
        let result = connection.run(&mut command_rx).await;
        (connection, result)
    })
}

impl Harness {
    /// Serve the greeting, consume the handshake response and accept it.
    /// Returns the response packet the proxy sent.
    pub async fn authenticate(&mut self) -> Packet {
        self.server
            .send(greeting(&SCRAMBLE, default_server_capabilities(), 99))
            .await
            .unwrap();
        let response = self.recv_server().await;
        self.server.send(ok(2)).await.unwrap();
        response
    }

    /// Next packet the proxy wrote to the backend
    pub async fn recv_server(&mut self) -> Packet {
        timeout(WAIT, self.server.next())
            .await
            .expect("timed out waiting for a packet from the proxy")
            .expect("proxy closed the connection")
            .expect("codec error")
    }

    /// Next event the upstream received
    pub async fn next_reply(&mut self) -> ReplyEvent {
        timeout(WAIT, self.replies.recv())
            .await
            .expect("timed out waiting for an upstream event")
            .expect("upstream channel closed")
    }

    /// Drain upstream data events until the reply completes, returning the
    /// completing event count and the final reply
    pub async fn drain_until_complete(&mut self) -> (usize, hermod::backend::Reply) {
        let mut count = 0;
        loop {
            match self.next_reply().await {
                ReplyEvent::Data { reply, .. } => {
                    count += 1;
                    if reply.is_complete() {
                        return (count, reply);
                    }
                }
                ReplyEvent::Error { .. } => panic!("unexpected upstream error"),
            }
        }
    }

    /// Drop the command channel and wait for the driver to exit
    pub async fn stop(self) -> Stopped {
        let Harness {
            server,
            commands,
            replies,
            monitor_events,
            session,
            driver,
        } = self;
        drop(commands);
        let (connection, result) = timeout(WAIT, driver)
            .await
            .expect("driver did not stop")
            .expect("driver panicked");
        Stopped {
            connection,
            result,
            server,
            replies,
            monitor_events,
            session,
        }
    }

    /// Wait for the driver to exit on its own (after a failure)
    pub async fn join(self) -> Stopped {
        let Harness {
            server,
            commands: _commands,
            replies,
            monitor_events,
            session,
            driver,
        } = self;
        let (connection, result) = timeout(WAIT, driver)
            .await
            .expect("driver did not exit")
            .expect("driver panicked");
        Stopped {
            connection,
            result,
            server,
            replies,
            monitor_events,
            session,
        }
    }
}
