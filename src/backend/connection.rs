//! The backend connection: owns the socket, gates writes by authentication
//! state, drives the reply tracker and surfaces tagged replies upstream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::monitor::MonitorSink;
use crate::protocol::codec::PacketCodec;
use crate::protocol::handshake::{
    create_capabilities, is_auth_switch_request, scramble_response, AuthSwitchRequest, ErrPacket,
    HandshakeResponse, ServerHandshake, DEFAULT_AUTH_PLUGIN, MAX_PACKET_SIZE,
};
use crate::protocol::packet::{
    capabilities, is_err_packet, Command, Packet, SCRAMBLE_SIZE,
};
use crate::router::{ErrorType, ReplyRoute, Upstream};
use crate::session::{ClientSession, SessionState};

use super::auth::{
    AuthOutcome, AuthState, BackendAuthenticator, NativePasswordAuth, EMPTY_PASSWORD_SHA1,
};
use super::command::BackendCommand;
use super::reply::{Reply, ReplyState};
use super::tracker::{DesyncError, ResponseTracker};

/// MySQL error the server reports after too many failed connects
pub const ER_HOST_IS_BLOCKED: u16 = 1129;
/// Client-side error code used for synthesized "lost connection" packets
const CR_CONN_HOST_ERROR: u16 = 2003;
/// How many recent commands to keep for desync postmortems
const COMMAND_HISTORY: usize = 8;

/// Backend connection errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Auth plugin mismatch: server requested '{0}'")]
    AuthPluginMismatch(String),

    #[error("Connection closed by peer")]
    Hangup,

    #[error("Backend TLS is not supported")]
    TlsUnsupported,

    #[error(transparent)]
    Desync(#[from] DesyncError),
}

/// The per-backend knobs a connection needs, independent of the socket type
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Name used in logs and reply routes
    pub server_name: String,
    /// Write a proxy-protocol v1 line before any MySQL bytes
    pub proxy_protocol: bool,
    /// The connection may be pooled; COM_QUIT is swallowed to keep it alive
    pub persistent: bool,
    /// Negotiate SESSION_TRACK when the server offers it
    pub session_track: bool,
}

impl From<&BackendConfig> for BackendSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            server_name: config.label(),
            proxy_protocol: config.proxy_protocol,
            persistent: config.persistent,
            session_track: config.session_track,
        }
    }
}

/// A connection to one backend server, owned by the session it serves
pub struct BackendConnection<S> {
    framed: Framed<S, PacketCodec>,
    settings: BackendSettings,
    session: Arc<ClientSession>,
    upstream: Box<dyn Upstream>,
    monitor: Option<MonitorSink>,
    authenticator: Box<dyn BackendAuthenticator>,
    auth_state: AuthState,
    /// The server's most recent scramble; reloaded on every AuthSwitchRequest
    scramble: [u8; SCRAMBLE_SIZE],
    thread_id: u32,
    server_capabilities: u32,
    /// Capabilities actually negotiated with this backend
    negotiated: u32,
    tracker: ResponseTracker,
    /// Replies of internally injected commands still pending; never forwarded
    ignore_replies: u32,
    /// A COM_CHANGE_USER round-trip is pending
    changing_user: bool,
    /// Client commands buffered across a COM_CHANGE_USER round-trip
    stored_query: Option<BytesMut>,
    /// Client commands received before authentication completed
    delay_queue: VecDeque<BackendCommand>,
    /// Framed buffers waiting to be flushed to the socket
    write_queue: VecDeque<Bytes>,
    /// Collect-result mode: buffer the reply and forward it whole
    collecting: bool,
    collect_queue: BytesMut,
    recent_commands: VecDeque<String>,
    last_read: Instant,
    last_write: Instant,
}

impl BackendConnection<TcpStream> {
    /// Open a TCP connection to a configured backend. Authentication happens
    /// as the driver loop consumes the server greeting.
    pub async fn connect(
        config: &BackendConfig,
        session: Arc<ClientSession>,
        upstream: Box<dyn Upstream>,
    ) -> Result<Self, BackendError> {
        if config.ssl {
            // The SSLRequest stub exists but the stream is never upgraded
            return Err(BackendError::TlsUnsupported);
        }

        let addr = format!("{}:{}", config.host, config.port);
        debug!(addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            BackendError::Connect(e.to_string())
        })?;

        Ok(Self::new(stream, config.into(), session, upstream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BackendConnection<S> {
    /// Wrap a connected stream. The connection starts in CONNECTED state and
    /// expects the server greeting as the first packet.
    pub fn new(
        stream: S,
        settings: BackendSettings,
        session: Arc<ClientSession>,
        upstream: Box<dyn Upstream>,
    ) -> Self {
        let authenticator: Box<dyn BackendAuthenticator> =
            Box::new(NativePasswordAuth::new(session.auth_token()));

        let mut connection = Self {
            framed: Framed::new(stream, PacketCodec),
            settings,
            session,
            upstream,
            monitor: None,
            authenticator,
            auth_state: AuthState::Connected,
            scramble: [0; SCRAMBLE_SIZE],
            thread_id: 0,
            server_capabilities: 0,
            negotiated: 0,
            tracker: ResponseTracker::new(),
            ignore_replies: 0,
            changing_user: false,
            stored_query: None,
            delay_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            collecting: false,
            collect_queue: BytesMut::new(),
            recent_commands: VecDeque::with_capacity(COMMAND_HISTORY),
            last_read: Instant::now(),
            last_write: Instant::now(),
        };

        if connection.settings.proxy_protocol {
            let header = proxy_protocol_header(&connection.session);
            info!(
                server = %connection.settings.server_name,
                header = %header.trim_end(),
                "Sending proxy-protocol header"
            );
            connection.write_queue.push_back(Bytes::from(header));
        }

        connection
    }

    /// Use a different authenticator, chosen by auth plugin name
    pub fn with_authenticator(mut self, authenticator: Box<dyn BackendAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorSink) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn reply(&self) -> &Reply {
        self.tracker.reply()
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Capabilities negotiated with this backend
    pub fn capabilities(&self) -> u32 {
        self.negotiated
    }

    /// Raw capability mask the server offered in its greeting
    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    pub fn ignore_replies(&self) -> u32 {
        self.ignore_replies
    }

    pub fn is_changing_user(&self) -> bool {
        self.changing_user
    }

    /// Idle, authenticated and free of buffered state
    pub fn established(&self) -> bool {
        self.auth_state == AuthState::Complete
            && self.ignore_replies == 0
            && self.stored_query.is_none()
    }

    pub fn seconds_idle(&self) -> u64 {
        self.last_read.max(self.last_write).elapsed().as_secs()
    }

    /// Queue a client command, subject to authentication-state gating.
    ///
    /// Before authentication completes commands land in the delay queue;
    /// while an internal reply is pending they accumulate in the stored
    /// query; after a failure they are discarded.
    pub fn write(&mut self, command: BackendCommand) -> Result<(), BackendError> {
        if self.ignore_replies > 0 || self.changing_user {
            return self.store_while_resetting(command);
        }

        match self.auth_state {
            AuthState::Fail | AuthState::FailHandshake => {
                if self.session.state() != SessionState::Stopping {
                    error!(
                        server = %self.settings.server_name,
                        "Discarding write to backend after {} failure",
                        if self.auth_state == AuthState::FailHandshake {
                            "handshake"
                        } else {
                            "authentication"
                        }
                    );
                }
                Ok(())
            }

            AuthState::Complete => self.write_authenticated(command),

            _ => {
                debug!(
                    server = %self.settings.server_name,
                    auth_state = %self.auth_state,
                    "Delaying write until authentication completes"
                );
                self.delay_queue.push_back(command);
                Ok(())
            }
        }
    }

    fn write_authenticated(&mut self, command: BackendCommand) -> Result<(), BackendError> {
        // A continuation of a 16 MiB client packet carries payload where a
        // command byte would be; never reinterpret it
        let continuation = self.tracker.is_large_query();
        let load_active = self.session.load_data_active();

        if command.ignorable {
            // The reply still flows through the tracker even though it will
            // be consumed internally
            if let Some(cmd) = command.command() {
                self.tracker.begin_command(cmd);
            }
        } else {
            let load_ended = self
                .tracker
                .track_query(&command.data, self.changing_user, load_active);
            if load_ended {
                info!("Load data ended");
                self.session.set_load_data_active(false);
            }
            self.remember_command(&command);
        }

        if command.collect_result {
            self.collecting = true;
        }
        self.tracker.set_track_state(command.track_state);

        if !continuation && !load_active && command.command() == Some(Command::ChangeUser) {
            // Replace the client's COM_CHANGE_USER with one built against
            // the server's current scramble
            self.send_change_user(false);
            return Ok(());
        }

        if command.is_quit() && self.settings.persistent {
            // Keep pooled connections alive; the pool resets the session
            // with COM_CHANGE_USER on reuse
            debug!(server = %self.settings.server_name, "Swallowing COM_QUIT on pooled backend");
            return Ok(());
        }

        if command.ignorable {
            self.ignore_replies += 1;
        }

        self.enqueue_frame(command.data);
        Ok(())
    }

    /// A COM_CHANGE_USER (or another ignorable command) is in flight: client
    /// traffic is buffered and dispatched once the reset completes.
    fn store_while_resetting(&mut self, command: BackendCommand) -> Result<(), BackendError> {
        if command.is_quit() {
            info!("COM_QUIT received while COM_CHANGE_USER is in progress, closing pooled connection");
            return Err(BackendError::Hangup);
        }

        debug!("COM_CHANGE_USER in progress, appending command to stored query");
        self.stored_query
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(&command.data);
        Ok(())
    }

    /// Rebind an idle pooled connection to a new session and reset the
    /// backend session state with COM_CHANGE_USER.
    ///
    /// Eligibility is checked before any mutation, so a refusal leaves the
    /// previous binding intact.
    pub fn reuse_connection(
        &mut self,
        session: Arc<ClientSession>,
        upstream: Box<dyn Upstream>,
    ) -> Result<(), BackendError> {
        if self.auth_state != AuthState::Complete {
            info!(
                server = %self.settings.server_name,
                auth_state = %self.auth_state,
                "Connection state does not qualify for pooling"
            );
            return Err(BackendError::Protocol(format!(
                "connection not reusable in auth state {}",
                self.auth_state
            )));
        }

        if self.ignore_replies != 0
            || !self.delay_queue.is_empty()
            || !self.write_queue.is_empty()
            || !self.tracker.reply().is_complete()
        {
            info!(
                server = %self.settings.server_name,
                "Connection has buffered state and does not qualify for pooling"
            );
            return Err(BackendError::Protocol(
                "connection has buffered state, not reusable".to_string(),
            ));
        }

        self.session = session;
        self.upstream = upstream;
        self.authenticator = Box::new(NativePasswordAuth::new(self.session.auth_token()));

        // The client this query belonged to is gone
        self.stored_query = None;

        self.send_change_user(true);
        Ok(())
    }

    /// Keepalive for pooled connections; only sent when no reply is in flight
    pub fn ping(&mut self) {
        if self.auth_state == AuthState::Complete
            && self.tracker.reply().state() == ReplyState::Done
            && self.ignore_replies == 0
            && !self.changing_user
        {
            info!(
                server = %self.settings.server_name,
                idle = self.seconds_idle(),
                "Pinging backend"
            );
            let _ = self.write(BackendCommand::ping());
        }
    }

    fn send_change_user(&mut self, ignore_reply: bool) {
        let frame = self.create_change_user_packet();
        self.tracker.begin_command(Command::ChangeUser);
        if ignore_reply {
            self.ignore_replies += 1;
        }
        self.changing_user = true;
        self.session.set_changing_user(true);
        info!(server = %self.settings.server_name, "Sent COM_CHANGE_USER");
        self.enqueue_frame(frame);
    }

    /// COM_CHANGE_USER built from the current session against the server's
    /// most recent scramble
    fn create_change_user_packet(&self) -> Bytes {
        let mut payload = BytesMut::new();

        payload.put_u8(Command::ChangeUser as u8);
        payload.extend_from_slice(self.session.user().as_bytes());
        payload.put_u8(0);

        match self.session.auth_token() {
            Some(token) => {
                payload.put_u8(SCRAMBLE_SIZE as u8);
                payload.extend_from_slice(&scramble_response(&self.scramble, &token));
            }
            None => payload.put_u8(0),
        }

        payload.extend_from_slice(self.session.database().as_bytes());
        payload.put_u8(0);

        // Two charset bytes; the second one is always zero
        payload.put_u8(self.session.character_set());
        payload.put_u8(0);

        payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
        payload.put_u8(0);

        if let Some(attrs) = self.session.connect_attrs() {
            payload.extend_from_slice(&attrs);
        }

        Packet::new(0, payload.freeze()).to_bytes()
    }

    /// Drive the connection: flush queued writes, then wait for either a
    /// complete server packet or the next client command.
    ///
    /// Returns Ok(()) when the command channel closes (the session released
    /// the connection); any failure has already been reported upstream.
    pub async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<BackendCommand>,
    ) -> Result<(), BackendError> {
        loop {
            if let Err(e) = self.flush().await {
                return Err(self.fail(e));
            }

            tokio::select! {
                packet = self.framed.next() => match packet {
                    Some(Ok(packet)) => {
                        if let Err(e) = self.on_packet(packet) {
                            return Err(self.fail(e));
                        }
                    }
                    Some(Err(e)) => {
                        error!(server = %self.settings.server_name, error = %e, "Read from backend failed");
                        return Err(self.fail(BackendError::Io(e)));
                    }
                    None => {
                        return Err(self.fail(BackendError::Hangup));
                    }
                },

                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.write(command) {
                            return Err(self.fail(e));
                        }
                    }
                    // The session let go of the connection; it stays usable
                    // and may be pooled
                    None => return Ok(()),
                },
            }
        }
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        if self.write_queue.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.write_queue.pop_front() {
            SinkExt::<Bytes>::feed(&mut self.framed, frame).await?;
        }
        SinkExt::<Bytes>::flush(&mut self.framed).await?;
        self.last_write = Instant::now();
        Ok(())
    }

    /// Report a fatal failure upstream and drop buffered client state
    fn fail(&mut self, error: BackendError) -> BackendError {
        self.report_failure(&error);
        self.stored_query = None;
        error
    }

    fn report_failure(&mut self, error: &BackendError) {
        if self.session.state() == SessionState::Stopping {
            return;
        }

        let message = match error {
            BackendError::Io(e) => {
                format!("Lost connection to backend server: network error ({e})")
            }
            BackendError::Hangup => {
                "Lost connection to backend server: connection closed by peer".to_string()
            }
            BackendError::Handshake(m) => format!(
                "Handshake with backend '{}' failed: {m}",
                self.settings.server_name
            ),
            BackendError::Auth(m) => format!(
                "Authentication with backend '{}' failed: {m}",
                self.settings.server_name
            ),
            BackendError::AuthPluginMismatch(plugin) => format!(
                "Received AuthSwitchRequest to '{plugin}' when '{DEFAULT_AUTH_PLUGIN}' was expected"
            ),
            other => format!("Lost connection to backend server: {other}"),
        };

        self.do_handle_error(ErrorType::Permanent, message);
    }

    /// Synthesize a generic "lost connection" ERR packet and hand the
    /// failure to the upstream. If the upstream cannot recover, the session
    /// must already be stopping.
    fn do_handle_error(&mut self, error_type: ErrorType, message: String) {
        let buffer = ErrPacket::new(CR_CONN_HOST_ERROR, "HY000", &message)
            .encode(1)
            .to_bytes();

        let Self {
            upstream,
            tracker,
            session,
            ..
        } = self;

        if !upstream.handle_error(error_type, buffer, tracker.reply())
            && session.state() != SessionState::Stopping
        {
            warn!("Upstream could not recover from backend failure outside session shutdown");
        }
    }

    fn on_packet(&mut self, packet: Packet) -> Result<(), BackendError> {
        self.last_read = Instant::now();

        match self.auth_state {
            AuthState::Connected => self.on_handshake_packet(packet),
            AuthState::ResponseSent => self.on_auth_packet(packet),
            AuthState::Complete => self.on_reply_packet(packet),
            AuthState::Fail | AuthState::FailHandshake => {
                debug!("Discarding packet received after authentication failure");
                Ok(())
            }
        }
    }

    /// First packet from the server: the protocol-10 greeting
    fn on_handshake_packet(&mut self, packet: Packet) -> Result<(), BackendError> {
        if is_err_packet(&packet.payload) {
            self.auth_state = AuthState::FailHandshake;
            let description = self.handle_error_response(&packet.payload);
            return Err(BackendError::Handshake(description));
        }

        let handshake = match ServerHandshake::parse(&packet.payload) {
            Some(handshake) => handshake,
            None => {
                self.auth_state = AuthState::FailHandshake;
                return Err(BackendError::Handshake(
                    "malformed or unsupported server handshake".to_string(),
                ));
            }
        };

        info!(
            server = %self.settings.server_name,
            thread_id = handshake.thread_id,
            server_version = %handshake.server_version,
            "Connected to backend"
        );

        self.scramble = handshake.scramble;
        self.thread_id = handshake.thread_id;
        self.server_capabilities = handshake.capabilities;

        let database = self.session.database();
        self.negotiated = create_capabilities(
            capabilities::DEFAULT_BACKEND_CAPABILITIES,
            handshake.capabilities,
            false,
            !database.is_empty(),
            self.settings.session_track,
        );
        self.tracker
            .set_session_track(self.negotiated & capabilities::CLIENT_SESSION_TRACK != 0);

        let auth_response = match self.session.auth_token() {
            Some(token) => scramble_response(&self.scramble, &token).to_vec(),
            None => Vec::new(),
        };

        let response = HandshakeResponse {
            capabilities: self.negotiated,
            extra_capabilities: 0,
            max_packet_size: MAX_PACKET_SIZE,
            character_set: self.session.character_set(),
            username: self.session.user().to_string(),
            auth_response,
            database: if database.is_empty() {
                None
            } else {
                Some(database)
            },
            auth_plugin_name: self.authenticator.plugin_name().to_string(),
            connect_attrs: self.session.connect_attrs(),
            server_capabilities: handshake.capabilities,
        };

        self.enqueue_frame(response.encode(1).to_bytes());
        self.auth_state = AuthState::ResponseSent;
        Ok(())
    }

    /// Server verdict on the handshake response, or authenticator data
    fn on_auth_packet(&mut self, packet: Packet) -> Result<(), BackendError> {
        if is_err_packet(&packet.payload) {
            // The server rejected the handshake response outright
            self.auth_state = AuthState::FailHandshake;
            let description = self.handle_error_response(&packet.payload);
            return Err(BackendError::Handshake(description));
        }

        match self.authenticator.exchange(&packet, &mut self.scramble) {
            AuthOutcome::Success => {
                self.auth_state = AuthState::Complete;
                debug!(server = %self.settings.server_name, "Backend authentication complete");
                self.drain_delay_queue()
            }

            AuthOutcome::Respond(response) => {
                // Authenticator produced the next packet, still mid-exchange
                self.enqueue_frame(response.to_bytes());
                Ok(())
            }

            AuthOutcome::Fail(message) => {
                self.auth_state = AuthState::Fail;
                error!(
                    server = %self.settings.server_name,
                    error = %message,
                    "Backend authentication failed"
                );
                Err(BackendError::Auth(message))
            }
        }
    }

    /// The delay queue drains exactly once, on the transition to COMPLETE
    fn drain_delay_queue(&mut self) -> Result<(), BackendError> {
        while let Some(command) = self.delay_queue.pop_front() {
            self.write(command)?;
        }
        Ok(())
    }

    /// A packet received after authentication completed
    fn on_reply_packet(&mut self, mut packet: Packet) -> Result<(), BackendError> {
        let mut finished_change_user = false;

        if self.changing_user {
            if is_auth_switch_request(&packet.payload) {
                return self.handle_auth_change(&packet);
            }

            // The final packet of a COM_CHANGE_USER chain always carries
            // sequence 3 to keep connectors in sync
            packet.sequence_id = 3;
            self.changing_user = false;
            self.session.set_changing_user(false);
            finished_change_user = true;
        }

        if let Err(e) = self.tracker.process(&packet) {
            self.dump_recent_commands(&e);
            return Err(e.into());
        }

        if self.tracker.take_load_data_request() {
            info!("Load data starting");
            self.session.set_load_data_active(true);
        }

        if self.ignore_replies > 0 {
            if self.tracker.reply().is_complete() {
                self.finish_ignored_reply()?;
            }
            return Ok(());
        }

        self.forward_reply(packet)?;

        // A client-originated COM_CHANGE_USER completed: dispatch the
        // commands the client pipelined behind it, or drop them if the
        // reauthentication failed
        if finished_change_user && self.tracker.reply().is_complete() {
            if self.tracker.reply().is_ok() {
                if let Some(stored) = self.stored_query.take() {
                    info!("COM_CHANGE_USER complete, writing stored query");
                    self.write(BackendCommand::new(stored.freeze()))?;
                }
            } else {
                self.stored_query = None;
            }
        }
        Ok(())
    }

    /// AuthSwitchRequest received while a COM_CHANGE_USER is pending: the
    /// server is re-keying the same plugin, anything else is fatal.
    fn handle_auth_change(&mut self, packet: &Packet) -> Result<(), BackendError> {
        let request = AuthSwitchRequest::parse(&packet.payload).ok_or_else(|| {
            BackendError::Protocol("malformed AuthSwitchRequest".to_string())
        })?;

        if request.plugin_name != DEFAULT_AUTH_PLUGIN {
            error!(
                server = %self.settings.server_name,
                plugin = %request.plugin_name,
                "Received AuthSwitchRequest to an unexpected plugin"
            );
            return Err(BackendError::AuthPluginMismatch(request.plugin_name));
        }

        self.scramble = request.scramble;
        let token = self.session.auth_token().unwrap_or(EMPTY_PASSWORD_SHA1);
        let response = scramble_response(&self.scramble, &token);

        // Third packet of the chain
        self.enqueue_frame(Packet::new(3, Bytes::copy_from_slice(&response)).to_bytes());
        Ok(())
    }

    /// A reply guarded by `ignore_replies` completed; consume it and release
    /// any stored client traffic.
    fn finish_ignored_reply(&mut self) -> Result<(), BackendError> {
        debug_assert!(self.ignore_replies > 0);
        self.ignore_replies -= 1;

        if let Some(error) = self.tracker.reply().error().cloned() {
            error!(
                server = %self.settings.server_name,
                code = error.code,
                message = %error.message,
                "Internally issued command failed, closing connection"
            );
            self.note_host_blocked(error.code);
            self.stored_query = None;
            return Err(BackendError::Auth(format!(
                "{}: {}",
                error.code, error.message
            )));
        }

        if !self.tracker.reply().is_ok() {
            error!(
                server = %self.settings.server_name,
                command = ?self.tracker.reply().command(),
                "Unexpected response to internally issued command, closing connection"
            );
            self.stored_query = None;
            return Err(BackendError::Protocol(
                "unexpected response to internally issued command".to_string(),
            ));
        }

        if let Some(stored) = self.stored_query.take() {
            info!("Response to COM_CHANGE_USER is OK, writing stored query");
            self.write(BackendCommand::new(stored.freeze()))?;
        }
        Ok(())
    }

    fn forward_reply(&mut self, packet: Packet) -> Result<(), BackendError> {
        let complete = self.tracker.reply().is_complete();
        let frame = packet.to_bytes();

        if self.collecting {
            self.collect_queue.extend_from_slice(&frame);
            if !complete {
                return Ok(());
            }
            self.collecting = false;
            let buffer = std::mem::take(&mut self.collect_queue).freeze();
            self.route_upstream(buffer);
            return Ok(());
        }

        self.route_upstream(frame);
        Ok(())
    }

    fn route_upstream(&mut self, buffer: Bytes) {
        if !self.session_ok_to_route() {
            // Session is closing; replying to the client isn't possible
            debug!("Session not in a routable state, dropping reply buffer");
            return;
        }

        let route = ReplyRoute {
            server: self.settings.server_name.clone(),
        };

        let Self {
            upstream, tracker, ..
        } = self;
        if !upstream.client_reply(buffer, &route, tracker.reply()) {
            warn!("Upstream failed to process a reply");
        }
    }

    fn session_ok_to_route(&self) -> bool {
        self.session.state() == SessionState::Started && self.session.is_routable()
    }

    /// Log a server ERR received during connection setup. ER_HOST_IS_BLOCKED
    /// additionally puts the server into maintenance through the monitor;
    /// it is the only error code with out-of-band side effects.
    fn handle_error_response(&mut self, payload: &[u8]) -> String {
        let err = ErrPacket::parse(payload)
            .unwrap_or_else(|| ErrPacket::new(2013, "HY000", "Malformed error packet"));

        error!(
            server = %self.settings.server_name,
            code = err.error_code,
            message = %err.error_message,
            "Invalid authentication message from backend"
        );
        self.note_host_blocked(err.error_code);

        format!("{}, {}", err.error_code, err.error_message)
    }

    fn note_host_blocked(&self, code: u16) {
        if code != ER_HOST_IS_BLOCKED {
            return;
        }

        if let Some(monitor) = &self.monitor {
            monitor.set_maintenance(
                &self.settings.server_name,
                "backend is blocking connections from the proxy",
            );
        }

        error!(
            server = %self.settings.server_name,
            "Server has been put into maintenance mode due to the server blocking connections \
             from the proxy. Run 'mysqladmin -h {} flush-hosts' on this server before taking it \
             out of maintenance mode. To avoid this problem in the future, set \
             'max_connect_errors' to a larger value in the backend server.",
            self.settings.server_name
        );
    }

    fn enqueue_frame(&mut self, frame: Bytes) {
        self.write_queue.push_back(frame);
    }

    fn remember_command(&mut self, command: &BackendCommand) {
        let description = match command.command() {
            Some(Command::Query) => {
                let sql = String::from_utf8_lossy(&command.data()[5..]);
                format!("COM_QUERY {}", truncate_sql(&sql, 100))
            }
            Some(other) => format!("{other:?}"),
            None => "empty packet".to_string(),
        };

        if self.recent_commands.len() == COMMAND_HISTORY {
            self.recent_commands.pop_front();
        }
        self.recent_commands.push_back(description);
    }

    /// Postmortem for protocol desyncs: the classifier cannot recover, so
    /// dump what the connection executed recently.
    fn dump_recent_commands(&self, error: &DesyncError) {
        error!(
            server = %self.settings.server_name,
            error = %error,
            "Protocol desynchronized, dumping recent commands"
        );
        for (index, statement) in self.recent_commands.iter().enumerate() {
            error!(index, statement = %statement, "Recent command");
        }
    }
}

/// Proxy-protocol v1 line announcing the client behind the proxy. Only the
/// text version is supported.
fn proxy_protocol_header(session: &ClientSession) -> String {
    match (session.client_addr(), session.local_addr()) {
        (Some(peer), Some(local)) if peer.is_ipv4() && local.is_ipv4() => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            peer.ip(),
            local.ip(),
            peer.port(),
            local.port()
        ),
        (Some(peer), Some(local)) if peer.is_ipv6() && local.is_ipv6() => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            peer.ip(),
            local.ip(),
            peer.port(),
            local.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

/// Truncate SQL for logging (avoid huge log entries)
fn truncate_sql(sql: &str, max_len: usize) -> String {
    if sql.len() <= max_len {
        sql.to_string()
    } else {
        format!("{}...", &sql[..max_len])
    }
}
