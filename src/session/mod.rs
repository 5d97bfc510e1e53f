//! The owning-session contract.
//!
//! A session owns its client and backend connections; a backend connection
//! holds a non-owning handle to the session it currently serves. The handle
//! carries the client identity needed to authenticate against backends and
//! the few flags the backend side consults while routing replies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol::handshake::password_token;
use crate::protocol::packet::SCRAMBLE_SIZE;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Started = 0,
    Stopping = 1,
    Stopped = 2,
}

/// Default charset sent to backends: utf8_general_ci
pub const DEFAULT_CHARSET: u8 = 0x21;

/// Client identity and the shared flags a backend connection consults
pub struct ClientSession {
    user: String,
    database: Mutex<String>,
    character_set: u8,
    /// SHA1 of the client password; None for an empty password
    auth_token: Option<[u8; SCRAMBLE_SIZE]>,
    /// Connection attributes blob received from the client, passed along as-is
    connect_attrs: Option<Bytes>,
    /// Client socket addresses for the proxy-protocol header
    client_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    state: AtomicU8,
    /// Whether the client protocol is in a state where replies can be routed
    routable: AtomicBool,
    /// LOAD DATA LOCAL INFILE transfer in progress
    load_data_active: AtomicBool,
    /// COM_CHANGE_USER round-trip in progress
    changing_user: AtomicBool,
}

impl ClientSession {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: Mutex::new(String::new()),
            character_set: DEFAULT_CHARSET,
            auth_token: None,
            connect_attrs: None,
            client_addr: None,
            local_addr: None,
            state: AtomicU8::new(SessionState::Started as u8),
            routable: AtomicBool::new(true),
            load_data_active: AtomicBool::new(false),
            changing_user: AtomicBool::new(false),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.auth_token = password_token(password);
        self
    }

    /// Use a pre-computed SHA1 token, the form the client protocol hands over
    pub fn with_auth_token(mut self, token: [u8; SCRAMBLE_SIZE]) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_database(self, database: impl Into<String>) -> Self {
        *self.database.lock() = database.into();
        self
    }

    pub fn with_character_set(mut self, character_set: u8) -> Self {
        self.character_set = character_set;
        self
    }

    pub fn with_connect_attrs(mut self, attrs: Bytes) -> Self {
        self.connect_attrs = Some(attrs);
        self
    }

    pub fn with_addresses(mut self, client: SocketAddr, local: SocketAddr) -> Self {
        self.client_addr = Some(client);
        self.local_addr = Some(local);
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> String {
        self.database.lock().clone()
    }

    pub fn set_database(&self, database: impl Into<String>) {
        *self.database.lock() = database.into();
    }

    pub fn character_set(&self) -> u8 {
        self.character_set
    }

    pub fn auth_token(&self) -> Option<[u8; SCRAMBLE_SIZE]> {
        self.auth_token
    }

    pub fn connect_attrs(&self) -> Option<Bytes> {
        self.connect_attrs.clone()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Relaxed) {
            0 => SessionState::Started,
            1 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_routable(&self) -> bool {
        self.routable.load(Ordering::Relaxed)
    }

    pub fn set_routable(&self, routable: bool) {
        self.routable.store(routable, Ordering::Relaxed);
    }

    pub fn load_data_active(&self) -> bool {
        self.load_data_active.load(Ordering::Relaxed)
    }

    pub fn set_load_data_active(&self, active: bool) {
        self.load_data_active.store(active, Ordering::Relaxed);
    }

    pub fn is_changing_user(&self) -> bool {
        self.changing_user.load(Ordering::Relaxed)
    }

    pub fn set_changing_user(&self, changing: bool) {
        self.changing_user.store(changing, Ordering::Relaxed);
    }
}
