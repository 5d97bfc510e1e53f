//! Backend authentication: the state the handshake driver moves through and
//! the authenticator seam it is polymorphic over.

use std::fmt;

use bytes::Bytes;

use crate::protocol::handshake::{
    is_auth_switch_request, scramble_response, AuthSwitchRequest, ErrPacket, DEFAULT_AUTH_PLUGIN,
};
use crate::protocol::packet::{Packet, REPLY_ERR, REPLY_OK, SCRAMBLE_SIZE};

/// The 20 zero bytes standing in for SHA1(password) when the password is
/// empty. Process-wide constant, the only global in the core.
pub const EMPTY_PASSWORD_SHA1: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];

/// Authentication progress of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Socket connected, waiting for the server greeting
    Connected,
    /// Handshake response sent, waiting for the server verdict
    ResponseSent,
    /// Authentication succeeded
    Complete,
    /// Authentication failed after the handshake
    Fail,
    /// The handshake itself failed, distinguished for operator messaging
    FailHandshake,
}

impl AuthState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuthState::Complete | AuthState::Fail | AuthState::FailHandshake
        )
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Connected => "CONNECTED",
            AuthState::ResponseSent => "RESPONSE_SENT",
            AuthState::Complete => "COMPLETE",
            AuthState::Fail => "FAILED",
            AuthState::FailHandshake => "HANDSHAKE_FAILED",
        };
        f.write_str(name)
    }
}

/// Result of feeding one server packet to an authenticator
#[derive(Debug)]
pub enum AuthOutcome {
    /// Authentication finished successfully
    Success,
    /// The authenticator produced another packet; still waiting on the server
    Respond(Packet),
    /// The server rejected us or asked for something unsupported
    Fail(String),
}

/// An authentication mechanism for the backend side of a session. One is
/// chosen at connection construction by auth plugin name.
pub trait BackendAuthenticator: Send {
    fn plugin_name(&self) -> &'static str;

    /// Consume a server packet received in RESPONSE_SENT state. The scramble
    /// is shared with the connection so a reloaded value stays authoritative
    /// for later COM_CHANGE_USER exchanges.
    fn exchange(
        &mut self,
        packet: &Packet,
        scramble: &mut [u8; SCRAMBLE_SIZE],
    ) -> AuthOutcome;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported auth plugin '{0}'")]
pub struct UnsupportedPlugin(pub String);

/// Pick an authenticator by plugin name
pub fn create_authenticator(
    plugin: &str,
    token: Option<[u8; SCRAMBLE_SIZE]>,
) -> Result<Box<dyn BackendAuthenticator>, UnsupportedPlugin> {
    match plugin {
        DEFAULT_AUTH_PLUGIN => Ok(Box::new(NativePasswordAuth::new(token))),
        other => Err(UnsupportedPlugin(other.to_string())),
    }
}

/// mysql_native_password: the scramble response was already sent with the
/// handshake response, so the exchange only has to read the verdict and
/// answer AuthSwitchRequests that re-key the same plugin.
pub struct NativePasswordAuth {
    token: Option<[u8; SCRAMBLE_SIZE]>,
}

impl NativePasswordAuth {
    pub fn new(token: Option<[u8; SCRAMBLE_SIZE]>) -> Self {
        Self { token }
    }
}

impl BackendAuthenticator for NativePasswordAuth {
    fn plugin_name(&self) -> &'static str {
        DEFAULT_AUTH_PLUGIN
    }

    fn exchange(
        &mut self,
        packet: &Packet,
        scramble: &mut [u8; SCRAMBLE_SIZE],
    ) -> AuthOutcome {
        let payload = &packet.payload;

        match payload.first().copied() {
            Some(REPLY_OK) => AuthOutcome::Success,

            Some(REPLY_ERR) => {
                let message = ErrPacket::parse(payload)
                    .map(|e| format!("{}: {}", e.error_code, e.error_message))
                    .unwrap_or_else(|| "malformed error packet".to_string());
                AuthOutcome::Fail(message)
            }

            Some(_) if is_auth_switch_request(payload) => {
                match AuthSwitchRequest::parse(payload) {
                    Some(request) if request.plugin_name == DEFAULT_AUTH_PLUGIN => {
                        // The server re-keyed the same plugin; reload the
                        // scramble and answer with a fresh response
                        *scramble = request.scramble;
                        let token = self.token.unwrap_or(EMPTY_PASSWORD_SHA1);
                        let response = scramble_response(scramble, &token);
                        AuthOutcome::Respond(Packet::new(
                            packet.sequence_id.wrapping_add(1),
                            Bytes::copy_from_slice(&response),
                        ))
                    }
                    Some(request) => AuthOutcome::Fail(format!(
                        "server requested auth switch to '{}'",
                        request.plugin_name
                    )),
                    None => AuthOutcome::Fail("malformed AuthSwitchRequest".to_string()),
                }
            }

            _ => AuthOutcome::Fail("unexpected packet during authentication".to_string()),
        }
    }
}
