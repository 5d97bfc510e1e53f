use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::encoding::ByteReader;
use super::packet::{capabilities::*, Packet, EOF_PAYLOAD_SIZE, REPLY_EOF, SCRAMBLE_SIZE};

/// The only auth plugin spoken natively. If the server wants something else
/// it will send an AuthSwitchRequest, which fails the connection.
pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

/// Max-packet size advertised in the handshake response (16 MiB)
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Initial handshake packet sent by a backend server (protocol version 10)
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub capabilities: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub auth_plugin_name: String,
}

impl ServerHandshake {
    /// Parse the greeting payload. Returns None for malformed packets or
    /// protocol versions other than 10.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = ByteReader::new(payload);

        let protocol_version = buf.take_u8();
        if protocol_version != 10 {
            return None;
        }

        let server_version = String::from_utf8_lossy(buf.take_cstr()).into_owned();
        let thread_id = buf.take_u32_le();

        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble[..8].copy_from_slice(buf.take_bytes(8));

        // Filler
        buf.advance(1);

        let capabilities_lower = buf.take_u16_le() as u32;
        let character_set = buf.take_u8();
        let status_flags = buf.take_u16_le();
        let capabilities_upper = buf.take_u16_le() as u32;
        let capabilities = capabilities_lower | (capabilities_upper << 16);

        // Total scramble length including the terminating NUL, zero on old servers
        let scramble_len = match buf.take_u8() {
            0 => SCRAMBLE_SIZE,
            n => (n as usize - 1).clamp(8, SCRAMBLE_SIZE),
        };

        // Reserved
        buf.advance(10.min(buf.remaining()));

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            // The second scramble part is at least 13 bytes including the NUL
            let region = std::cmp::max(13, scramble_len - 8);
            if buf.remaining() < region {
                return None;
            }
            let part2 = buf.take_bytes(region);
            scramble[8..scramble_len].copy_from_slice(&part2[..scramble_len - 8]);
        }

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            String::from_utf8_lossy(buf.take_cstr()).into_owned()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            thread_id,
            capabilities,
            character_set,
            status_flags,
            scramble,
            auth_plugin_name,
        })
    }
}

/// Handshake response packet written back to the backend server
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    /// MariaDB 10.2 extended capabilities, zero when none
    pub extra_capabilities: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    /// Scramble response; empty means "no password"
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    /// Connection attributes blob copied from the client as-is
    pub connect_attrs: Option<Bytes>,
    /// Capabilities offered by the server, gates the attribute blob
    pub server_capabilities: u32,
}

impl HandshakeResponse {
    /// Encode to a packet. Sequence 1 normally, 2 after a prior SSL stub.
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // 19 filler bytes, then either MariaDB extra capabilities or 4 more
        buf.extend_from_slice(&[0u8; 19]);
        buf.put_u32_le(self.extra_capabilities);

        // Username
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        // Scramble response with a length byte, or a single zero byte when
        // there is no password
        if self.auth_response.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        }

        // Database
        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        // Auth plugin name
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        // Pass client attributes along without processing them
        if self.capabilities & self.server_capabilities & CLIENT_CONNECT_ATTRS != 0 {
            if let Some(ref attrs) = self.connect_attrs {
                buf.extend_from_slice(attrs);
            }
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// The short handshake response sent before upgrading the stream to TLS
#[derive(Debug, Clone)]
pub struct SslRequest {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
}

impl SslRequest {
    pub fn new(capabilities: u32, character_set: u8) -> Self {
        Self {
            capabilities: capabilities | CLIENT_SSL,
            max_packet_size: MAX_PACKET_SIZE,
            character_set,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Server-initiated request to re-authenticate with a (possibly different)
/// plugin, carrying a fresh scramble
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: [u8; SCRAMBLE_SIZE],
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if !is_auth_switch_request(payload) {
            return None;
        }

        let mut buf = ByteReader::new(&payload[1..]);
        let plugin_name = String::from_utf8_lossy(buf.take_cstr()).into_owned();

        if buf.remaining() < SCRAMBLE_SIZE {
            return None;
        }
        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble.copy_from_slice(buf.take_bytes(SCRAMBLE_SIZE));

        Some(Self {
            plugin_name,
            scramble,
        })
    }
}

/// An AuthSwitchRequest shares the 0xfe marker with EOF; length tells them apart
pub fn is_auth_switch_request(payload: &[u8]) -> bool {
    payload.first() == Some(&REPLY_EOF) && payload.len() > EOF_PAYLOAD_SIZE
}

/// OK packet fields up to the optional session-state info
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0x00) || payload.len() < 7 {
            return None;
        }

        let mut buf = ByteReader::new(&payload[1..]);
        let affected_rows = buf.lenenc_int();
        let last_insert_id = buf.lenenc_int();
        let status_flags = buf.take_u16_le();
        let warnings = buf.take_u16_le();

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        buf.extend_from_slice(self.sql_state.as_bytes());
        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) || payload.len() < 3 {
            return None;
        }

        let mut buf = ByteReader::new(&payload[1..]);
        let error_code = buf.take_u16_le();

        let (sql_state, error_message) = if buf.peek() == Some(b'#') && buf.remaining() >= 6 {
            buf.advance(1);
            let sql_state = String::from_utf8_lossy(buf.take_bytes(5)).into_owned();
            (sql_state, String::from_utf8_lossy(buf.rest()).into_owned())
        } else {
            (
                "HY000".to_string(),
                String::from_utf8_lossy(buf.rest()).into_owned(),
            )
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Capability mask sent to the backend: the intersection of what we want and
/// what the server offers, with SSL, CONNECT_WITH_DB, SESSION_TRACK,
/// MULTI_STATEMENTS and PLUGIN_AUTH chosen per policy.
pub fn create_capabilities(
    client_desired: u32,
    server_offered: u32,
    with_ssl: bool,
    db_specified: bool,
    session_track: bool,
) -> u32 {
    let mut caps = client_desired & server_offered;

    if with_ssl {
        caps |= CLIENT_SSL;
    }

    if session_track {
        caps |= server_offered & CLIENT_SESSION_TRACK;
    }

    caps |= CLIENT_MULTI_STATEMENTS;

    if db_specified {
        caps |= CLIENT_CONNECT_WITH_DB;
    } else {
        caps &= !CLIENT_CONNECT_WITH_DB;
    }

    caps |= CLIENT_PLUGIN_AUTH;

    // Never negotiated, see DEFAULT_BACKEND_CAPABILITIES
    caps &= !(CLIENT_DEPRECATE_EOF | CLIENT_COMPRESS);

    caps
}

/// SHA1 of the plaintext password, the token the proxy actually stores.
/// None for an empty password.
pub fn password_token(password: &str) -> Option<[u8; SCRAMBLE_SIZE]> {
    if password.is_empty() {
        return None;
    }
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let mut token = [0u8; SCRAMBLE_SIZE];
    token.copy_from_slice(&hasher.finalize());
    Some(token)
}

/// Compute the mysql_native_password response from the stored SHA1 token:
///
/// ```text
/// hash2     = SHA1(token)
/// response  = SHA1(scramble ‖ hash2) XOR token
/// ```
pub fn scramble_response(
    scramble: &[u8; SCRAMBLE_SIZE],
    token: &[u8; SCRAMBLE_SIZE],
) -> [u8; SCRAMBLE_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(token);
    let hash2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    let mut response = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in response.iter_mut().enumerate() {
        *byte = token[i] ^ hash3[i];
    }
    response
}

/// Compute the auth response straight from a plaintext password. Empty for an
/// empty password.
pub fn compute_auth_response(password: &str, scramble: &[u8; SCRAMBLE_SIZE]) -> Vec<u8> {
    match password_token(password) {
        Some(token) => scramble_response(scramble, &token).to_vec(),
        None => Vec::new(),
    }
}
