//! The reply tracker: classifies every post-auth packet against the current
//! reply state without copying payloads.
//!
//! Mis-tracking a single packet desynchronizes the stream for the life of the
//! connection, so the write side (`track_query`) and the read side
//! (`process`) share one struct that carries all command-scoped flags.

use tracing::{debug, warn};

use crate::protocol::encoding::ByteReader;
use crate::protocol::packet::{
    frame_payload_len, Command, Packet, EOF_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE,
    REPLY_EOF, REPLY_ERR, REPLY_LOCAL_INFILE, REPLY_OK, SERVER_MORE_RESULTS_EXIST,
    SERVER_SESSION_STATE_CHANGED,
};

use super::reply::{Reply, ReplyState, LAST_GTID};

/// Session-track item types carried in OK packets
const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0x00;
const SESSION_TRACK_SCHEMA: u8 = 0x01;
const SESSION_TRACK_STATE_CHANGE: u8 = 0x02;
const SESSION_TRACK_GTIDS: u8 = 0x03;
const SESSION_TRACK_TRANSACTION_CHARACTERISTICS: u8 = 0x04;
const SESSION_TRACK_TRANSACTION_STATE: u8 = 0x05;

/// A packet arrived that is illegal in the current reply state. Fatal for
/// the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unexpected packet in reply state {state:?}: first byte 0x{first_byte:02x}, length {len}")]
pub struct DesyncError {
    pub state: ReplyState,
    pub first_byte: u8,
    pub len: usize,
}

/// Tracks the reply to the command currently executing on a backend
#[derive(Debug)]
pub struct ResponseTracker {
    reply: Reply,
    /// Column definitions still expected in the current result set
    num_coldefs: u64,
    /// Packets still expected in a COM_STMT_PREPARE response
    ps_packets: u64,
    /// The next packet is the body tail of a 16 MiB packet, consume it
    /// without classifying
    skip_next: bool,
    /// COM_STMT_EXECUTE opened a cursor; the response ends at the coldef EOF
    opening_cursor: bool,
    /// The previous client packet was a 16 MiB continuation, keep the
    /// current command
    large_query: bool,
    /// The current command asked for session-state tracking
    track_state: bool,
    /// SESSION_TRACK was negotiated with this backend
    session_track: bool,
    /// The server announced a LOAD DATA LOCAL INFILE transfer
    pending_load_data: bool,
}

impl Default for ResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self {
            reply: Reply::default(),
            num_coldefs: 0,
            ps_packets: 0,
            skip_next: false,
            opening_cursor: false,
            large_query: false,
            track_state: false,
            session_track: false,
            pending_load_data: false,
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn is_complete(&self) -> bool {
        self.reply.is_complete()
    }

    pub(crate) fn set_session_track(&mut self, enabled: bool) {
        self.session_track = enabled;
    }

    pub(crate) fn set_track_state(&mut self, enabled: bool) {
        self.track_state = enabled;
    }

    /// Start tracking an internally generated command that bypasses the
    /// normal write path
    pub(crate) fn begin_command(&mut self, command: Command) {
        self.reply.clear();
        self.reply.set_command(command);
        self.reply.set_reply_state(ReplyState::Start);
    }

    /// Inspect an outgoing client packet and set up reply tracking for it.
    ///
    /// `frame` is the framed packet (header included). Returns true when an
    /// active LOAD DATA transfer just ended with its empty terminator.
    pub fn track_query(&mut self, frame: &[u8], changing_user: bool, load_active: bool) -> bool {
        debug_assert!(frame.len() >= PACKET_HEADER_SIZE);
        let payload_len = frame_payload_len(frame);
        let mut load_ended = false;

        if changing_user {
            // Reauthentication in progress, the contents are opaque
        } else if load_active {
            if payload_len == 0 {
                // Empty packet terminates the file transfer; the server
                // responds with OK or ERR
                load_ended = true;
                self.reply.set_reply_state(ReplyState::Start);
            }
        } else if !self.large_query {
            self.reply.clear();
            let command = Command::from(frame.get(PACKET_HEADER_SIZE).copied().unwrap_or(0));
            self.reply.set_command(command);

            if command.expects_response() {
                self.reply.set_reply_state(ReplyState::Start);
            }

            if command == Command::StmtExecute {
                // The flag byte follows the 4-byte statement id; any non-zero
                // value means a cursor is being opened
                let flags = frame
                    .get(PACKET_HEADER_SIZE + 1 + 4)
                    .copied()
                    .unwrap_or(0);
                self.opening_cursor = flags != 0;
            } else if command == Command::StmtFetch {
                // Fetch responses have no column definitions
                self.reply.set_reply_state(ReplyState::RsetRows);
            }
        }

        // A 16 MiB client packet continues in the next one; keep the current
        // command so it always names the latest command on this backend
        self.large_query = payload_len == MAX_PAYLOAD_SIZE;
        load_ended
    }

    /// True once after the server announced a LOAD DATA LOCAL INFILE request
    pub fn take_load_data_request(&mut self) -> bool {
        std::mem::take(&mut self.pending_load_data)
    }

    /// Whether the next client packet continues a 16 MiB command
    pub fn is_large_query(&self) -> bool {
        self.large_query
    }

    /// Classify one complete server packet
    pub fn process(&mut self, packet: &Packet) -> Result<(), DesyncError> {
        self.reply
            .add_bytes((PACKET_HEADER_SIZE + packet.payload.len()) as u64);

        // The tail end of a 16 MiB packet carries no header of its own.
        // Refresh the flag before dispatching so the continuation is consumed
        // without classification.
        let skip = self.skip_next;
        self.skip_next = packet.payload.len() == MAX_PAYLOAD_SIZE;
        if skip {
            return Ok(());
        }

        self.process_one(&packet.payload)
    }

    fn process_one(&mut self, payload: &[u8]) -> Result<(), DesyncError> {
        let first = payload.first().copied().unwrap_or(0);

        match self.reply.state() {
            ReplyState::Start => self.process_reply_start(payload),

            ReplyState::Done => {
                if first == REPLY_ERR {
                    // A late error after the reply was routed is abnormal but
                    // tolerated; record it for the next observer
                    self.update_error(&payload[1..]);
                    Ok(())
                } else {
                    Err(DesyncError {
                        state: ReplyState::Done,
                        first_byte: first,
                        len: payload.len(),
                    })
                }
            }

            ReplyState::RsetColdef => {
                debug_assert!(self.num_coldefs > 0);
                self.num_coldefs = self.num_coldefs.saturating_sub(1);
                if self.num_coldefs == 0 {
                    self.reply.set_reply_state(ReplyState::RsetColdefEof);
                }
                Ok(())
            }

            ReplyState::RsetColdefEof => {
                debug_assert!(first == REPLY_EOF && payload.len() == EOF_PAYLOAD_SIZE);
                self.reply.set_reply_state(ReplyState::RsetRows);

                if self.opening_cursor {
                    // The cursor is open; rows arrive later via COM_STMT_FETCH
                    self.opening_cursor = false;
                    debug!("Cursor successfully opened");
                    self.reply.set_reply_state(ReplyState::Done);
                }
                Ok(())
            }

            ReplyState::RsetRows => {
                if first == REPLY_EOF && payload.len() == EOF_PAYLOAD_SIZE {
                    let mut buf = ByteReader::new(&payload[1..]);
                    let warnings = buf.take_u16_le();
                    let status = buf.take_u16_le();
                    self.reply.set_num_warnings(warnings);

                    let next = if status & SERVER_MORE_RESULTS_EXIST == 0 {
                        ReplyState::Done
                    } else {
                        ReplyState::Start
                    };
                    self.reply.set_reply_state(next);
                } else if first == REPLY_ERR {
                    self.update_error(&payload[1..]);
                    self.reply.set_reply_state(ReplyState::Done);
                } else {
                    self.reply.add_rows(1);
                }
                Ok(())
            }

            ReplyState::Prepare => {
                self.ps_packets = self.ps_packets.saturating_sub(1);
                if self.ps_packets == 0 {
                    self.reply.set_reply_state(ReplyState::Done);
                }
                Ok(())
            }
        }
    }

    fn process_reply_start(&mut self, payload: &[u8]) -> Result<(), DesyncError> {
        match self.reply.command() {
            // The replication stream is a response that never ends; every
            // event is forwarded as it arrives
            Command::BinlogDump => Ok(()),

            // COM_STATISTICS returns a single string payload
            Command::Statistics => {
                self.reply.set_reply_state(ReplyState::Done);
                Ok(())
            }

            // COM_FIELD_LIST sends a result set without column definitions
            Command::FieldList => {
                self.reply.set_reply_state(ReplyState::RsetRows);
                Ok(())
            }

            _ => {
                self.process_result_start(payload);
                Ok(())
            }
        }
    }

    fn process_result_start(&mut self, payload: &[u8]) {
        match payload.first().copied().unwrap_or(0) {
            REPLY_OK => {
                self.reply.set_is_ok(true);
                if self.reply.command() == Command::StmtPrepare {
                    self.process_ps_response(payload);
                } else {
                    self.process_ok_packet(payload);
                }
            }

            REPLY_LOCAL_INFILE => {
                // The client now streams the file contents, terminated by an
                // empty packet, and the server answers with OK or ERR
                self.pending_load_data = true;
                self.reply.set_reply_state(ReplyState::Done);
            }

            REPLY_ERR => {
                // Nothing ever follows an error packet
                self.update_error(&payload[1..]);
                self.reply.set_reply_state(ReplyState::Done);
            }

            REPLY_EOF => {
                // Only legal while a COM_CHANGE_USER reauthentication is
                // pending; the connection intercepts AuthSwitchRequests
                // before they reach the tracker
                warn!("EOF as the first response packet outside COM_CHANGE_USER");
            }

            _ => {
                // Start of a result set, the payload is the field count
                let mut buf = ByteReader::new(payload);
                self.num_coldefs = buf.lenenc_int();
                self.reply.add_field_count(self.num_coldefs);
                self.reply.set_reply_state(ReplyState::RsetColdef);
            }
        }
    }

    fn process_ok_packet(&mut self, payload: &[u8]) {
        let mut buf = ByteReader::new(&payload[1..]);
        buf.skip_lenenc_int(); // Affected rows
        buf.skip_lenenc_int(); // Last insert id
        let status = buf.take_u16_le();

        if status & SERVER_MORE_RESULTS_EXIST == 0 {
            self.reply.set_reply_state(ReplyState::Done);
        }

        let warnings = buf.take_u16_le();
        self.reply.set_num_warnings(warnings);

        if self.session_track && status & SERVER_SESSION_STATE_CHANGED != 0 && self.track_state {
            buf.skip_lenenc_str(); // Human-readable info

            // The total length is implicit in the payload end
            let total = buf.lenenc_int();
            debug_assert_eq!(total as usize, buf.remaining());

            while !buf.is_empty() {
                let entry_type = buf.take_u8();
                let entry_len = buf.lenenc_int() as usize;

                match entry_type {
                    SESSION_TRACK_STATE_CHANGE => buf.advance(entry_len.min(buf.remaining())),

                    SESSION_TRACK_SCHEMA => buf.skip_lenenc_str(),

                    SESSION_TRACK_GTIDS => {
                        buf.skip_lenenc_int(); // Encoding specification
                        let gtid = buf.lenenc_string();
                        self.reply.set_variable(LAST_GTID, gtid);
                    }

                    SESSION_TRACK_TRANSACTION_CHARACTERISTICS => {
                        let value = buf.lenenc_string();
                        self.reply.set_variable("trx_characteristics", value);
                    }

                    SESSION_TRACK_SYSTEM_VARIABLES => {
                        let name = buf.lenenc_string();
                        let value = buf.lenenc_string();
                        self.reply.set_variable(name, value);
                    }

                    SESSION_TRACK_TRANSACTION_STATE => {
                        let value = buf.lenenc_string();
                        self.reply.set_variable("trx_state", value);
                    }

                    other => {
                        buf.advance(entry_len.min(buf.remaining()));
                        warn!(entry_type = other, "Unexpected session track type");
                    }
                }
            }
        }
    }

    /// Contents of a COM_STMT_PREPARE_OK packet:
    ///
    /// ```text
    /// [0]     OK (1)            -- always 0x00
    /// [1-4]   statement_id (4)
    /// [5-6]   num_columns (2)
    /// [7-8]   num_params (2)
    /// ```
    ///
    /// The OK packet is followed by the parameter definitions terminated by
    /// an EOF and the column definitions terminated by an EOF; either group
    /// is absent when its count is zero.
    fn process_ps_response(&mut self, payload: &[u8]) {
        debug_assert_eq!(payload.first(), Some(&REPLY_OK));
        let mut buf = ByteReader::new(&payload[1..]);

        let stmt_id = buf.take_u32_le();
        let columns = buf.take_u16_le();
        let params = buf.take_u16_le();

        self.reply.set_generated_id(stmt_id);
        self.reply.set_param_count(params);

        self.ps_packets = 0;
        if columns > 0 {
            // Column definition packets plus one for the EOF
            self.ps_packets += columns as u64 + 1;
        }
        if params > 0 {
            // Parameter definition packets plus one for the EOF
            self.ps_packets += params as u64 + 1;
        }

        self.reply.set_reply_state(if self.ps_packets == 0 {
            ReplyState::Done
        } else {
            ReplyState::Prepare
        });
    }

    /// `data` starts at the error code, one byte past the 0xff marker
    fn update_error(&mut self, data: &[u8]) {
        let mut buf = ByteReader::new(data);
        let code = buf.take_u16_le();

        let (sql_state, message) = if buf.peek() == Some(b'#') && buf.remaining() >= 6 {
            buf.advance(1);
            let state = String::from_utf8_lossy(buf.take_bytes(5)).into_owned();
            (state, String::from_utf8_lossy(buf.rest()).into_owned())
        } else {
            (
                "HY000".to_string(),
                String::from_utf8_lossy(buf.rest()).into_owned(),
            )
        };

        self.reply.set_error(code, sql_state, message);
    }
}
