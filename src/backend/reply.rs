//! Per-command reply state, read by the upstream adapter when a reply
//! completes.

use std::collections::HashMap;

use crate::protocol::packet::Command;

/// Variable name under which the last observed GTID is tracked
pub const LAST_GTID: &str = "last_gtid";

/// The classifier's position within the current command's response.
/// `Done` is the only state in which a new command may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Waiting for the first response packet
    Start,
    /// Consuming column definitions
    RsetColdef,
    /// Expecting the EOF that terminates the column definitions
    RsetColdefEof,
    /// Consuming result rows
    RsetRows,
    /// Consuming a COM_STMT_PREPARE response
    Prepare,
    /// The response is complete
    Done,
}

/// Error descriptor extracted from an ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

/// Rolling state of the reply to the current command
#[derive(Debug, Clone)]
pub struct Reply {
    command: Command,
    state: ReplyState,
    rows: u64,
    field_count: u64,
    num_warnings: u16,
    generated_id: u32,
    param_count: u16,
    bytes: u64,
    error: Option<ReplyError>,
    is_ok: bool,
    variables: HashMap<String, String>,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            command: Command::Sleep,
            // A fresh connection is idle, not mid-reply
            state: ReplyState::Done,
            rows: 0,
            field_count: 0,
            num_warnings: 0,
            generated_id: 0,
            param_count: 0,
            bytes: 0,
            error: None,
            is_ok: false,
            variables: HashMap::new(),
        }
    }
}

impl Reply {
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn field_count(&self) -> u64 {
        self.field_count
    }

    pub fn num_warnings(&self) -> u16 {
        self.num_warnings
    }

    /// Statement id generated by the last COM_STMT_PREPARE
    pub fn generated_id(&self) -> u32 {
        self.generated_id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn error(&self) -> Option<&ReplyError> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Transaction state parsed from the session-tracked `trx_state` string
    pub fn trx_state(&self) -> Option<TrxState> {
        self.variable("trx_state").map(TrxState::parse)
    }

    /// Reset everything except the classifier position; called at the first
    /// packet of each new client command
    pub(crate) fn clear(&mut self) {
        let state = self.state;
        *self = Self::default();
        self.state = state;
    }

    pub(crate) fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub(crate) fn set_reply_state(&mut self, state: ReplyState) {
        self.state = state;
    }

    pub(crate) fn add_rows(&mut self, count: u64) {
        self.rows += count;
    }

    pub(crate) fn add_field_count(&mut self, count: u64) {
        self.field_count += count;
    }

    pub(crate) fn set_num_warnings(&mut self, warnings: u16) {
        self.num_warnings = warnings;
    }

    pub(crate) fn set_generated_id(&mut self, id: u32) {
        self.generated_id = id;
    }

    pub(crate) fn set_param_count(&mut self, count: u16) {
        self.param_count = count;
    }

    pub(crate) fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub(crate) fn set_error(&mut self, code: u16, sql_state: String, message: String) {
        self.error = Some(ReplyError {
            code,
            sql_state,
            message,
        });
    }

    pub(crate) fn set_is_ok(&mut self, is_ok: bool) {
        self.is_ok = is_ok;
    }

    pub(crate) fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }
}

/// Transaction state bitmask parsed from the 8-character session-tracked
/// string, one bit per place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrxState(u32);

impl TrxState {
    pub const EMPTY: TrxState = TrxState(0);
    /// An explicit transaction is active (T)
    pub const EXPLICIT: TrxState = TrxState(1);
    /// An implicit transaction is active (I)
    pub const IMPLICIT: TrxState = TrxState(1 << 1);
    /// Non-transactional tables were read (r)
    pub const READ_UNSAFE: TrxState = TrxState(1 << 2);
    /// Transactional tables were read (R)
    pub const READ_TRX: TrxState = TrxState(1 << 3);
    /// Non-transactional tables were written (w)
    pub const WRITE_UNSAFE: TrxState = TrxState(1 << 4);
    /// Transactional tables were written (W)
    pub const WRITE_TRX: TrxState = TrxState(1 << 5);
    /// Unsafe statements such as UUID() were used (s)
    pub const STMT_UNSAFE: TrxState = TrxState(1 << 6);
    /// A result set was sent to the client (S)
    pub const RESULT_SET: TrxState = TrxState(1 << 7);
    /// LOCK TABLES is active (L)
    pub const LOCKED_TABLES: TrxState = TrxState(1 << 8);

    pub fn parse(value: &str) -> TrxState {
        let mut state = TrxState::EMPTY;
        for ch in value.chars() {
            state.0 |= match ch {
                'T' => Self::EXPLICIT.0,
                'I' => Self::IMPLICIT.0,
                'r' => Self::READ_UNSAFE.0,
                'R' => Self::READ_TRX.0,
                'w' => Self::WRITE_UNSAFE.0,
                'W' => Self::WRITE_TRX.0,
                's' => Self::STMT_UNSAFE.0,
                'S' => Self::RESULT_SET.0,
                'L' => Self::LOCKED_TABLES.0,
                _ => 0,
            };
        }
        state
    }

    pub fn contains(self, other: TrxState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}
