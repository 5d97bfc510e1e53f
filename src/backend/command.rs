//! The write-side envelope: a framed client buffer plus the markers that
//! change how the connection treats it and its reply.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packet::{frame_payload_len, Command, Packet, PACKET_HEADER_SIZE};

/// One or more framed client packets headed for a backend
#[derive(Debug, Clone)]
pub struct BackendCommand {
    pub(crate) data: Bytes,
    /// The reply must be consumed internally, never forwarded upstream
    pub(crate) ignorable: bool,
    /// Buffer the whole reply and forward it as one buffer
    pub(crate) collect_result: bool,
    /// Parse session-state changes out of the reply's OK packets
    pub(crate) track_state: bool,
}

impl BackendCommand {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ignorable: false,
            collect_result: false,
            track_state: false,
        }
    }

    /// Frame a single-packet command with sequence 0
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self::new(Packet::new(0, payload).to_bytes())
    }

    /// A COM_QUERY carrying `sql`
    pub fn query(sql: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + sql.len());
        payload.put_u8(Command::Query as u8);
        payload.extend_from_slice(sql.as_bytes());
        Self::from_payload(payload.freeze())
    }

    /// The ignorable ping used for idle-connection keepalive
    pub fn ping() -> Self {
        Self::from_payload(vec![Command::Ping as u8]).ignorable()
    }

    pub fn quit() -> Self {
        Self::from_payload(vec![Command::Quit as u8])
    }

    pub fn ignorable(mut self) -> Self {
        self.ignorable = true;
        self
    }

    pub fn collect_result(mut self) -> Self {
        self.collect_result = true;
        self
    }

    pub fn track_state(mut self) -> Self {
        self.track_state = true;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Command byte of the first packet in the buffer
    pub(crate) fn command(&self) -> Option<Command> {
        if self.data.len() < PACKET_HEADER_SIZE || frame_payload_len(&self.data) == 0 {
            return None;
        }
        self.data
            .get(PACKET_HEADER_SIZE)
            .copied()
            .map(Command::from)
    }

    pub(crate) fn is_quit(&self) -> bool {
        self.command() == Some(Command::Quit)
    }
}
