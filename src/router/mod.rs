//! The upstream seam between a backend connection and the router above it.
//!
//! Once the reply tracker marks packets complete, the connection hands fully
//! framed, tagged buffers to an `Upstream`. The router chain lives above this
//! trait; the connection only needs to know how to deliver replies and how to
//! report failures.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::backend::reply::Reply;

/// Severity of a backend failure reported upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The connection is gone and will not recover
    Permanent,
    /// The failure may clear; the upstream may retry elsewhere
    Transient,
}

/// The path a reply took on its way to the client
#[derive(Debug, Clone)]
pub struct ReplyRoute {
    pub server: String,
}

/// Receiver of routed replies, implemented by the router/filter chain
pub trait Upstream: Send {
    /// Deliver a framed reply buffer tagged with the reply state it belongs
    /// to. Ownership of the buffer transfers to the upstream. Returns false
    /// if the upstream could not process the reply.
    fn client_reply(&mut self, buffer: Bytes, route: &ReplyRoute, reply: &Reply) -> bool;

    /// Report a backend failure. `message` is a framed MySQL ERR packet
    /// suitable for forwarding to the client. Returns false if the upstream
    /// cannot recover, in which case the session must already be stopping.
    fn handle_error(&mut self, error_type: ErrorType, message: Bytes, reply: &Reply) -> bool;
}

/// Reply events as seen by a channel-backed upstream
#[derive(Debug)]
pub enum ReplyEvent {
    Data {
        buffer: Bytes,
        route: ReplyRoute,
        reply: Reply,
    },
    Error {
        error_type: ErrorType,
        message: Bytes,
        reply: Reply,
    },
}

/// Upstream that forwards events over a channel, used by the probe binary
/// and the test harness
pub struct ChannelUpstream {
    tx: mpsc::UnboundedSender<ReplyEvent>,
}

impl ChannelUpstream {
    pub fn new(tx: mpsc::UnboundedSender<ReplyEvent>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the receiving half too
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReplyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Upstream for ChannelUpstream {
    fn client_reply(&mut self, buffer: Bytes, route: &ReplyRoute, reply: &Reply) -> bool {
        self.tx
            .send(ReplyEvent::Data {
                buffer,
                route: route.clone(),
                reply: reply.clone(),
            })
            .is_ok()
    }

    fn handle_error(&mut self, error_type: ErrorType, message: Bytes, reply: &Reply) -> bool {
        self.tx
            .send(ReplyEvent::Error {
                error_type,
                message,
                reply: reply.clone(),
            })
            .is_ok()
    }
}
