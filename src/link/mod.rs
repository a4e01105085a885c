//! Point-to-point FIFO links between peers.
//!
//! A link delivers variable-length text payloads between any two peers with
//! no loss, no duplication, and per-pair FIFO order. Peers talk to their
//! link through a pair of channels: outbound submissions go into `req`,
//! inbound deliveries come out of `ind`. The link owns its own threads, so
//! submissions never block the caller.

pub mod mock;
pub mod tcp;

pub use mock::MockLinkNet;
pub use tcp::TcpLink;

use crossbeam_channel::{Receiver, Sender};

/// An outbound submission: deliver `message` to the peer listening at `to`.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: String,
    pub message: String,
}

/// An inbound delivery. `from` is the source address as the link saw it;
/// the peer identity relevant to the protocol is carried in the payload.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub from: String,
    pub message: String,
}

/// The channel pair a peer uses to talk to its link.
pub struct LinkHandle {
    /// Outbound submission channel.
    pub req: Sender<Outgoing>,
    /// Inbound delivery channel.
    pub ind: Receiver<Delivered>,
}
