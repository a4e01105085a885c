pub mod message;
pub mod node;
pub mod peers;


pub use message::{ParseError, PeerMessage};
pub use node::{AppHandle, AppRequest, Grant, MutexNode, MutexState};
pub use peers::{PeerBitset, PeerGroup, MAX_GROUP_SIZE};
