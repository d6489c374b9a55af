//! Mesh protocol core: peer overlay, reliable dissemination and chunked content transfer.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod dissemination;
pub mod hub;
pub mod identity;
pub mod metadata;
pub mod overlay;
pub mod protocol;
pub mod responder;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod transfer;
pub mod wire;

pub use config::Config;
pub use core::{AppEvent, MessageError, Node, NodeStatus, OutboundAction, StreamError};
pub use dissemination::SendError;
pub use hub::HubState;
pub use identity::{PeerId, Target};
pub use overlay::Direction;
pub use protocol::{Body, ContentMeta, Envelope, Message, Millis, PresenceBeacon, PROTOCOL_VERSION};
pub use store::{LocalStore, MemoryStore};
pub use stream::{ResponseHead, StreamEvent};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, Packet};
