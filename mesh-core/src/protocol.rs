//! Mesh wire protocol: envelope, content metadata and control message types.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, Target};

/// Current protocol version. Carried in HELLO.
pub const PROTOCOL_VERSION: u8 = 1;

/// Milliseconds since the UNIX epoch, supplied by the host.
pub type Millis = u64;

/// Application payload of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Text(String),
    /// Reference to announced content (the chat message shown next to a file).
    ContentRef(ContentMeta),
}

/// Chat envelope. Immutable once sent; `id` is the de-duplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub sender: PeerId,
    pub target: Target,
    pub body: Body,
    /// Logical timestamp.
    pub ts: u64,
    pub ttl: u8,
}

/// Announcement describing a piece of content before any chunk moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub content_id: String,
    pub size: u64,
    pub mime_type: String,
    pub owner: PeerId,
    pub name: Option<String>,
}

/// Peer exchange entry: id plus an opaque transport locator when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub locator: Option<String>,
}

/// How a chunk request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Normal queued delivery.
    Fast,
    /// Escalated after a timeout: responder serves it ahead of queued packets.
    Reliable,
}

/// All control message kinds. Encoding is bincode; framing is length-prefix (see wire module).
/// Chunk payloads travel in their own binary frame (see `wire::encode_chunk_frame`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Hello {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
        locator: Option<String>,
        /// Newest public envelope timestamp held by the sender.
        latest_public_ts: u64,
    },
    PeerExchange {
        peers: Vec<PeerEntry>,
    },
    Ping {
        ts: Millis,
    },
    Pong {
        ts: Millis,
    },
    Envelope(Envelope),
    ContentMeta {
        announcement_id: String,
        sender: PeerId,
        scope: Target,
        meta: ContentMeta,
    },
    ContentMetaAck {
        ref_id: String,
    },
    ChunkGet {
        content_id: String,
        offset: u64,
        size: u64,
        request_id: String,
        mode: DeliveryMode,
    },
    HubPulse {
        slot: usize,
    },
    SyncRequest {
        since: u64,
    },
    SyncResponse {
        envelopes: Vec<Envelope>,
    },
}

/// Liveness beacon published on the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBeacon {
    pub peer_id: PeerId,
    pub ts: Millis,
    pub hub_index: Option<usize>,
    pub locator: Option<String>,
}
