//! Content responder: locally held content and per-peer send queues with
//! backpressure against the transport's buffered-amount signal.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::Config;
use crate::core::OutboundAction;
use crate::identity::PeerId;
use crate::protocol::{ContentMeta, DeliveryMode};
use crate::wire::{encode_chunk_frame, ChunkFrameError, ChunkHeader, Packet};

/// Content id: hex SHA-256 of the bytes.
pub fn content_id_for(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Complete blobs this node can serve, shared with the stream bridge.
#[derive(Debug, Default)]
pub struct ContentStore {
    entries: HashMap<String, (ContentMeta, Arc<Vec<u8>>)>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: ContentMeta, bytes: Arc<Vec<u8>>) {
        self.entries.insert(meta.content_id.clone(), (meta, bytes));
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.entries.contains_key(content_id)
    }

    pub fn meta(&self, content_id: &str) -> Option<&ContentMeta> {
        self.entries.get(content_id).map(|(m, _)| m)
    }

    pub fn bytes(&self, content_id: &str) -> Option<&Arc<Vec<u8>>> {
        self.entries.get(content_id).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("content {0} not held locally")]
    UnknownContent(String),
    #[error("offset {offset} outside content of {size} bytes")]
    OutOfRange { offset: u64, size: u64 },
    #[error("chunk frame: {0}")]
    Frame(#[from] ChunkFrameError),
}

#[derive(Debug, Default)]
struct PeerQueue {
    packets: VecDeque<Packet>,
    /// Last buffered amount the transport reported, plus what we handed it since.
    buffered: u64,
}

pub struct Responder {
    cfg: Arc<Config>,
    store: ContentStore,
    queues: HashMap<PeerId, PeerQueue>,
}

impl Responder {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            store: ContentStore::new(),
            queues: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ContentStore {
        &mut self.store
    }

    /// Answer a GET: slice the local copy, frame it, queue it. Reliable requests jump the queue.
    pub fn on_chunk_request(
        &mut self,
        peer: &PeerId,
        content_id: &str,
        offset: u64,
        size: u64,
        request_id: String,
        mode: DeliveryMode,
        out: &mut Vec<OutboundAction>,
    ) -> Result<(), ResponderError> {
        let bytes = self
            .store
            .bytes(content_id)
            .ok_or_else(|| ResponderError::UnknownContent(content_id.to_string()))?;
        let total = bytes.len() as u64;
        if offset >= total {
            return Err(ResponderError::OutOfRange { offset, size: total });
        }
        let end = offset.saturating_add(size).min(total);
        let header = ChunkHeader {
            content_id: content_id.to_string(),
            offset,
            request_id,
        };
        let frame = encode_chunk_frame(&header, &bytes[offset as usize..end as usize])?;
        let q = self.queues.entry(peer.clone()).or_default();
        match mode {
            DeliveryMode::Reliable => q.packets.push_front(Packet::Chunk(frame)),
            DeliveryMode::Fast => q.packets.push_back(Packet::Chunk(frame)),
        }
        trace!(peer = %peer, content = %content_id, offset, queued = q.packets.len(), "chunk queued");
        Self::drain(peer, q, self.cfg.buffered_high_water, out);
        Ok(())
    }

    /// Transport's current outstanding bytes for `peer`.
    pub fn set_buffered_amount(&mut self, peer: &PeerId, amount: u64) {
        if let Some(q) = self.queues.get_mut(peer) {
            q.buffered = amount;
        }
    }

    /// Periodic drain of every queue, bounded by the high-water mark.
    pub fn flush(&mut self, out: &mut Vec<OutboundAction>) {
        let high_water = self.cfg.buffered_high_water;
        for (peer, q) in self.queues.iter_mut() {
            Self::drain(peer, q, high_water, out);
        }
    }

    fn drain(peer: &PeerId, q: &mut PeerQueue, high_water: u64, out: &mut Vec<OutboundAction>) {
        while q.buffered < high_water {
            let Some(packet) = q.packets.pop_front() else { break };
            q.buffered += packet.len() as u64;
            out.push(OutboundAction::Send(peer.clone(), packet));
        }
        if !q.packets.is_empty() {
            debug!(peer = %peer, queued = q.packets.len(), buffered = q.buffered, "send queue held back");
        }
    }

    pub fn queued(&self, peer: &PeerId) -> usize {
        self.queues.get(peer).map_or(0, |q| q.packets.len())
    }

    /// The connection is gone; its queue goes with it.
    pub fn drop_peer(&mut self, peer: &PeerId) {
        self.queues.remove(peer);
    }
}
