//! Chunk scheduling: round-robin peer selection and want-queue ordering.

use std::collections::VecDeque;

use crate::chunk;
use crate::identity::PeerId;

/// Result of one peer pick: the chosen open peer, plus known peers skipped because they had no open connection.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pick {
    pub chosen: Option<PeerId>,
    pub closed: Vec<PeerId>,
}

/// Round-robin over a task's known holders.
#[derive(Debug, Default)]
pub struct PeerRing {
    peers: Vec<PeerId>,
    next: usize,
}

impl PeerRing {
    pub fn new(peers: Vec<PeerId>) -> Self {
        let mut ring = Self::default();
        for p in peers {
            ring.add(p);
        }
        ring
    }

    /// Add a holder; duplicates are ignored.
    pub fn add(&mut self, peer: PeerId) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget a holder; the rotation continues with whoever followed it.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(idx) = self.peers.iter().position(|p| p == peer) else {
            return false;
        };
        self.peers.remove(idx);
        if idx < self.next {
            self.next -= 1;
        }
        if self.next >= self.peers.len() {
            self.next = 0;
        }
        true
    }

    /// Next peer with an open connection, starting after the previous pick.
    pub fn pick(&mut self, is_open: impl Fn(&PeerId) -> bool) -> Pick {
        let mut out = Pick::default();
        let n = self.peers.len();
        for i in 0..n {
            let idx = (self.next + i) % n;
            let peer = &self.peers[idx];
            if is_open(peer) {
                self.next = (idx + 1) % n;
                out.chosen = Some(peer.clone());
                return out;
            }
            out.closed.push(peer.clone());
        }
        out
    }
}

/// Ordered want-queue of chunk offsets.
#[derive(Debug, Default)]
pub struct WantQueue {
    queue: VecDeque<u64>,
}

impl WantQueue {
    /// Initial demand: head first. Content of more than `small_chunks` chunks also probes
    /// the final chunk up front for duration/seek estimation.
    pub fn initial(total_len: u64, chunk_size: u64, small_chunks: u64) -> Self {
        let mut queue = VecDeque::new();
        if total_len > 0 {
            queue.push_back(0);
            let count = chunk::chunk_offsets(total_len, chunk_size).len() as u64;
            if count > small_chunks {
                queue.push_back(chunk::last_chunk(total_len, chunk_size));
            }
        }
        Self { queue }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.queue.contains(&offset)
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.queue.pop_front()
    }

    pub fn push_back(&mut self, offset: u64) {
        if !self.contains(offset) {
            self.queue.push_back(offset);
        }
    }

    /// Move (or insert) `offset` to the front.
    pub fn prioritize(&mut self, offset: u64) {
        self.queue.retain(|o| *o != offset);
        self.queue.push_front(offset);
    }

    pub fn remove(&mut self, offset: u64) {
        self.queue.retain(|o| *o != offset);
    }

    /// Drop every queued offset for which `keep` is false.
    pub fn retain(&mut self, keep: impl FnMut(&u64) -> bool) {
        self.queue.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.queue.iter()
    }
}
