//! Chunk math and part storage: split content into fixed-size offsets, strict completion, reassembly.

use std::collections::BTreeMap;

use crate::config::DEFAULT_CHUNK_SIZE;

fn effective(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Chunk start offsets covering `0..total_len`.
pub fn chunk_offsets(total_len: u64, chunk_size: u64) -> Vec<u64> {
    let size = effective(chunk_size);
    (0..total_len.div_ceil(size)).map(|i| i * size).collect()
}

/// Expected byte length of the chunk starting at `offset`, or None if `offset` is not a chunk start.
pub fn expected_len(offset: u64, total_len: u64, chunk_size: u64) -> Option<u64> {
    let size = effective(chunk_size);
    if offset % size != 0 || offset >= total_len {
        return None;
    }
    Some(size.min(total_len - offset))
}

/// Start offset of the chunk covering byte `pos`.
pub fn chunk_start(pos: u64, chunk_size: u64) -> u64 {
    let size = effective(chunk_size);
    pos - pos % size
}

/// Offset of the final chunk (0 for empty content).
pub fn last_chunk(total_len: u64, chunk_size: u64) -> u64 {
    if total_len == 0 {
        0
    } else {
        chunk_start(total_len - 1, chunk_size)
    }
}

/// Received chunk payloads keyed by offset.
#[derive(Debug, Default)]
pub struct Parts {
    received: BTreeMap<u64, Vec<u8>>,
}

impl Parts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload. A duplicate offset replaces the previous one.
    pub fn insert(&mut self, offset: u64, payload: Vec<u8>) {
        self.received.insert(offset, payload);
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.received.contains_key(&offset)
    }

    pub fn get(&self, offset: u64) -> Option<&[u8]> {
        self.received.get(&offset).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Summed byte length of every stored part.
    pub fn total_bytes(&self) -> u64 {
        self.received.values().map(|p| p.len() as u64).sum()
    }

    /// Strict completion: every expected offset present and the byte total equals `total_len`.
    pub fn is_complete(&self, total_len: u64, chunk_size: u64) -> bool {
        chunk_offsets(total_len, chunk_size)
            .iter()
            .all(|o| self.received.contains_key(o))
            && self.total_bytes() == total_len
    }

    /// Reassemble parts in offset order into a single blob. Call only when `is_complete()`.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes() as usize);
        for payload in self.received.values() {
            out.extend_from_slice(payload);
        }
        out
    }
}
