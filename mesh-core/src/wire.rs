//! Framing. Control: length-prefix (4 bytes LE) + bincode payload.
//! Chunk data: 1-byte header length + UTF-8 JSON header + raw payload.

use serde::{Deserialize, Serialize};

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 << 20;
const MAX_CHUNK_HEADER_LEN: usize = u8::MAX as usize;

/// One transport-level packet. Mirrors a data channel carrying either structured or binary messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control(Vec<u8>),
    Chunk(Vec<u8>),
}

impl Packet {
    pub fn len(&self) -> usize {
        match self {
            Packet::Control(b) | Packet::Chunk(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Control frame: u32 LE payload length, then the bincode-encoded `Message`.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge)?;
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend(body);
    Ok(frame)
}

pub fn control_packet(msg: &Message) -> Result<Packet, FrameEncodeError> {
    encode_frame(msg).map(Packet::Control)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("bincode encode: {0}")]
    Encode(#[from] bincode::Error),
    #[error("control frame exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
}

/// Decode the control frame at the front of `bytes`, returning it with the byte count consumed.
/// A short buffer yields `NeedMore`; nothing is consumed until a whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some((prefix, rest)) = bytes.split_first_chunk::<LEN_SIZE>() else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_le_bytes(*prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let body = rest.get(..len as usize).ok_or(FrameDecodeError::NeedMore)?;
    let msg = bincode::deserialize(body)?;
    Ok((msg, LEN_SIZE + body.len()))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete control frame")]
    NeedMore,
    #[error("control frame exceeds {} bytes", MAX_FRAME_LEN)]
    TooLarge,
    #[error("bincode decode: {0}")]
    Decode(#[from] bincode::Error),
}

/// JSON header of a chunk data frame. Field names are fixed for interop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub content_id: String,
    pub offset: u64,
    pub request_id: String,
}

/// Frame a chunk: header length byte, JSON header, payload.
pub fn encode_chunk_frame(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, ChunkFrameError> {
    let json = serde_json::to_vec(header)?;
    if json.len() > MAX_CHUNK_HEADER_LEN {
        return Err(ChunkFrameError::HeaderTooLarge(json.len()));
    }
    let mut out = Vec::with_capacity(1 + json.len() + payload.len());
    out.push(json.len() as u8);
    out.extend_from_slice(&json);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a chunk frame into its header and payload slice.
pub fn decode_chunk_frame(bytes: &[u8]) -> Result<(ChunkHeader, &[u8]), ChunkFrameError> {
    let (&hlen, rest) = bytes.split_first().ok_or(ChunkFrameError::Truncated)?;
    let hlen = hlen as usize;
    if rest.len() < hlen {
        return Err(ChunkFrameError::Truncated);
    }
    let header: ChunkHeader = serde_json::from_slice(&rest[..hlen])?;
    Ok((header, &rest[hlen..]))
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkFrameError {
    #[error("chunk frame truncated")]
    Truncated,
    #[error("chunk header too large ({0} bytes)")]
    HeaderTooLarge(usize),
    #[error("chunk header json: {0}")]
    Json(#[from] serde_json::Error),
}
