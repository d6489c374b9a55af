//! Stream bridge: byte-range reads against content that may still be arriving.
//! Range parsing, the META response head, and the serving loop over a task's parts.

use thiserror::Error;

use crate::chunk;
use crate::protocol::ContentMeta;
use crate::transfer::{StreamRequest, TransferTask};

/// Inclusive byte range resolved against a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    /// False when the request carried no Range header (200 instead of 206).
    pub partial: bool,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header: {0}")]
    Malformed(String),
    #[error("range not satisfiable for size {size}")]
    Unsatisfiable { size: u64 },
}

impl RangeError {
    /// HTTP status the byte-range server answers with.
    pub fn status(&self) -> u16 {
        match self {
            RangeError::Malformed(_) => 400,
            RangeError::Unsatisfiable { .. } => 416,
        }
    }
}

/// Parse `bytes=a-b`, `bytes=a-` or `bytes=-n` against `size`, clamping the end.
/// Only the first range of a multi-range request is honoured.
pub fn parse_range(header: Option<&str>, size: u64) -> Result<ByteRange, RangeError> {
    if size == 0 {
        return Err(RangeError::Unsatisfiable { size });
    }
    let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(ByteRange {
            start: 0,
            end: size - 1,
            partial: false,
        });
    };
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;
    let first = spec.split(',').next().unwrap_or_default().trim();
    let (a, b) = first
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;
    let num = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| RangeError::Malformed(header.to_string()))
    };
    let (start, end) = match (a.trim().is_empty(), b.trim().is_empty()) {
        (true, true) => return Err(RangeError::Malformed(header.to_string())),
        (true, false) => {
            let suffix = num(b)?;
            if suffix == 0 {
                return Err(RangeError::Unsatisfiable { size });
            }
            (size - suffix.min(size), size - 1)
        }
        (false, true) => (num(a)?, size - 1),
        (false, false) => {
            let (s, e) = (num(a)?, num(b)?);
            if e < s {
                return Err(RangeError::Malformed(header.to_string()));
            }
            (s, e.min(size - 1))
        }
    };
    if start >= size {
        return Err(RangeError::Unsatisfiable { size });
    }
    Ok(ByteRange {
        start,
        end,
        partial: true,
    })
}

/// META response: everything a media consumer needs before any data arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub size: u64,
    pub mime_type: String,
    pub start: u64,
    pub end: u64,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(meta: &ContentMeta, range: &ByteRange) -> Self {
        let mut headers = vec![
            ("Content-Type".to_string(), meta.mime_type.clone()),
            ("Content-Length".to_string(), range.len().to_string()),
            ("Accept-Ranges".to_string(), "bytes".to_string()),
        ];
        if range.partial {
            headers.push((
                "Content-Range".to_string(),
                format!("bytes {}-{}/{}", range.start, range.end, meta.size),
            ));
        }
        Self {
            status: if range.partial { 206 } else { 200 },
            size: meta.size,
            mime_type: meta.mime_type.clone(),
            start: range.start,
            end: range.end,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Frames toward the byte-range consumer, keyed by request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Meta { request_id: String, head: ResponseHead },
    Data { request_id: String, bytes: Vec<u8> },
    End { request_id: String },
    Error { request_id: String, status: u16, message: String },
}

impl StreamEvent {
    pub fn request_id(&self) -> &str {
        match self {
            StreamEvent::Meta { request_id, .. }
            | StreamEvent::Data { request_id, .. }
            | StreamEvent::End { request_id }
            | StreamEvent::Error { request_id, .. } => request_id,
        }
    }
}

/// Emit what one request can take from the available chunks. Returns the missing
/// chunk offset it stopped on, or None once the request has ended.
fn advance(
    req: &mut StreamRequest,
    chunk_size: u64,
    get: impl Fn(u64) -> Option<Vec<u8>>,
    out: &mut Vec<StreamEvent>,
) -> Option<u64> {
    while req.cursor <= req.end {
        let base = chunk::chunk_start(req.cursor, chunk_size);
        let Some(part) = get(base) else {
            return Some(base);
        };
        let from = (req.cursor - base) as usize;
        let to = ((req.end + 1 - base) as usize).min(part.len());
        if from >= to {
            return Some(base);
        }
        out.push(StreamEvent::Data {
            request_id: req.request_id.clone(),
            bytes: part[from..to].to_vec(),
        });
        req.cursor = base + to as u64;
    }
    out.push(StreamEvent::End {
        request_id: req.request_id.clone(),
    });
    None
}

/// Serving loop over a task: every open request drains as far as the parts allow;
/// finished requests are dropped and each stall re-prioritizes its chunk.
/// Returns the ids of the requests that ended.
pub fn serve(task: &mut TransferTask, out: &mut Vec<StreamEvent>) -> Vec<String> {
    let chunk_size = task.chunk_size();
    let mut ended = Vec::new();
    let mut missing = Vec::new();
    for (id, req) in task.streams.iter_mut() {
        let parts = &task.parts;
        match advance(req, chunk_size, |o| parts.get(o).map(<[u8]>::to_vec), out) {
            Some(offset) => missing.push(offset),
            None => ended.push(id.clone()),
        }
    }
    for id in &ended {
        task.remove_stream(id);
    }
    // Reverse so the first request's need ends up at the very front.
    for offset in missing.into_iter().rev() {
        task.prioritize(offset);
    }
    ended
}

/// Serve a whole range from a locally held blob in chunk-sized DATA frames.
pub fn serve_blob(
    request_id: &str,
    blob: &[u8],
    range: &ByteRange,
    chunk_size: u64,
    out: &mut Vec<StreamEvent>,
) {
    let mut req = StreamRequest {
        request_id: request_id.to_string(),
        start: range.start,
        end: range.end,
        cursor: range.start,
    };
    let chunk_size = chunk_size.max(1);
    let get = |base: u64| {
        let s = base as usize;
        let e = (base + chunk_size).min(blob.len() as u64) as usize;
        (s < e).then(|| blob[s..e].to_vec())
    };
    if advance(&mut req, chunk_size, get, out).is_some() {
        out.push(StreamEvent::Error {
            request_id: request_id.to_string(),
            status: 500,
            message: "local content shorter than declared size".into(),
        });
    }
}
