//! Transfer tasks: per-content download state machine. Want-queue, bounded in-flight window,
//! round-robin peer selection, timeout escalation and strict completion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunk::{self, Parts};
use crate::config::Config;
use crate::core::{push_message, OutboundAction};
use crate::identity::PeerId;
use crate::overlay::Overlay;
use crate::protocol::{ContentMeta, DeliveryMode, Message, Millis};
use crate::scheduler::{PeerRing, WantQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Active,
    Completed,
}

/// One open byte-range read against a task. `end` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub request_id: String,
    pub start: u64,
    pub end: u64,
    pub cursor: u64,
}

#[derive(Debug, Clone)]
struct Inflight {
    sent_at: Millis,
    peer: PeerId,
}

pub struct TransferTask {
    pub(crate) meta: ContentMeta,
    pub(crate) state: TaskState,
    pub(crate) parts: Parts,
    inflight: HashMap<u64, Inflight>,
    want: WantQueue,
    /// Offsets whose GET was escalated to reliable delivery after a timeout.
    escalated: HashSet<u64>,
    /// Timeouts per (offset, holder); a holder past `chunk_max_attempts` leaves the ring.
    timeouts: HashMap<(u64, PeerId), u32>,
    peers: PeerRing,
    /// Next offset the sequential prefetch will queue.
    seq_cursor: u64,
    /// Where sequential prefetch last (re)started.
    seq_anchor: u64,
    head_received: bool,
    last_reconnect_at: Option<Millis>,
    pub(crate) streams: BTreeMap<String, StreamRequest>,
    chunk_size: u64,
}

/// Result of handing a chunk to the manager.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// No task for that content (evicted or never started).
    NoTask,
    /// Already held.
    Duplicate,
    /// Wrong offset or length; re-requested.
    Malformed,
    Stored,
    /// Every chunk present and byte-exact; the assembled blob.
    Completed(Vec<u8>),
}

impl TransferTask {
    fn new(meta: ContentMeta, peers: Vec<PeerId>, cfg: &Config) -> Self {
        let chunk_size = cfg.chunk_size.max(1);
        let want = WantQueue::initial(meta.size, chunk_size, cfg.small_content_chunks);
        Self {
            meta,
            state: TaskState::Idle,
            parts: Parts::new(),
            inflight: HashMap::new(),
            want,
            escalated: HashSet::new(),
            timeouts: HashMap::new(),
            peers: PeerRing::new(peers),
            seq_cursor: chunk_size,
            seq_anchor: 0,
            head_received: false,
            last_reconnect_at: None,
            streams: BTreeMap::new(),
            chunk_size,
        }
    }

    pub fn content_id(&self) -> &str {
        &self.meta.content_id
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    pub fn want_offsets(&self) -> Vec<u64> {
        self.want.iter().copied().collect()
    }

    pub fn inflight_offsets(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.inflight.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn has_part(&self, offset: u64) -> bool {
        self.parts.contains(offset)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn holders(&self) -> &[PeerId] {
        self.peers.peers()
    }

    fn is_small(&self, cfg: &Config) -> bool {
        (chunk::chunk_offsets(self.meta.size, self.chunk_size).len() as u64) <= cfg.small_content_chunks
    }

    fn is_settled(&self, offset: u64) -> bool {
        self.parts.contains(offset) || self.inflight.contains_key(&offset)
    }

    fn queue(&mut self, offset: u64) {
        if offset < self.meta.size && !self.is_settled(offset) {
            self.want.push_back(offset);
        }
    }

    /// Pull `offset` to the front of the want-queue unless already held or requested.
    pub fn prioritize(&mut self, offset: u64) {
        if offset < self.meta.size && !self.is_settled(offset) {
            self.want.prioritize(offset);
        }
    }

    /// Sequential prefetch up to `prefetch_ahead_chunks` queued offsets. Runs once the head
    /// has landed, or earlier when a seek anchored the cursor away from it.
    fn refill(&mut self, cfg: &Config) {
        if self.is_completed() || (!self.head_received && self.seq_anchor == 0) {
            return;
        }
        while (self.want.len() as u64) < cfg.prefetch_ahead_chunks && self.seq_cursor < self.meta.size {
            let o = self.seq_cursor;
            self.seq_cursor += self.chunk_size;
            self.queue(o);
        }
        if self.want.is_empty() && self.inflight.is_empty() && self.seq_cursor >= self.meta.size {
            // Pointer ran off the end with holes left behind (seek, corrupt part): sweep them up.
            for o in chunk::chunk_offsets(self.meta.size, self.chunk_size) {
                self.queue(o);
            }
        }
    }

    /// Reset sequential prefetch when a range opens far from where it currently runs.
    /// Returns true if the old region was dropped.
    pub fn seek(&mut self, pos: u64, cfg: &Config) -> bool {
        let target = chunk::chunk_start(pos.min(self.meta.size.saturating_sub(1)), self.chunk_size);
        let slack = cfg.seek_distance_chunks * self.chunk_size;
        let behind = target + slack < self.seq_anchor;
        let ahead = target > self.seq_cursor + slack;
        if !(behind || ahead) {
            return false;
        }
        let window_end = target + cfg.prefetch_ahead_chunks * self.chunk_size;
        let head_pending = !self.head_received;
        let streams_need: HashSet<u64> = self
            .streams
            .values()
            .map(|s| chunk::chunk_start(s.cursor, self.chunk_size))
            .collect();
        // The head stays wanted until it lands; small-file detection hangs off it.
        let keep = |o: u64| (o >= target && o < window_end) || streams_need.contains(&o) || (head_pending && o == 0);
        self.want.retain(|o| keep(*o));
        self.inflight.retain(|o, _| keep(*o));
        debug!(content = %self.meta.content_id, from = self.seq_cursor, to = target, "seek resets prefetch");
        self.seq_cursor = target;
        self.seq_anchor = target;
        true
    }

    /// Attach a stream request and bump its first needed chunk.
    pub(crate) fn add_stream(&mut self, req: StreamRequest) {
        let first = chunk::chunk_start(req.cursor, self.chunk_size);
        self.streams.insert(req.request_id.clone(), req);
        self.prioritize(first);
    }

    pub(crate) fn remove_stream(&mut self, request_id: &str) -> bool {
        self.streams.remove(request_id).is_some()
    }

    /// Issue GETs while the window has room. Offsets with no reachable peer wait at the front.
    fn dispatch(&mut self, now: Millis, cfg: &Config, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        if self.is_completed() {
            return;
        }
        self.refill(cfg);
        while self.inflight.len() < cfg.parallel_window {
            let Some(offset) = self.want.pop() else { break };
            if self.is_settled(offset) {
                continue;
            }
            let pick = self.peers.pick(|p| overlay.is_open(p));
            if !pick.closed.is_empty() {
                let due = self
                    .last_reconnect_at
                    .map_or(true, |t| now.saturating_sub(t) >= cfg.reconnect_throttle_ms);
                if due {
                    self.last_reconnect_at = Some(now);
                    for p in &pick.closed {
                        overlay.connect_to(p, now, out);
                    }
                }
            }
            let Some(peer) = pick.chosen else {
                self.want.prioritize(offset);
                break;
            };
            let Some(size) = chunk::expected_len(offset, self.meta.size, self.chunk_size) else {
                continue;
            };
            let mode = if self.escalated.contains(&offset) {
                DeliveryMode::Reliable
            } else {
                DeliveryMode::Fast
            };
            push_message(
                out,
                &peer,
                &Message::ChunkGet {
                    content_id: self.meta.content_id.clone(),
                    offset,
                    size,
                    request_id: uuid::Uuid::new_v4().simple().to_string(),
                    mode,
                },
            );
            self.inflight.insert(offset, Inflight { sent_at: now, peer });
            self.state = TaskState::Active;
        }
    }

    fn on_chunk(&mut self, offset: u64, payload: Vec<u8>, from: &PeerId, cfg: &Config) -> ChunkOutcome {
        if self.is_completed() || self.parts.contains(offset) {
            return ChunkOutcome::Duplicate;
        }
        let expected = chunk::expected_len(offset, self.meta.size, self.chunk_size);
        if expected != Some(payload.len() as u64) {
            warn!(content = %self.meta.content_id, offset, len = payload.len(), ?expected, peer = %from, "malformed chunk");
            if expected.is_some() {
                self.inflight.remove(&offset);
                self.prioritize(offset);
            }
            return ChunkOutcome::Malformed;
        }
        self.inflight.remove(&offset);
        self.want.remove(offset);
        self.escalated.remove(&offset);
        self.timeouts.retain(|(o, _), _| *o != offset);
        self.parts.insert(offset, payload);
        self.peers.add(from.clone());
        self.state = TaskState::Active;

        if offset == 0 && !self.head_received {
            self.head_received = true;
            if self.is_small(cfg) {
                // Queue the whole tail now so a small file never stalls after its head.
                for o in chunk::chunk_offsets(self.meta.size, self.chunk_size) {
                    self.queue(o);
                }
                self.seq_cursor = self.meta.size;
            }
        }

        if self.parts.is_complete(self.meta.size, self.chunk_size) {
            self.state = TaskState::Completed;
            self.want.retain(|_| false);
            self.inflight.clear();
            self.escalated.clear();
            self.timeouts.clear();
            return ChunkOutcome::Completed(self.parts.assemble());
        }
        ChunkOutcome::Stored
    }
}

pub struct TransferManager {
    cfg: Arc<Config>,
    tasks: HashMap<String, TransferTask>,
}

impl TransferManager {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            tasks: HashMap::new(),
        }
    }

    /// Create a task on first demand. Returns true if it was created.
    pub fn start_task(&mut self, meta: ContentMeta, peers: Vec<PeerId>) -> bool {
        if self.tasks.contains_key(&meta.content_id) {
            if let Some(task) = self.tasks.get_mut(&meta.content_id) {
                for p in peers {
                    task.peers.add(p);
                }
            }
            return false;
        }
        info!(content = %meta.content_id, size = meta.size, holders = peers.len(), "transfer task started");
        let task = TransferTask::new(meta, peers, &self.cfg);
        self.tasks.insert(task.meta.content_id.clone(), task);
        true
    }

    pub fn task(&self, content_id: &str) -> Option<&TransferTask> {
        self.tasks.get(content_id)
    }

    pub fn task_mut(&mut self, content_id: &str) -> Option<&mut TransferTask> {
        self.tasks.get_mut(content_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add_holder(&mut self, content_id: &str, peer: PeerId) {
        if let Some(task) = self.tasks.get_mut(content_id) {
            task.peers.add(peer);
        }
    }

    /// Issue as many requests as the window allows for one task.
    pub fn request_next(&mut self, content_id: &str, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        let cfg = self.cfg.clone();
        if let Some(task) = self.tasks.get_mut(content_id) {
            task.dispatch(now, &cfg, overlay, out);
        }
    }

    /// Re-run dispatch for every task (e.g. after a connection opened).
    pub fn dispatch_all(&mut self, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        let cfg = self.cfg.clone();
        for task in self.tasks.values_mut() {
            task.dispatch(now, &cfg, overlay, out);
        }
    }

    /// Store an arriving chunk and keep the pipeline full.
    pub fn on_chunk_received(
        &mut self,
        content_id: &str,
        offset: u64,
        payload: Vec<u8>,
        from: &PeerId,
        now: Millis,
        overlay: &mut Overlay,
        out: &mut Vec<OutboundAction>,
    ) -> ChunkOutcome {
        let cfg = self.cfg.clone();
        let Some(task) = self.tasks.get_mut(content_id) else {
            return ChunkOutcome::NoTask;
        };
        let outcome = task.on_chunk(offset, payload, from, &cfg);
        match &outcome {
            ChunkOutcome::Completed(blob) => {
                info!(content = %content_id, bytes = blob.len(), "transfer complete");
            }
            ChunkOutcome::Stored | ChunkOutcome::Malformed => task.dispatch(now, &cfg, overlay, out),
            _ => {}
        }
        outcome
    }

    /// Ticked: requeue overdue requests at the front with escalated delivery. A holder that
    /// times out `chunk_max_attempts` times on one offset is dropped from the task, unless it
    /// is the last one known.
    pub fn check_timeouts(&mut self, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        let cfg = self.cfg.clone();
        for task in self.tasks.values_mut() {
            let overdue: Vec<(u64, PeerId)> = task
                .inflight
                .iter()
                .filter(|(_, f)| now.saturating_sub(f.sent_at) > cfg.chunk_timeout_ms)
                .map(|(o, f)| (*o, f.peer.clone()))
                .collect();
            for (offset, peer) in overdue {
                task.inflight.remove(&offset);
                task.escalated.insert(offset);
                task.want.prioritize(offset);
                let attempts = {
                    let n = task.timeouts.entry((offset, peer.clone())).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempts < cfg.chunk_max_attempts {
                    debug!(content = %task.meta.content_id, offset, peer = %peer, attempts, "chunk timed out, escalating");
                } else if task.peers.len() > 1 {
                    warn!(content = %task.meta.content_id, offset, peer = %peer, attempts, "holder keeps timing out, dropped from task");
                    task.peers.remove(&peer);
                    task.timeouts.retain(|(_, p), _| *p != peer);
                } else {
                    debug!(content = %task.meta.content_id, offset, peer = %peer, attempts, "last holder keeps timing out, kept");
                }
            }
            task.dispatch(now, &cfg, overlay, out);
        }
    }

    /// Free a completed task once no stream reads it.
    pub fn release_if_done(&mut self, content_id: &str) -> bool {
        let done = self
            .tasks
            .get(content_id)
            .map_or(false, |t| t.is_completed() && t.streams.is_empty());
        if done {
            self.tasks.remove(content_id);
            debug!(content = %content_id, "transfer task freed");
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Direction;
    use crate::wire::{decode_frame, Packet};

    const CHUNK: u64 = 100;

    fn cfg() -> Config {
        Config {
            chunk_size: CHUNK,
            ..Config::default()
        }
    }

    fn meta(size: u64) -> ContentMeta {
        ContentMeta {
            content_id: "f1".into(),
            size,
            mime_type: "video/mp4".into(),
            owner: PeerId::from("p-owner"),
            name: None,
        }
    }

    fn setup(cfg: Config, size: u64, open: bool) -> (TransferManager, Overlay) {
        let cfg = Arc::new(cfg);
        let mut ov = Overlay::new(PeerId::from("p-me"), "me".into(), None, cfg.clone());
        if open {
            ov.on_open(&PeerId::from("p-owner"), Direction::Outbound, 0, 0, &mut Vec::new());
        }
        let mut tm = TransferManager::new(cfg);
        tm.start_task(meta(size), vec![PeerId::from("p-owner")]);
        (tm, ov)
    }

    fn gets(out: &[OutboundAction]) -> Vec<(u64, u64, DeliveryMode)> {
        out.iter()
            .filter_map(|a| match a {
                OutboundAction::Send(_, Packet::Control(b)) => match decode_frame(b).unwrap().0 {
                    Message::ChunkGet { offset, size, mode, .. } => Some((offset, size, mode)),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn bytes_for(offset: u64, len: u64) -> Vec<u8> {
        (offset..offset + len).map(|i| i as u8).collect()
    }

    fn owner() -> PeerId {
        PeerId::from("p-owner")
    }

    #[test]
    fn small_file_requests_head_then_queues_tail() {
        let (mut tm, mut ov) = setup(
            Config {
                parallel_window: 1,
                ..cfg()
            },
            3 * CHUNK,
            true,
        );
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        assert_eq!(gets(&out), vec![(0, CHUNK, DeliveryMode::Fast)]);
        assert_eq!(tm.task("f1").unwrap().state(), TaskState::Active);

        out.clear();
        let r = tm.on_chunk_received("f1", 0, bytes_for(0, CHUNK), &owner(), 10, &mut ov, &mut out);
        assert_eq!(r, ChunkOutcome::Stored);
        let task = tm.task("f1").unwrap();
        assert_eq!(task.inflight_offsets(), vec![CHUNK]);
        assert_eq!(task.want_offsets(), vec![2 * CHUNK]);
        assert_eq!(gets(&out), vec![(CHUNK, CHUNK, DeliveryMode::Fast)]);
    }

    #[test]
    fn small_file_with_wide_window_requests_all_after_head() {
        let (mut tm, mut ov) = setup(cfg(), 3 * CHUNK, true);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        assert_eq!(gets(&out).len(), 1);
        out.clear();
        tm.on_chunk_received("f1", 0, bytes_for(0, CHUNK), &owner(), 10, &mut ov, &mut out);
        let offsets: Vec<u64> = gets(&out).into_iter().map(|g| g.0).collect();
        assert_eq!(offsets, vec![CHUNK, 2 * CHUNK]);
    }

    #[test]
    fn large_file_probes_tail_up_front() {
        let (mut tm, mut ov) = setup(cfg(), 10 * CHUNK + 5, true);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        assert_eq!(
            gets(&out),
            vec![(0, CHUNK, DeliveryMode::Fast), (10 * CHUNK, 5, DeliveryMode::Fast)]
        );
    }

    #[test]
    fn window_bounds_inflight() {
        let (mut tm, mut ov) = setup(
            Config {
                parallel_window: 3,
                ..cfg()
            },
            40 * CHUNK,
            true,
        );
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        tm.on_chunk_received("f1", 0, bytes_for(0, CHUNK), &owner(), 1, &mut ov, &mut out);
        let task = tm.task("f1").unwrap();
        assert_eq!(task.inflight_offsets().len(), 3);
        for o in task.inflight_offsets() {
            assert!(!task.want_offsets().contains(&o));
            assert!(!task.has_part(o));
        }
    }

    #[test]
    fn completes_only_when_byte_exact() {
        let (mut tm, mut ov) = setup(cfg(), 2 * CHUNK + 50, true);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        tm.on_chunk_received("f1", 0, bytes_for(0, CHUNK), &owner(), 1, &mut ov, &mut out);
        // Corrupt: wrong length for the middle chunk.
        let r = tm.on_chunk_received("f1", CHUNK, vec![0; 99], &owner(), 2, &mut ov, &mut out);
        assert_eq!(r, ChunkOutcome::Malformed);
        let r = tm.on_chunk_received("f1", 2 * CHUNK, bytes_for(2 * CHUNK, 50), &owner(), 3, &mut ov, &mut out);
        assert_eq!(r, ChunkOutcome::Stored);
        assert!(!tm.task("f1").unwrap().is_completed());
        assert!(tm.task("f1").unwrap().inflight_offsets().contains(&CHUNK));

        match tm.on_chunk_received("f1", CHUNK, bytes_for(CHUNK, CHUNK), &owner(), 4, &mut ov, &mut out) {
            ChunkOutcome::Completed(blob) => {
                assert_eq!(blob.len() as u64, 2 * CHUNK + 50);
                assert_eq!(blob, bytes_for(0, 2 * CHUNK + 50));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(tm.release_if_done("f1"));
        assert!(tm.task("f1").is_none());
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let (mut tm, mut ov) = setup(cfg(), 2 * CHUNK, true);
        let mut out = Vec::new();
        let r = tm.on_chunk_received("f1", 50, vec![0; 100], &owner(), 1, &mut ov, &mut out);
        assert_eq!(r, ChunkOutcome::Malformed);
    }

    #[test]
    fn chunk_for_unknown_task_is_noop() {
        let (mut tm, mut ov) = setup(cfg(), CHUNK, true);
        let mut out = Vec::new();
        let r = tm.on_chunk_received("gone", 0, vec![0; 10], &owner(), 1, &mut ov, &mut out);
        assert_eq!(r, ChunkOutcome::NoTask);
        assert!(out.is_empty());
    }

    #[test]
    fn timeout_requeues_at_front_and_escalates() {
        let c = cfg();
        let (mut tm, mut ov) = setup(c.clone(), 3 * CHUNK, true);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        out.clear();
        tm.check_timeouts(c.chunk_timeout_ms, &mut ov, &mut out);
        assert!(gets(&out).is_empty());
        tm.check_timeouts(c.chunk_timeout_ms + 1, &mut ov, &mut out);
        assert_eq!(gets(&out), vec![(0, CHUNK, DeliveryMode::Reliable)]);
    }

    #[test]
    fn no_open_peer_defers_and_throttles_reconnect() {
        let c = cfg();
        let (mut tm, mut ov) = setup(c.clone(), 3 * CHUNK, false);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        assert!(gets(&out).is_empty());
        assert!(out.iter().any(|a| matches!(a, OutboundAction::Connect { .. })));
        assert_eq!(tm.task("f1").unwrap().want_offsets(), vec![0]);

        // Still connecting: the overlay guard and the throttle keep this quiet.
        ov.on_closed(&owner());
        out.clear();
        tm.request_next("f1", 1_000, &mut ov, &mut out);
        assert!(out.is_empty());
        tm.request_next("f1", c.reconnect_throttle_ms, &mut ov, &mut out);
        assert!(out.iter().any(|a| matches!(a, OutboundAction::Connect { .. })));

        ov.on_open(&owner(), Direction::Outbound, 6_000, 0, &mut Vec::new());
        out.clear();
        tm.dispatch_all(6_000, &mut ov, &mut out);
        assert_eq!(gets(&out), vec![(0, CHUNK, DeliveryMode::Fast)]);
    }

    #[test]
    fn seek_far_clears_old_region() {
        let (mut tm, mut ov) = setup(
            Config {
                parallel_window: 4,
                ..cfg()
            },
            100 * CHUNK,
            true,
        );
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        tm.on_chunk_received("f1", 0, bytes_for(0, CHUNK), &owner(), 1, &mut ov, &mut out);
        let c = cfg();
        let task = tm.task_mut("f1").unwrap();
        assert!(task.want_offsets().contains(&(10 * CHUNK)));

        assert!(!task.seek(3 * CHUNK, &c));
        assert!(task.seek(60 * CHUNK + 7, &c));
        assert!(task.want_offsets().iter().all(|o| *o >= 60 * CHUNK));
        assert!(task.inflight_offsets().iter().all(|o| *o >= 60 * CHUNK || *o == 99 * CHUNK));

        out.clear();
        tm.request_next("f1", 2, &mut ov, &mut out);
        let first: Vec<u64> = gets(&out).into_iter().map(|g| g.0).collect();
        assert_eq!(first.first(), Some(&(60 * CHUNK)));
    }

    #[test]
    fn far_range_on_fresh_task_prefetches_and_keeps_head() {
        let c = cfg();
        let (mut tm, mut ov) = setup(c.clone(), 100 * CHUNK, true);
        let task = tm.task_mut("f1").unwrap();
        assert!(task.seek(60 * CHUNK, &c));
        task.add_stream(StreamRequest {
            request_id: "r1".into(),
            start: 60 * CHUNK,
            end: 100 * CHUNK - 1,
            cursor: 60 * CHUNK,
        });
        assert_eq!(task.want_offsets(), vec![60 * CHUNK, 0]);

        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        let sent: Vec<u64> = gets(&out).into_iter().map(|g| g.0).collect();
        assert_eq!(sent.len(), c.parallel_window);
        assert_eq!(&sent[..3], &[60 * CHUNK, 0, 61 * CHUNK]);

        out.clear();
        tm.on_chunk_received("f1", 60 * CHUNK, bytes_for(60 * CHUNK, CHUNK), &owner(), 1, &mut ov, &mut out);
        let task = tm.task("f1").unwrap();
        assert_eq!(task.inflight_offsets().len(), c.parallel_window);
        assert!(task.inflight_offsets().contains(&0));
        // Prefetch moved on past the first window.
        assert!(task.want_offsets().contains(&(82 * CHUNK)));
        assert_eq!(gets(&out).len(), 1);
    }

    #[test]
    fn tail_range_on_fresh_task_still_completes() {
        let c = cfg();
        let size = 20 * CHUNK;
        let (mut tm, mut ov) = setup(c.clone(), size, true);
        let task = tm.task_mut("f1").unwrap();
        task.seek(size - 50, &c);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        let mut next: Vec<u64> = gets(&out).into_iter().map(|g| g.0).collect();
        assert_eq!(next, vec![0, 19 * CHUNK]);

        // Answer every GET as it goes out until nothing is left to ask for.
        let mut now = 1;
        let mut blob = None;
        while let Some(offset) = next.pop() {
            out.clear();
            now += 1;
            match tm.on_chunk_received("f1", offset, bytes_for(offset, CHUNK), &owner(), now, &mut ov, &mut out) {
                ChunkOutcome::Completed(b) => blob = Some(b),
                ChunkOutcome::Stored => {}
                other => panic!("unexpected {:?} for {}", other, offset),
            }
            next.extend(gets(&out).into_iter().map(|g| g.0));
        }
        assert_eq!(blob, Some(bytes_for(0, size)));
    }

    #[test]
    fn holder_dropped_after_repeated_timeouts() {
        let c = Config {
            parallel_window: 1,
            chunk_max_attempts: 2,
            ..cfg()
        };
        let cfg = Arc::new(c.clone());
        let slow = PeerId::from("p-slow");
        let mut ov = Overlay::new(PeerId::from("p-me"), "me".into(), None, cfg.clone());
        ov.on_open(&slow, Direction::Outbound, 0, 0, &mut Vec::new());
        let mut tm = TransferManager::new(cfg);
        tm.start_task(meta(3 * CHUNK), vec![slow.clone(), owner()]);

        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        assert_eq!(gets(&out).len(), 1);

        let step = c.chunk_timeout_ms + 1;
        out.clear();
        tm.check_timeouts(step, &mut ov, &mut out);
        assert_eq!(gets(&out), vec![(0, CHUNK, DeliveryMode::Reliable)]);
        assert!(tm.task("f1").unwrap().holders().contains(&slow));

        out.clear();
        tm.check_timeouts(2 * step, &mut ov, &mut out);
        assert_eq!(tm.task("f1").unwrap().holders(), &[owner()]);
        assert!(gets(&out).is_empty());
        assert_eq!(tm.task("f1").unwrap().want_offsets()[0], 0);

        ov.on_open(&owner(), Direction::Outbound, 2 * step, 0, &mut Vec::new());
        out.clear();
        tm.dispatch_all(2 * step, &mut ov, &mut out);
        let to: Vec<&PeerId> = out
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(p, _) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(to, vec![&owner()]);
    }

    #[test]
    fn last_holder_is_never_dropped() {
        let c = Config {
            chunk_max_attempts: 1,
            ..cfg()
        };
        let (mut tm, mut ov) = setup(c.clone(), 3 * CHUNK, true);
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        out.clear();
        tm.check_timeouts(c.chunk_timeout_ms + 1, &mut ov, &mut out);
        assert_eq!(tm.task("f1").unwrap().holders(), &[owner()]);
        assert_eq!(gets(&out), vec![(0, CHUNK, DeliveryMode::Reliable)]);
    }

    #[test]
    fn invariant_offset_in_one_place() {
        let (mut tm, mut ov) = setup(
            Config {
                parallel_window: 2,
                ..cfg()
            },
            20 * CHUNK,
            true,
        );
        let mut out = Vec::new();
        tm.request_next("f1", 0, &mut ov, &mut out);
        for (i, o) in [0u64, 19, 1, 2].iter().enumerate() {
            let off = o * CHUNK;
            tm.on_chunk_received("f1", off, bytes_for(off, CHUNK), &owner(), i as u64, &mut ov, &mut out);
            let task = tm.task_mut("f1").unwrap();
            task.prioritize(5 * CHUNK);
            let want = task.want_offsets();
            let inflight = task.inflight_offsets();
            for x in chunk::chunk_offsets(20 * CHUNK, CHUNK) {
                let places = [task.has_part(x), inflight.contains(&x), want.contains(&x)]
                    .iter()
                    .filter(|b| **b)
                    .count();
                assert!(places <= 1, "offset {} in {} places", x, places);
            }
        }
    }
}
