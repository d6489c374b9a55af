//! Host-driven API: `Node` receives events from the host, returns actions.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::dissemination::{Dissemination, SendError};
use crate::hub::{HubElection, HubState};
use crate::identity::{PeerId, Target};
use crate::metadata::MetadataManager;
use crate::overlay::{Direction, Overlay};
use crate::protocol::{Body, ContentMeta, Envelope, Message, Millis, PresenceBeacon, PROTOCOL_VERSION};
use crate::responder::{content_id_for, Responder};
use crate::store::LocalStore;
use crate::stream::{self, RangeError, ResponseHead, StreamEvent};
use crate::transfer::{ChunkOutcome, StreamRequest, TransferManager};
use crate::wire::{self, ChunkFrameError, FrameDecodeError, Packet};

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Dial `peer`; `locator` is the transport address learned from gossip or presence.
    Connect { peer: PeerId, locator: Option<String> },
    Close(PeerId),
    Send(PeerId, Packet),
    /// Bind the well-known hub identity for `slot`; answer with `on_hub_bound`/`on_hub_bind_failed`.
    BindHub { slot: usize, hub_id: PeerId },
    ReleaseHub { slot: usize },
    PublishPresence(PresenceBeacon),
    App(AppEvent),
    Stream(StreamEvent),
}

/// Events for the application layer (chat UI, downloads).
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Envelope(Envelope),
    ContentMeta(ContentMeta),
    ContentReady { meta: ContentMeta, bytes: Arc<Vec<u8>> },
    PeerListChanged(Vec<PeerId>),
    SelfStatusChanged(NodeStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub hub_state: HubState,
    pub open_peers: usize,
    pub connecting_peers: usize,
    pub active_tasks: usize,
    pub presence_online: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode control frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("failed to decode chunk frame: {0}")]
    Chunk(#[from] ChunkFrameError),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("unknown content {0}")]
    UnknownContent(String),
    #[error(transparent)]
    Range(#[from] RangeError),
}

impl StreamError {
    /// HTTP status for the byte-range server.
    pub fn status(&self) -> u16 {
        match self {
            StreamError::UnknownContent(_) => 404,
            StreamError::Range(e) => e.status(),
        }
    }
}

/// Encode and queue a control message for `peer`.
pub(crate) fn push_message(out: &mut Vec<OutboundAction>, peer: &PeerId, msg: &Message) {
    match wire::control_packet(msg) {
        Ok(packet) => out.push(OutboundAction::Send(peer.clone(), packet)),
        Err(e) => warn!(peer = %peer, error = %e, "dropping unencodable message"),
    }
}

/// One mesh peer. Owns every component; all state changes go through here.
pub struct Node {
    cfg: Arc<Config>,
    self_id: PeerId,
    locator: Option<String>,
    overlay: Overlay,
    hub: HubElection,
    dissemination: Dissemination,
    metadata: MetadataManager,
    transfers: TransferManager,
    responder: Responder,
    store: Box<dyn LocalStore>,
    /// Open stream request id -> content id.
    streams: HashMap<String, String>,
    last_beacon_at: Option<Millis>,
    last_publish_at: Option<Millis>,
    last_status: Option<NodeStatus>,
    last_peers: Vec<PeerId>,
}

impl Node {
    pub fn new(
        self_id: PeerId,
        display_name: impl Into<String>,
        locator: Option<String>,
        cfg: Config,
        store: Box<dyn LocalStore>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let mut dissemination = Dissemination::new(self_id.clone(), cfg.clone());
        dissemination.restore_pending(store.as_ref());
        if dissemination.pending_len() > 0 {
            info!(pending = dissemination.pending_len(), "restored undelivered envelopes");
        }
        Self {
            overlay: Overlay::new(self_id.clone(), display_name.into(), locator.clone(), cfg.clone()),
            hub: HubElection::new(cfg.clone()),
            dissemination,
            metadata: MetadataManager::new(self_id.clone(), cfg.clone()),
            transfers: TransferManager::new(cfg.clone()),
            responder: Responder::new(cfg.clone()),
            store,
            streams: HashMap::new(),
            last_beacon_at: None,
            last_publish_at: None,
            last_status: None,
            last_peers: Vec::new(),
            cfg,
            self_id,
            locator,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn metadata(&self) -> &MetadataManager {
        &self.metadata
    }

    pub fn hub_state(&self) -> HubState {
        self.hub.state()
    }

    /// Meta for content we hold or have heard announced.
    pub fn content_meta(&self, content_id: &str) -> Option<&ContentMeta> {
        self.responder
            .store()
            .meta(content_id)
            .or_else(|| self.metadata.meta(content_id))
    }

    /// Complete local copy, if held.
    pub fn content(&self, content_id: &str) -> Option<Arc<Vec<u8>>> {
        self.responder.store().bytes(content_id).cloned()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            peer_id: self.self_id.clone(),
            hub_state: self.hub.state(),
            open_peers: self.overlay.open_count(),
            connecting_peers: self.overlay.connecting_count(),
            active_tasks: self.transfers.len(),
            presence_online: self.hub.presence_online(),
        }
    }

    /// Emit status / peer-list changes accumulated by the call that just ran.
    fn finish(&mut self, mut out: Vec<OutboundAction>) -> Vec<OutboundAction> {
        let peers = self.overlay.open_peers();
        if peers != self.last_peers {
            self.last_peers = peers.clone();
            out.push(OutboundAction::App(AppEvent::PeerListChanged(peers)));
        }
        let status = self.status();
        if self.last_status.as_ref() != Some(&status) {
            self.last_status = Some(status.clone());
            out.push(OutboundAction::App(AppEvent::SelfStatusChanged(status)));
        }
        out
    }

    // ---- transport events ----

    pub fn on_connection_open(&mut self, peer: &PeerId, direction: Direction, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        let latest = self.store.latest_public_ts();
        if self.overlay.on_open(peer, direction, now, latest, &mut out) {
            self.dissemination
                .retry_pending(now, &mut self.overlay, self.store.as_mut(), &mut out);
            self.transfers.dispatch_all(now, &mut self.overlay, &mut out);
        }
        self.finish(out)
    }

    pub fn on_connection_failed(&mut self, peer: &PeerId, _now: Millis) -> Vec<OutboundAction> {
        debug!(peer = %peer, "connection failed");
        self.drop_connection(peer);
        self.finish(Vec::new())
    }

    pub fn on_connection_closed(&mut self, peer: &PeerId, _now: Millis) -> Vec<OutboundAction> {
        self.drop_connection(peer);
        self.finish(Vec::new())
    }

    fn drop_connection(&mut self, peer: &PeerId) {
        self.overlay.on_closed(peer);
        self.responder.drop_peer(peer);
    }

    /// Transport's outstanding-buffered-bytes signal for `peer`.
    pub fn set_buffered_amount(&mut self, peer: &PeerId, amount: u64) {
        self.responder.set_buffered_amount(peer, amount);
    }

    /// Process one packet received from `peer`.
    pub fn on_packet(&mut self, peer: &PeerId, packet: Packet, now: Millis) -> Result<Vec<OutboundAction>, MessageError> {
        self.overlay.touch(peer, now);
        let mut out = Vec::new();
        match packet {
            Packet::Control(bytes) => {
                let (msg, _consumed) = wire::decode_frame(&bytes)?;
                self.on_message(peer, msg, now, &mut out);
            }
            Packet::Chunk(bytes) => {
                let (header, payload) = wire::decode_chunk_frame(&bytes)?;
                self.on_chunk(peer, &header.content_id, header.offset, payload.to_vec(), now, &mut out);
            }
        }
        Ok(self.finish(out))
    }

    fn on_message(&mut self, peer: &PeerId, msg: Message, now: Millis, out: &mut Vec<OutboundAction>) {
        match msg {
            Message::Hello {
                protocol_version,
                peer_id: _,
                display_name,
                locator,
                latest_public_ts,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(peer = %peer, protocol_version, "unsupported protocol version, closing");
                    self.drop_connection(peer);
                    out.push(OutboundAction::Close(peer.clone()));
                    return;
                }
                self.overlay.on_hello(peer, display_name, locator);
                let ours = self.store.latest_public_ts();
                if latest_public_ts > ours {
                    debug!(peer = %peer, since = ours, "requesting history");
                    push_message(out, peer, &Message::SyncRequest { since: ours });
                }
            }
            Message::PeerExchange { peers } => {
                let n = self.overlay.on_peer_exchange(peers, now, out);
                trace!(peer = %peer, new = n, "peer exchange");
            }
            Message::Ping { ts } => push_message(out, peer, &Message::Pong { ts }),
            Message::Pong { .. } => {}
            Message::Envelope(env) => {
                self.dissemination
                    .receive(env, peer, &self.overlay, self.store.as_mut(), out);
            }
            Message::ContentMeta {
                announcement_id,
                sender,
                scope: _,
                meta,
            } => {
                let content_id = meta.content_id.clone();
                self.metadata
                    .on_announcement(announcement_id, sender, meta, peer, out);
                for holder in self.metadata.holders(&content_id) {
                    self.transfers.add_holder(&content_id, holder);
                }
            }
            Message::ContentMetaAck { ref_id } => {
                self.metadata.on_ack(&ref_id, peer);
            }
            Message::ChunkGet {
                content_id,
                offset,
                size,
                request_id,
                mode,
            } => {
                if let Err(e) = self
                    .responder
                    .on_chunk_request(peer, &content_id, offset, size, request_id, mode, out)
                {
                    debug!(peer = %peer, error = %e, "chunk request not served");
                }
            }
            Message::HubPulse { slot } => self.hub.on_hub_pulse(slot, now),
            Message::SyncRequest { since } => {
                let envelopes = self.store.get_public_after(since, self.cfg.sync_limit);
                debug!(peer = %peer, since, count = envelopes.len(), "serving history");
                push_message(out, peer, &Message::SyncResponse { envelopes });
            }
            Message::SyncResponse { envelopes } => {
                for env in envelopes {
                    self.dissemination
                        .receive(env, peer, &self.overlay, self.store.as_mut(), out);
                }
            }
        }
    }

    fn on_chunk(
        &mut self,
        peer: &PeerId,
        content_id: &str,
        offset: u64,
        payload: Vec<u8>,
        now: Millis,
        out: &mut Vec<OutboundAction>,
    ) {
        let outcome = self
            .transfers
            .on_chunk_received(content_id, offset, payload, peer, now, &mut self.overlay, out);
        match outcome {
            ChunkOutcome::NoTask => {
                trace!(peer = %peer, content = %content_id, offset, "chunk for no task");
                return;
            }
            ChunkOutcome::Duplicate | ChunkOutcome::Malformed => return,
            ChunkOutcome::Stored => {}
            ChunkOutcome::Completed(blob) => {
                if let Some(meta) = self.transfers.task(content_id).map(|t| t.meta.clone()) {
                    let bytes = Arc::new(blob);
                    self.responder.store_mut().insert(meta.clone(), bytes.clone());
                    out.push(OutboundAction::App(AppEvent::ContentReady { meta, bytes }));
                }
            }
        }
        self.serve_streams(content_id, now, out);
    }

    /// Run the serving loop for one task, then refill its pipeline.
    fn serve_streams(&mut self, content_id: &str, now: Millis, out: &mut Vec<OutboundAction>) {
        let mut events = Vec::new();
        if let Some(task) = self.transfers.task_mut(content_id) {
            for id in stream::serve(task, &mut events) {
                self.streams.remove(&id);
            }
        }
        out.extend(events.into_iter().map(OutboundAction::Stream));
        if !self.transfers.release_if_done(content_id) {
            self.transfers
                .request_next(content_id, now, &mut self.overlay, out);
        }
    }

    // ---- presence & hub ----

    /// A presence beacon arrived (our own included: it proves the channel works).
    pub fn on_presence(&mut self, beacon: PresenceBeacon, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        self.last_beacon_at = Some(now);
        self.hub.set_presence_online(true);
        if beacon.peer_id != self.self_id {
            if let Some(loc) = beacon.locator {
                self.overlay.learn_locator(&beacon.peer_id, loc);
            }
            if !self.overlay.is_known(&beacon.peer_id) && self.overlay.open_count() < self.overlay.cap() {
                self.overlay.connect_to(&beacon.peer_id, now, &mut out);
            }
        }
        self.finish(out)
    }

    /// Host-reported presence channel health.
    pub fn set_presence_online(&mut self, online: bool, now: Millis) -> Vec<OutboundAction> {
        self.hub.set_presence_online(online);
        if online {
            self.last_beacon_at = Some(now);
        }
        self.finish(Vec::new())
    }

    pub fn on_hub_bound(&mut self, slot: usize, _now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        self.hub.on_hub_bound(slot, &mut self.overlay, &mut out);
        self.finish(out)
    }

    pub fn on_hub_bind_failed(&mut self, slot: usize, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        self.hub
            .on_hub_bind_failed(slot, now, &mut self.overlay, &mut out);
        self.finish(out)
    }

    // ---- ticks ----

    /// Maintenance tick (~1s).
    pub fn tick(&mut self, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        for peer in self.overlay.maintain(now, &mut out) {
            self.responder.drop_peer(&peer);
        }
        if self.hub.presence_online()
            && self
                .last_beacon_at
                .map_or(true, |t| now.saturating_sub(t) > self.cfg.presence_timeout_ms)
        {
            self.hub.set_presence_online(false);
        }
        self.hub.poll(now, &mut self.overlay, &mut out);
        self.hub.pulse(&self.overlay, &mut out);
        if self
            .last_publish_at
            .map_or(true, |t| now.saturating_sub(t) >= self.cfg.presence_interval_ms)
        {
            self.last_publish_at = Some(now);
            out.push(OutboundAction::PublishPresence(PresenceBeacon {
                peer_id: self.self_id.clone(),
                ts: now,
                hub_index: self.hub.self_slot(),
                locator: self.locator.clone(),
            }));
        }
        self.dissemination
            .retry_pending(now, &mut self.overlay, self.store.as_mut(), &mut out);
        self.metadata.poll(now, &mut self.overlay, &mut out);
        self.transfers
            .check_timeouts(now, &mut self.overlay, &mut out);
        self.finish(out)
    }

    /// Send-queue drain and delayed gossip (~100ms).
    pub fn fast_tick(&mut self, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        self.responder.flush(&mut out);
        self.overlay.flush_gossip(now, &mut out);
        self.finish(out)
    }

    // ---- application calls ----

    pub fn connect_to(&mut self, peer: &PeerId, now: Millis) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        self.overlay.connect_to(peer, now, &mut out);
        self.finish(out)
    }

    pub fn send_text(&mut self, target: Target, text: &str, now: Millis) -> Result<Vec<OutboundAction>, SendError> {
        let mut out = Vec::new();
        self.dissemination.send(
            target,
            Body::Text(text.to_string()),
            now,
            &mut self.overlay,
            self.store.as_mut(),
            &mut out,
        )?;
        Ok(self.finish(out))
    }

    /// Hold `bytes` for serving, post a content reference and announce its metadata.
    pub fn share_content(
        &mut self,
        bytes: Vec<u8>,
        mime_type: &str,
        name: Option<String>,
        scope: Target,
        now: Millis,
    ) -> Result<(ContentMeta, Vec<OutboundAction>), SendError> {
        if bytes.is_empty() {
            return Err(SendError::Empty);
        }
        let meta = ContentMeta {
            content_id: content_id_for(&bytes),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
            owner: self.self_id.clone(),
            name,
        };
        let mut out = Vec::new();
        self.dissemination.send(
            scope.clone(),
            Body::ContentRef(meta.clone()),
            now,
            &mut self.overlay,
            self.store.as_mut(),
            &mut out,
        )?;
        self.responder
            .store_mut()
            .insert(meta.clone(), Arc::new(bytes));
        self.metadata
            .announce(meta.clone(), scope, now, &mut self.overlay, &mut out);
        Ok((meta, self.finish(out)))
    }

    /// Fetch the whole content; `ContentReady` fires when it is complete.
    pub fn download(&mut self, content_id: &str, now: Millis) -> Result<Vec<OutboundAction>, StreamError> {
        let mut out = Vec::new();
        if let (Some(meta), Some(bytes)) = (
            self.responder.store().meta(content_id).cloned(),
            self.content(content_id),
        ) {
            out.push(OutboundAction::App(AppEvent::ContentReady { meta, bytes }));
            return Ok(self.finish(out));
        }
        let meta = self
            .metadata
            .meta(content_id)
            .cloned()
            .ok_or_else(|| StreamError::UnknownContent(content_id.to_string()))?;
        let holders = self.metadata.holders(content_id);
        self.transfers.start_task(meta, holders);
        self.transfers
            .request_next(content_id, now, &mut self.overlay, &mut out);
        Ok(self.finish(out))
    }

    /// Open a byte-range read. META goes out immediately; DATA/END follow as chunks land.
    pub fn open_stream(
        &mut self,
        request_id: &str,
        content_id: &str,
        range_header: Option<&str>,
        now: Millis,
    ) -> Result<Vec<OutboundAction>, StreamError> {
        let meta = self
            .content_meta(content_id)
            .cloned()
            .ok_or_else(|| StreamError::UnknownContent(content_id.to_string()))?;
        let range = stream::parse_range(range_header, meta.size)?;
        let mut events = vec![StreamEvent::Meta {
            request_id: request_id.to_string(),
            head: ResponseHead::new(&meta, &range),
        }];
        let mut out = Vec::new();
        if let Some(blob) = self.responder.store().bytes(content_id) {
            stream::serve_blob(request_id, blob, &range, self.cfg.chunk_size, &mut events);
            out.extend(events.into_iter().map(OutboundAction::Stream));
            return Ok(self.finish(out));
        }

        let holders = self.metadata.holders(content_id);
        self.transfers.start_task(meta, holders);
        if let Some(task) = self.transfers.task_mut(content_id) {
            task.seek(range.start, &self.cfg);
            task.add_stream(StreamRequest {
                request_id: request_id.to_string(),
                start: range.start,
                end: range.end,
                cursor: range.start,
            });
            self.streams
                .insert(request_id.to_string(), content_id.to_string());
            for id in stream::serve(task, &mut events) {
                self.streams.remove(&id);
            }
        }
        out.extend(events.into_iter().map(OutboundAction::Stream));
        self.transfers
            .request_next(content_id, now, &mut self.overlay, &mut out);
        Ok(self.finish(out))
    }

    /// Drop a range read. Returns false if it was unknown or already ended.
    pub fn cancel_stream(&mut self, request_id: &str) -> bool {
        let Some(content_id) = self.streams.remove(request_id) else {
            return false;
        };
        if let Some(task) = self.transfers.task_mut(&content_id) {
            task.remove_stream(request_id);
        }
        self.transfers.release_if_done(&content_id);
        debug!(request = %request_id, content = %content_id, "stream cancelled");
        true
    }

    /// Newest `limit` envelopes of one conversation, oldest first.
    pub fn recent(&self, limit: usize, scope: &Target, before_ts: Option<u64>) -> Vec<Envelope> {
        self.store.get_recent(limit, scope, before_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::{BTreeMap, HashSet, VecDeque};

    /// In-process mesh: routes `Send` actions between nodes over explicit links.
    struct Sim {
        nodes: BTreeMap<PeerId, Node>,
        links: HashSet<(PeerId, PeerId)>,
        app: HashMap<PeerId, Vec<AppEvent>>,
        streams: HashMap<PeerId, Vec<StreamEvent>>,
        now: Millis,
    }

    impl Sim {
        fn new(names: &[&str], cfg: Config) -> Self {
            let mut nodes = BTreeMap::new();
            for n in names {
                let id = PeerId::from(*n);
                let node = Node::new(id.clone(), *n, None, cfg.clone(), Box::new(MemoryStore::new()));
                nodes.insert(id, node);
            }
            Self {
                nodes,
                links: HashSet::new(),
                app: HashMap::new(),
                streams: HashMap::new(),
                now: 1_000,
            }
        }

        fn id(n: &str) -> PeerId {
            PeerId::from(n)
        }

        fn node(&mut self, n: &str) -> &mut Node {
            self.nodes.get_mut(&Self::id(n)).unwrap()
        }

        fn link(&mut self, a: &str, b: &str) {
            let (ia, ib) = (Self::id(a), Self::id(b));
            self.links.insert((ia.clone(), ib.clone()));
            self.links.insert((ib.clone(), ia.clone()));
            let now = self.now;
            let from_a = self.node(a).on_connection_open(&ib, Direction::Outbound, now);
            let from_b = self.node(b).on_connection_open(&ia, Direction::Inbound, now);
            self.route(&ia, from_a);
            self.route(&ib, from_b);
        }

        fn route(&mut self, origin: &PeerId, actions: Vec<OutboundAction>) {
            let mut queue: VecDeque<(PeerId, OutboundAction)> =
                actions.into_iter().map(|a| (origin.clone(), a)).collect();
            while let Some((from, action)) = queue.pop_front() {
                match action {
                    OutboundAction::Send(to, packet) => {
                        if !self.links.contains(&(from.clone(), to.clone())) {
                            continue;
                        }
                        let now = self.now;
                        let Some(node) = self.nodes.get_mut(&to) else { continue };
                        let acts = node.on_packet(&from, packet, now).unwrap();
                        queue.extend(acts.into_iter().map(|a| (to.clone(), a)));
                    }
                    OutboundAction::App(ev) => self.app.entry(from).or_default().push(ev),
                    OutboundAction::Stream(ev) => self.streams.entry(from).or_default().push(ev),
                    _ => {}
                }
            }
        }

        fn texts(&self, n: &str) -> Vec<String> {
            self.app
                .get(&Self::id(n))
                .map(|evs| {
                    evs.iter()
                        .filter_map(|e| match e {
                            AppEvent::Envelope(Envelope { body: Body::Text(t), .. }) => Some(t.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        }

        fn ready(&self, n: &str) -> Option<Arc<Vec<u8>>> {
            self.app.get(&Self::id(n))?.iter().find_map(|e| match e {
                AppEvent::ContentReady { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
        }
    }

    fn small_chunks() -> Config {
        Config {
            chunk_size: 128,
            ..Config::default()
        }
    }

    #[test]
    fn ttl_terminates_flood_along_chain() {
        let cfg = Config {
            default_ttl: 2,
            ..Config::default()
        };
        let names = ["n0", "n1", "n2", "n3", "n4"];
        let mut sim = Sim::new(&names, cfg);
        for w in names.windows(2) {
            sim.link(w[0], w[1]);
        }
        let now = sim.now;
        let acts = sim.node("n0").send_text(Target::Public, "hello", now).unwrap();
        sim.route(&Sim::id("n0"), acts);
        assert_eq!(sim.texts("n1"), vec!["hello"]);
        assert_eq!(sim.texts("n2"), vec!["hello"]);
        assert!(sim.texts("n3").is_empty());
        assert!(sim.texts("n4").is_empty());
    }

    #[test]
    fn flood_delivers_once_per_node() {
        let mut sim = Sim::new(&["a", "b", "c", "d"], Config::default());
        sim.link("a", "b");
        sim.link("b", "c");
        sim.link("c", "a");
        sim.link("c", "d");
        sim.link("b", "d");
        let now = sim.now;
        let acts = sim.node("a").send_text(Target::Public, "once", now).unwrap();
        sim.route(&Sim::id("a"), acts);
        for n in ["a", "b", "c", "d"] {
            assert_eq!(sim.texts(n), vec!["once"], "node {}", n);
        }
    }

    #[test]
    fn direct_message_reaches_only_target() {
        let mut sim = Sim::new(&["a", "b", "c"], Config::default());
        sim.link("a", "b");
        sim.link("a", "c");
        let now = sim.now;
        let acts = sim
            .node("a")
            .send_text(Target::Peer(Sim::id("b")), "psst", now)
            .unwrap();
        sim.route(&Sim::id("a"), acts);
        assert_eq!(sim.texts("b"), vec!["psst"]);
        assert!(sim.texts("c").is_empty());
        let history = sim.node("b").recent(10, &Target::Peer(Sim::id("a")), None);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn announce_ack_then_download() {
        let mut sim = Sim::new(&["a", "b"], small_chunks());
        sim.link("a", "b");
        let data: Vec<u8> = (0..3 * 128u32).map(|i| (i * 7 % 256) as u8).collect();
        let now = sim.now;
        let (meta, acts) = sim
            .node("a")
            .share_content(data.clone(), "image/png", Some("pic.png".into()), Target::Public, now)
            .unwrap();
        sim.route(&Sim::id("a"), acts);

        assert!(sim.app[&Sim::id("b")]
            .iter()
            .any(|e| matches!(e, AppEvent::ContentMeta(m) if *m == meta)));
        assert_eq!(sim.node("a").metadata().pending_len(), 0);
        assert_eq!(sim.node("b").metadata().holders(&meta.content_id), vec![Sim::id("a")]);

        let acts = sim.node("b").download(&meta.content_id, now).unwrap();
        sim.route(&Sim::id("b"), acts);
        assert_eq!(sim.ready("b").as_deref(), Some(&data));
        assert!(sim.node("b").transfers().is_empty());
        assert_eq!(sim.node("b").content(&meta.content_id).as_deref(), Some(&data));
    }

    #[test]
    fn stream_range_through_mesh() {
        let mut sim = Sim::new(&["a", "b"], small_chunks());
        sim.link("a", "b");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let now = sim.now;
        let (meta, acts) = sim
            .node("a")
            .share_content(data.clone(), "video/mp4", None, Target::Peer(Sim::id("b")), now)
            .unwrap();
        sim.route(&Sim::id("a"), acts);

        let acts = sim
            .node("b")
            .open_stream("r1", &meta.content_id, Some("bytes=200-499"), now)
            .unwrap();
        // META goes out before any data is available.
        match &acts[0] {
            OutboundAction::Stream(StreamEvent::Meta { head, .. }) => {
                assert_eq!(head.status, 206);
                assert_eq!(head.header("Content-Range"), Some("bytes 200-499/1000"));
                assert_eq!(head.header("Content-Length"), Some("300"));
            }
            other => panic!("expected META first, got {:?}", other),
        }
        sim.route(&Sim::id("b"), acts);

        let events = &sim.streams[&Sim::id("b")];
        let mut body = Vec::new();
        for ev in events {
            if let StreamEvent::Data { request_id, bytes } = ev {
                assert_eq!(request_id, "r1");
                body.extend_from_slice(bytes);
            }
        }
        assert_eq!(body, &data[200..500]);
        assert!(matches!(events.last(), Some(StreamEvent::End { request_id }) if request_id == "r1"));
        assert!(!sim.node("b").cancel_stream("r1"));
    }

    #[test]
    fn stream_waits_for_missing_chunks_and_cancel_is_safe() {
        let mut sim = Sim::new(&["a", "b"], small_chunks());
        sim.link("a", "b");
        let data = vec![9u8; 1000];
        let now = sim.now;
        let (meta, acts) = sim
            .node("a")
            .share_content(data, "video/mp4", None, Target::Public, now)
            .unwrap();
        sim.route(&Sim::id("a"), acts);

        // Nothing routed yet: GETs go out, no data can be served.
        let acts = sim
            .node("b")
            .open_stream("r1", &meta.content_id, Some("bytes=500-"), now)
            .unwrap();
        let gets = acts
            .iter()
            .filter(|a| matches!(a, OutboundAction::Send(..)))
            .count();
        assert!(gets > 0);
        assert!(!acts
            .iter()
            .any(|a| matches!(a, OutboundAction::Stream(StreamEvent::Data { .. }))));
        assert!(sim.node("b").cancel_stream("r1"));
        assert!(!sim.node("b").cancel_stream("r1"));

        // Chunks landing after the cancel feed the task, not the dropped request.
        sim.route(&Sim::id("b"), acts);
        assert!(sim.ready("b").is_some() || !sim.node("b").transfers().is_empty());
    }

    #[test]
    fn suffix_stream_on_fresh_task_then_download_completes() {
        let mut sim = Sim::new(&["a", "b"], small_chunks());
        sim.link("a", "b");
        let data: Vec<u8> = (0..20 * 128u32).map(|i| (i % 253) as u8).collect();
        let now = sim.now;
        let (meta, acts) = sim
            .node("a")
            .share_content(data.clone(), "video/mp4", None, Target::Public, now)
            .unwrap();
        sim.route(&Sim::id("a"), acts);

        let acts = sim
            .node("b")
            .open_stream("r1", &meta.content_id, Some("bytes=-100"), now)
            .unwrap();
        sim.route(&Sim::id("b"), acts);
        let body: Vec<u8> = sim.streams[&Sim::id("b")]
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, &data[data.len() - 100..]);

        let acts = sim.node("b").download(&meta.content_id, now).unwrap();
        sim.route(&Sim::id("b"), acts);
        for i in 1..=20 {
            let t = now + i * 1_000;
            let acts = sim.node("b").tick(t);
            sim.route(&Sim::id("b"), acts);
        }
        assert_eq!(sim.ready("b").as_deref(), Some(&data));
        assert!(sim.node("b").transfers().is_empty());
    }

    #[test]
    fn unknown_content_stream_errors() {
        let mut sim = Sim::new(&["a"], Config::default());
        let now = sim.now;
        let err = sim.node("a").open_stream("r", "nope", None, now).unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn own_content_streams_from_store() {
        let mut sim = Sim::new(&["a"], small_chunks());
        let now = sim.now;
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let (meta, _) = sim
            .node("a")
            .share_content(data.clone(), "audio/ogg", None, Target::Public, now)
            .unwrap();
        let acts = sim
            .node("a")
            .open_stream("r", &meta.content_id, Some("bytes=-50"), now)
            .unwrap();
        let body: Vec<u8> = acts
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Stream(StreamEvent::Data { bytes, .. }) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, &data[250..]);
        let err = sim
            .node("a")
            .open_stream("r2", &meta.content_id, Some("bytes=300-"), now)
            .unwrap_err();
        assert_eq!(err.status(), 416);
    }

    #[test]
    fn history_sync_on_hello() {
        let mut sim = Sim::new(&["a", "b"], Config::default());
        let mut store = MemoryStore::new();
        for i in 0..3u64 {
            store.save_envelope(&Envelope {
                id: format!("old{}", i),
                sender: Sim::id("z"),
                target: Target::Public,
                body: Body::Text(format!("old{}", i)),
                ts: 100 + i,
                ttl: 3,
            });
        }
        let a = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(store));
        sim.nodes.insert(Sim::id("a"), a);
        sim.link("a", "b");
        assert_eq!(sim.texts("b"), vec!["old0", "old1", "old2"]);
        assert!(sim.texts("a").is_empty());
    }

    #[test]
    fn ping_is_answered() {
        let mut node = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(MemoryStore::new()));
        let peer = Sim::id("b");
        node.on_connection_open(&peer, Direction::Inbound, 0);
        let ping = wire::control_packet(&Message::Ping { ts: 42 }).unwrap();
        let acts = node.on_packet(&peer, ping, 10).unwrap();
        let pong = wire::control_packet(&Message::Pong { ts: 42 }).unwrap();
        assert!(acts.contains(&OutboundAction::Send(peer, pong)));
    }

    #[test]
    fn garbage_packets_are_errors_and_orphan_chunks_noops() {
        let mut node = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(MemoryStore::new()));
        let peer = Sim::id("b");
        assert!(matches!(
            node.on_packet(&peer, Packet::Control(vec![1, 0]), 0),
            Err(MessageError::Decode(_))
        ));
        assert!(matches!(
            node.on_packet(&peer, Packet::Chunk(vec![200, 1, 2]), 0),
            Err(MessageError::Chunk(_))
        ));
        let header = wire::ChunkHeader {
            content_id: "gone".into(),
            offset: 0,
            request_id: "x".into(),
        };
        let frame = wire::encode_chunk_frame(&header, &[1, 2, 3]).unwrap();
        let acts = node.on_packet(&peer, Packet::Chunk(frame), 0).unwrap();
        assert!(acts.iter().all(|a| matches!(a, OutboundAction::App(_))));
    }

    #[test]
    fn presence_beacon_bootstraps_connection() {
        let mut node = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(MemoryStore::new()));
        let acts = node.on_presence(
            PresenceBeacon {
                peer_id: Sim::id("b"),
                ts: 1,
                hub_index: None,
                locator: Some("10.0.0.9:7000".into()),
            },
            5,
        );
        assert!(acts.iter().any(|a| matches!(
            a,
            OutboundAction::Connect { peer, locator: Some(l) } if peer.as_str() == "b" && l == "10.0.0.9:7000"
        )));
        assert!(node.status().presence_online);
    }

    #[test]
    fn isolated_node_self_promotes_and_advertises_slot() {
        let cfg = Config::default();
        let mut node = Node::new(Sim::id("a"), "a", Some("127.0.0.1:1".into()), cfg.clone(), Box::new(MemoryStore::new()));
        let acts = node.tick(0);
        assert!(acts.iter().any(|a| matches!(a, OutboundAction::PublishPresence(b) if b.hub_index.is_none())));
        let acts = node.tick(cfg.hub_decision_ms);
        let slot = acts
            .iter()
            .find_map(|a| match a {
                OutboundAction::BindHub { slot, .. } => Some(*slot),
                _ => None,
            })
            .expect("bind requested");
        let acts = node.on_hub_bound(slot, cfg.hub_decision_ms + 10);
        assert!(acts.iter().any(|a| matches!(
            a,
            OutboundAction::App(AppEvent::SelfStatusChanged(s)) if s.hub_state == HubState::SelfHub { slot }
        )));
        let acts = node.tick(cfg.presence_interval_ms);
        assert!(acts.iter().any(|a| matches!(a, OutboundAction::PublishPresence(b) if b.hub_index == Some(slot))));
    }

    #[test]
    fn pending_envelopes_survive_restart() {
        let mut store = MemoryStore::new();
        let env = Envelope {
            id: "e1".into(),
            sender: Sim::id("a"),
            target: Target::Peer(Sim::id("b")),
            body: Body::Text("later".into()),
            ts: 5,
            ttl: 6,
        };
        store.pending_add(&env);
        let mut sim = Sim::new(&["b"], Config::default());
        let a = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(store));
        sim.nodes.insert(Sim::id("a"), a);
        sim.link("a", "b");
        assert_eq!(sim.texts("b"), vec!["later"]);
    }

    #[test]
    fn peer_list_changes_are_reported() {
        let mut node = Node::new(Sim::id("a"), "a", None, Config::default(), Box::new(MemoryStore::new()));
        let acts = node.on_connection_open(&Sim::id("b"), Direction::Inbound, 0);
        assert!(acts
            .iter()
            .any(|a| matches!(a, OutboundAction::App(AppEvent::PeerListChanged(p)) if p.len() == 1)));
        let acts = node.on_connection_closed(&Sim::id("b"), 1);
        assert!(acts
            .iter()
            .any(|a| matches!(a, OutboundAction::App(AppEvent::PeerListChanged(p)) if p.is_empty())));
    }
}
