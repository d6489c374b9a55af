//! Peer overlay: live connections, HELLO, gossip peer exchange, keepalive and connection caps.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::core::{push_message, OutboundAction};
use crate::identity::PeerId;
use crate::protocol::{Message, Millis, PeerEntry, PROTOCOL_VERSION};
use crate::wire::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
}

/// Who initiated the connection. `HubInbound` arrived on this node's hub identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
    HubInbound,
}

/// One logical connection per remote peer.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer_id: PeerId,
    pub state: ConnState,
    pub direction: Direction,
    pub created_at: Millis,
    pub last_keepalive_at: Millis,
    /// Remote display name from HELLO.
    pub label: Option<String>,
}

pub struct Overlay {
    self_id: PeerId,
    display_name: String,
    self_locator: Option<String>,
    cfg: Arc<Config>,
    conns: HashMap<PeerId, Connection>,
    locators: HashMap<PeerId, String>,
    /// Connections owed a gossip packet once the post-open delay elapses.
    pending_gossip: Vec<(PeerId, Millis)>,
    hub_mode: bool,
}

impl Overlay {
    pub fn new(
        self_id: PeerId,
        display_name: String,
        self_locator: Option<String>,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            self_id,
            display_name,
            self_locator,
            cfg,
            conns: HashMap::new(),
            locators: HashMap::new(),
            pending_gossip: Vec::new(),
            hub_mode: false,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Current connection cap: hubs accept more peers.
    pub fn cap(&self) -> usize {
        if self.hub_mode {
            self.cfg.hub_max_peers
        } else {
            self.cfg.max_peers
        }
    }

    pub fn set_hub_mode(&mut self, on: bool) {
        self.hub_mode = on;
    }

    pub fn learn_locator(&mut self, peer: &PeerId, locator: String) {
        if *peer != self.self_id {
            self.locators.insert(peer.clone(), locator);
        }
    }

    pub fn locator(&self, peer: &PeerId) -> Option<&str> {
        self.locators.get(peer).map(String::as_str)
    }

    /// Start connecting unless already connected/connecting or `peer` is self. Returns true if a connect was issued.
    pub fn connect_to(&mut self, peer: &PeerId, now: Millis, out: &mut Vec<OutboundAction>) -> bool {
        if *peer == self.self_id || self.conns.contains_key(peer) {
            return false;
        }
        debug!(peer = %peer, "connecting");
        self.conns.insert(
            peer.clone(),
            Connection {
                peer_id: peer.clone(),
                state: ConnState::Connecting,
                direction: Direction::Outbound,
                created_at: now,
                last_keepalive_at: now,
                label: None,
            },
        );
        out.push(OutboundAction::Connect {
            peer: peer.clone(),
            locator: self.locators.get(peer).cloned(),
        });
        true
    }

    /// Transport reports an open connection. Returns false if it was rejected (cap reached).
    pub fn on_open(
        &mut self,
        peer: &PeerId,
        direction: Direction,
        now: Millis,
        latest_public_ts: u64,
        out: &mut Vec<OutboundAction>,
    ) -> bool {
        if *peer == self.self_id {
            out.push(OutboundAction::Close(peer.clone()));
            return false;
        }
        let known = self.conns.contains_key(peer);
        if !known && direction != Direction::Outbound && self.open_count() >= self.cap() {
            info!(peer = %peer, cap = self.cap(), "rejecting inbound connection, cap reached");
            out.push(OutboundAction::Close(peer.clone()));
            return false;
        }
        // A reconnect supersedes the previous entry.
        self.conns.insert(
            peer.clone(),
            Connection {
                peer_id: peer.clone(),
                state: ConnState::Open,
                direction,
                created_at: now,
                last_keepalive_at: now,
                label: None,
            },
        );
        info!(peer = %peer, ?direction, open = self.open_count(), "connection open");
        push_message(
            out,
            peer,
            &Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                peer_id: self.self_id.clone(),
                display_name: self.display_name.clone(),
                locator: self.self_locator.clone(),
                latest_public_ts,
            },
        );
        if direction == Direction::HubInbound {
            // Rendezvous: full list to the newcomer, newcomer to everyone else.
            let entries = self.gossip_entries(self.cap());
            push_message(out, peer, &Message::PeerExchange { peers: entries });
            let newcomer = vec![self.entry_for(peer)];
            for other in self.open_peers() {
                if other != *peer {
                    push_message(
                        out,
                        &other,
                        &Message::PeerExchange {
                            peers: newcomer.clone(),
                        },
                    );
                }
            }
        } else {
            self.pending_gossip
                .push((peer.clone(), now + self.cfg.gossip_delay_ms));
        }
        true
    }

    /// Connection closed or failed. Returns true if an entry was removed.
    pub fn on_closed(&mut self, peer: &PeerId) -> bool {
        self.pending_gossip.retain(|(p, _)| p != peer);
        let removed = self.conns.remove(peer).is_some();
        if removed {
            info!(peer = %peer, open = self.open_count(), "connection closed");
        }
        removed
    }

    /// Any packet from `peer` counts as keepalive.
    pub fn touch(&mut self, peer: &PeerId, now: Millis) {
        if let Some(c) = self.conns.get_mut(peer) {
            c.last_keepalive_at = now;
        }
    }

    pub fn on_hello(&mut self, peer: &PeerId, display_name: String, locator: Option<String>) {
        if let Some(loc) = locator {
            self.learn_locator(peer, loc);
        }
        if let Some(c) = self.conns.get_mut(peer) {
            c.label = Some(display_name);
        }
    }

    /// Gossip fan-out: connect to every unseen id while below the cap. Returns the number of connects issued.
    pub fn on_peer_exchange(
        &mut self,
        entries: Vec<PeerEntry>,
        now: Millis,
        out: &mut Vec<OutboundAction>,
    ) -> usize {
        let mut issued = 0;
        for entry in entries {
            if entry.peer_id == self.self_id {
                continue;
            }
            if let Some(loc) = entry.locator {
                self.learn_locator(&entry.peer_id, loc);
            }
            if self.conns.len() >= self.cap() {
                continue;
            }
            if self.connect_to(&entry.peer_id, now, out) {
                issued += 1;
            }
        }
        issued
    }

    fn entry_for(&self, peer: &PeerId) -> PeerEntry {
        PeerEntry {
            peer_id: peer.clone(),
            locator: self.locators.get(peer).cloned(),
        }
    }

    /// Known open peers (bounded to `limit`) plus self.
    pub fn gossip_entries(&self, limit: usize) -> Vec<PeerEntry> {
        let mut entries: Vec<PeerEntry> = self
            .conns
            .values()
            .filter(|c| c.state == ConnState::Open)
            .take(limit)
            .map(|c| self.entry_for(&c.peer_id))
            .collect();
        entries.push(PeerEntry {
            peer_id: self.self_id.clone(),
            locator: self.self_locator.clone(),
        });
        entries
    }

    /// Send delayed post-open gossip whose time has come.
    pub fn flush_gossip(&mut self, now: Millis, out: &mut Vec<OutboundAction>) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_gossip)
            .into_iter()
            .partition(|(_, at)| *at <= now);
        self.pending_gossip = later;
        if due.is_empty() {
            return;
        }
        let entries = self.gossip_entries(self.cfg.gossip_fanout);
        for (peer, _) in due {
            if self.is_open(&peer) {
                push_message(
                    out,
                    &peer,
                    &Message::PeerExchange {
                        peers: entries.clone(),
                    },
                );
            }
        }
    }

    /// Periodic maintenance: drop stalled connects and idle peers (hubs exempt), then PING + gossip everyone.
    /// Returns the peers that were closed.
    pub fn maintain(&mut self, now: Millis, out: &mut Vec<OutboundAction>) -> Vec<PeerId> {
        let connect_timeout = self.cfg.connect_timeout_ms;
        let ping_timeout = self.cfg.ping_timeout_ms;
        let stale: Vec<PeerId> = self
            .conns
            .values()
            .filter(|c| match c.state {
                ConnState::Connecting => now.saturating_sub(c.created_at) > connect_timeout,
                ConnState::Open => {
                    !self.cfg.is_hub_id(&c.peer_id)
                        && now.saturating_sub(c.last_keepalive_at) > ping_timeout
                }
            })
            .map(|c| c.peer_id.clone())
            .collect();
        for peer in &stale {
            debug!(peer = %peer, "closing stalled or idle connection");
            self.on_closed(peer);
            out.push(OutboundAction::Close(peer.clone()));
        }

        let entries = self.gossip_entries(self.cfg.gossip_fanout);
        for peer in self.open_peers() {
            push_message(out, &peer, &Message::Ping { ts: now });
            push_message(
                out,
                &peer,
                &Message::PeerExchange {
                    peers: entries.clone(),
                },
            );
        }
        stale
    }

    /// Send `packet` to every open connection except `except`. Returns how many got it.
    pub fn broadcast(
        &self,
        packet: &Packet,
        except: Option<&PeerId>,
        out: &mut Vec<OutboundAction>,
    ) -> usize {
        let mut n = 0;
        for c in self.conns.values() {
            if c.state != ConnState::Open || Some(&c.peer_id) == except {
                continue;
            }
            out.push(OutboundAction::Send(c.peer_id.clone(), packet.clone()));
            n += 1;
        }
        n
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.conns
            .get(peer)
            .map_or(false, |c| c.state == ConnState::Open)
    }

    pub fn is_known(&self, peer: &PeerId) -> bool {
        self.conns.contains_key(peer)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&Connection> {
        self.conns.get(peer)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .conns
            .values()
            .filter(|c| c.state == ConnState::Open)
            .map(|c| c.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| c.state == ConnState::Open)
            .count()
    }

    pub fn connecting_count(&self) -> usize {
        self.conns.len() - self.open_count()
    }
}
