//! Hub election: fall back to well-known hub identities when presence is down or the node is
//! isolated, and self-promote as rendezvous of last resort. Best-effort, not linearizable:
//! collisions resolve through the identity bind failing.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{push_message, OutboundAction};
use crate::identity::PeerId;
use crate::overlay::Overlay;
use crate::protocol::{Message, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Follower,
    /// Dialling a hub slot; decide at `deadline`. `may_promote` is false after a bind conflict.
    Seeking { slot: usize, deadline: Millis, may_promote: bool },
    /// Asked the host to bind the hub identity.
    Binding { slot: usize },
    ConnectedToHub { slot: usize },
    SelfHub { slot: usize },
    /// Presence is back; the identity is released at `release_at`.
    Resigning { slot: usize, release_at: Millis },
}

pub struct HubElection {
    cfg: Arc<Config>,
    state: HubState,
    presence_online: bool,
    last_attempt_at: Option<Millis>,
    /// Last HubPulse seen per slot.
    pulses: HashMap<usize, Millis>,
}

impl HubElection {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            state: HubState::Follower,
            presence_online: false,
            last_attempt_at: None,
            pulses: HashMap::new(),
        }
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn presence_online(&self) -> bool {
        self.presence_online
    }

    pub fn set_presence_online(&mut self, online: bool) {
        if self.presence_online != online {
            info!(online, "presence channel state changed");
        }
        self.presence_online = online;
    }

    /// Slot this node currently holds as hub (including while resigning).
    pub fn self_slot(&self) -> Option<usize> {
        match self.state {
            HubState::SelfHub { slot } | HubState::Resigning { slot, .. } => Some(slot),
            _ => None,
        }
    }

    pub fn is_self_hub(&self) -> bool {
        self.self_slot().is_some()
    }

    fn hub_id(&self, slot: usize) -> PeerId {
        PeerId::hub(&self.cfg.hub_prefix, slot)
    }

    fn hub_alive(&self, slot: usize, now: Millis, overlay: &Overlay) -> bool {
        overlay.is_open(&self.hub_id(slot))
            || self
                .pulses
                .get(&slot)
                .map_or(false, |t| now.saturating_sub(*t) <= self.cfg.ping_timeout_ms)
    }

    /// Dial a random hub slot and arm the decision timer.
    pub fn connect_to_any_hub(&mut self, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        if self.cfg.hub_count == 0 {
            return;
        }
        let slot = rand::thread_rng().gen_range(0..self.cfg.hub_count);
        self.seek_slot(slot, now, overlay, out);
    }

    pub fn seek_slot(&mut self, slot: usize, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        if self.is_self_hub() || matches!(self.state, HubState::Binding { .. }) {
            return;
        }
        let hub = self.hub_id(slot);
        debug!(slot, hub = %hub, "seeking hub");
        overlay.connect_to(&hub, now, out);
        self.last_attempt_at = Some(now);
        self.state = HubState::Seeking {
            slot,
            deadline: now + self.cfg.hub_decision_ms,
            may_promote: true,
        };
    }

    /// Ask the host to bind the well-known identity for `slot`.
    pub fn become_hub(&mut self, slot: usize, out: &mut Vec<OutboundAction>) {
        if self.is_self_hub() {
            return;
        }
        info!(slot, "promoting to hub");
        self.state = HubState::Binding { slot };
        out.push(OutboundAction::BindHub {
            slot,
            hub_id: self.hub_id(slot),
        });
    }

    /// Bind succeeded. Presence may have recovered meanwhile: check again before keeping it.
    pub fn on_hub_bound(&mut self, slot: usize, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        if self.state != (HubState::Binding { slot }) {
            debug!(slot, "stale hub bind, releasing");
            out.push(OutboundAction::ReleaseHub { slot });
            return;
        }
        if self.presence_online {
            info!(slot, "presence recovered while binding, dropping hub identity");
            out.push(OutboundAction::ReleaseHub { slot });
            self.state = HubState::Follower;
            return;
        }
        info!(slot, "acting as hub");
        overlay.set_hub_mode(true);
        self.state = HubState::SelfHub { slot };
    }

    /// Identity taken: somebody already is that hub, so connect to it instead.
    pub fn on_hub_bind_failed(&mut self, slot: usize, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        warn!(slot, "hub identity already taken, connecting to it");
        let hub = self.hub_id(slot);
        overlay.connect_to(&hub, now, out);
        self.state = HubState::Seeking {
            slot,
            deadline: now + self.cfg.hub_decision_ms,
            may_promote: false,
        };
    }

    /// Start stepping down. Gossip goes out first so peers that only know each other
    /// through this hub can still find each other after it leaves.
    pub fn resign(&mut self, now: Millis, overlay: &Overlay, out: &mut Vec<OutboundAction>) {
        let HubState::SelfHub { slot } = self.state else {
            return;
        };
        info!(slot, grace_ms = self.cfg.hub_resign_grace_ms, "resigning hub");
        let entries = overlay.gossip_entries(self.cfg.gossip_fanout);
        for peer in overlay.open_peers() {
            push_message(out, &peer, &Message::PeerExchange { peers: entries.clone() });
        }
        self.state = HubState::Resigning {
            slot,
            release_at: now + self.cfg.hub_resign_grace_ms,
        };
    }

    pub fn on_hub_pulse(&mut self, slot: usize, now: Millis) {
        self.pulses.insert(slot, now);
        if matches!(self.state, HubState::Follower | HubState::Seeking { .. }) {
            debug!(slot, "hub alive");
            self.state = HubState::ConnectedToHub { slot };
        }
    }

    /// Periodic pulse from a self-hub to every open connection.
    pub fn pulse(&self, overlay: &Overlay, out: &mut Vec<OutboundAction>) {
        if let HubState::SelfHub { slot } = self.state {
            for peer in overlay.open_peers() {
                push_message(out, &peer, &Message::HubPulse { slot });
            }
        }
    }

    /// Drive timers: decision window, retry, reverting a lost hub link, resign grace.
    pub fn poll(&mut self, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        match self.state {
            HubState::Follower => {
                let isolated = overlay.open_count() == 0;
                let due = self
                    .last_attempt_at
                    .map_or(true, |t| now.saturating_sub(t) >= self.cfg.hub_retry_ms);
                if (!self.presence_online || isolated) && due {
                    self.connect_to_any_hub(now, overlay, out);
                }
            }
            HubState::Seeking {
                slot,
                deadline,
                may_promote,
            } => {
                if self.hub_alive(slot, now, overlay) {
                    info!(slot, "connected to hub");
                    self.state = HubState::ConnectedToHub { slot };
                } else if now >= deadline {
                    if may_promote && !self.presence_online {
                        self.become_hub(slot, out);
                    } else {
                        self.state = HubState::Follower;
                    }
                }
            }
            HubState::ConnectedToHub { slot } => {
                if !self.hub_alive(slot, now, overlay) {
                    debug!(slot, "hub link lost");
                    self.state = HubState::Follower;
                }
            }
            HubState::Binding { .. } => {}
            HubState::SelfHub { .. } => {
                if self.presence_online {
                    self.resign(now, overlay, out);
                }
            }
            HubState::Resigning { slot, release_at } => {
                if !self.presence_online {
                    info!(slot, "presence lost again, staying hub");
                    self.state = HubState::SelfHub { slot };
                } else if now >= release_at {
                    info!(slot, "hub identity released");
                    out.push(OutboundAction::ReleaseHub { slot });
                    overlay.set_hub_mode(false);
                    self.state = HubState::Follower;
                }
            }
        }
    }
}
