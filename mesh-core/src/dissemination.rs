//! Protocol layer: envelope de-duplication, public flood with TTL decay, pending-send retry, send throttling.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::Config;
use crate::core::{AppEvent, OutboundAction};
use crate::identity::{PeerId, Target};
use crate::overlay::Overlay;
use crate::protocol::{Body, Envelope, Message, Millis};
use crate::store::LocalStore;
use crate::wire;

/// Client-side burst guard: at most `burst` sends within `window` ms.
#[derive(Debug)]
pub struct RateLimiter {
    burst: usize,
    window: Millis,
    sent: VecDeque<Millis>,
}

impl RateLimiter {
    pub fn new(burst: usize, window: Millis) -> Self {
        Self {
            burst,
            window,
            sent: VecDeque::new(),
        }
    }

    /// Record a send at `now` if allowed.
    pub fn try_acquire(&mut self, now: Millis) -> bool {
        while let Some(&t) = self.sent.front() {
            if now.saturating_sub(t) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() >= self.burst {
            return false;
        }
        self.sent.push_back(now);
        true
    }
}

/// What `receive` did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Duplicate,
    /// Delivered to the application; `flooded` counts relays.
    Delivered { flooded: usize },
    /// Direct envelope addressed elsewhere.
    NotForUs,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("sending too fast, try again shortly")]
    Throttled,
    #[error("empty message")]
    Empty,
}

pub struct Dissemination {
    self_id: PeerId,
    cfg: Arc<Config>,
    seen: HashSet<String>,
    clock: u64,
    /// Undelivered local-origin envelopes, mirrored in the store's pending queue.
    pending: Vec<Envelope>,
    limiter: RateLimiter,
}

impl Dissemination {
    pub fn new(self_id: PeerId, cfg: Arc<Config>) -> Self {
        let limiter = RateLimiter::new(cfg.send_burst, cfg.send_window_ms);
        Self {
            self_id,
            cfg,
            seen: HashSet::new(),
            clock: 0,
            pending: Vec::new(),
            limiter,
        }
    }

    /// Reload undelivered envelopes from a previous run.
    pub fn restore_pending(&mut self, store: &dyn LocalStore) {
        for env in store.pending_all() {
            self.seen.insert(env.id.clone());
            self.clock = self.clock.max(env.ts);
            self.pending.push(env);
        }
    }

    /// Next logical timestamp: max(local clock, observed max + 1).
    fn stamp(&mut self, now: Millis) -> u64 {
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Originate an envelope: stamp, surface locally, queue, try to transmit.
    pub fn send(
        &mut self,
        target: Target,
        body: Body,
        now: Millis,
        overlay: &mut Overlay,
        store: &mut dyn LocalStore,
        out: &mut Vec<OutboundAction>,
    ) -> Result<Envelope, SendError> {
        if let Body::Text(t) = &body {
            if t.trim().is_empty() {
                return Err(SendError::Empty);
            }
        }
        if !self.limiter.try_acquire(now) {
            return Err(SendError::Throttled);
        }
        let env = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            sender: self.self_id.clone(),
            target,
            body,
            ts: self.stamp(now),
            ttl: self.cfg.default_ttl,
        };
        self.seen.insert(env.id.clone());
        store.save_envelope(&env);
        out.push(OutboundAction::App(AppEvent::Envelope(env.clone())));
        store.pending_add(&env);
        self.pending.push(env.clone());
        if self.transmit(&env, now, overlay, out) {
            self.pending.retain(|e| e.id != env.id);
            store.pending_remove(&env.id);
        }
        Ok(env)
    }

    /// Send a local-origin envelope. Returns true if a transmission was attempted.
    fn transmit(
        &self,
        env: &Envelope,
        now: Millis,
        overlay: &mut Overlay,
        out: &mut Vec<OutboundAction>,
    ) -> bool {
        let packet = match wire::control_packet(&Message::Envelope(env.clone())) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "envelope encode failed");
                return false;
            }
        };
        match &env.target {
            Target::Public => overlay.broadcast(&packet, None, out) > 0,
            Target::Peer(peer) => {
                if overlay.is_open(peer) {
                    out.push(OutboundAction::Send(peer.clone(), packet));
                    true
                } else {
                    overlay.connect_to(peer, now, out);
                    false
                }
            }
        }
    }

    /// Process an inbound envelope: dedup, clock update, flood public ones, deliver what is ours.
    pub fn receive(
        &mut self,
        env: Envelope,
        from: &PeerId,
        overlay: &Overlay,
        store: &mut dyn LocalStore,
        out: &mut Vec<OutboundAction>,
    ) -> Received {
        if !self.seen.insert(env.id.clone()) {
            trace!(id = %env.id, "duplicate envelope");
            return Received::Duplicate;
        }
        self.clock = self.clock.max(env.ts);
        match &env.target {
            Target::Public => {
                let mut flooded = 0;
                let ttl = env.ttl.saturating_sub(1);
                if ttl > 0 {
                    let relay = Envelope {
                        ttl,
                        ..env.clone()
                    };
                    match wire::control_packet(&Message::Envelope(relay)) {
                        Ok(packet) => flooded = overlay.broadcast(&packet, Some(from), out),
                        Err(e) => debug!(error = %e, "relay encode failed"),
                    }
                }
                self.deliver(env, store, out);
                Received::Delivered { flooded }
            }
            Target::Peer(p) if *p == self.self_id || env.sender == self.self_id => {
                self.deliver(env, store, out);
                Received::Delivered { flooded: 0 }
            }
            Target::Peer(_) => Received::NotForUs,
        }
    }

    fn deliver(&self, env: Envelope, store: &mut dyn LocalStore, out: &mut Vec<OutboundAction>) {
        store.save_envelope(&env);
        out.push(OutboundAction::App(AppEvent::Envelope(env)));
    }

    /// Ticked: re-flood public envelopes, send or reconnect for direct ones; drop those attempted.
    pub fn retry_pending(
        &mut self,
        now: Millis,
        overlay: &mut Overlay,
        store: &mut dyn LocalStore,
        out: &mut Vec<OutboundAction>,
    ) {
        let pending = std::mem::take(&mut self.pending);
        for env in pending {
            if self.transmit(&env, now, overlay, out) {
                debug!(id = %env.id, target = %env.target, "pending envelope sent");
                store.pending_remove(&env.id);
            } else {
                self.pending.push(env);
            }
        }
    }
}
