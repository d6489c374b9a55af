//! Metadata reliability: per-target ACK tracking and retry for content announcements,
//! discovery re-announce to late joiners, and the receiver-side metadata cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{push_message, AppEvent, OutboundAction};
use crate::identity::{PeerId, Target};
use crate::overlay::Overlay;
use crate::protocol::{ContentMeta, Message, Millis};

#[derive(Debug, Clone)]
struct TargetState {
    acked: bool,
    attempts: u32,
    last_sent_at: Millis,
}

struct Announcement {
    msg: Message,
    scope: Target,
    targets: HashMap<PeerId, TargetState>,
    started_at: Millis,
    last_discovery_at: Millis,
}

impl Announcement {
    fn all_acked(&self) -> bool {
        !self.targets.is_empty() && self.targets.values().all(|t| t.acked)
    }
}

/// Result of an incoming ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Announcement unknown or already torn down.
    Unknown,
    /// Target marked acknowledged (or was already).
    Acked,
    /// That ACK was the last one; bookkeeping removed.
    Completed,
}

pub struct MetadataManager {
    self_id: PeerId,
    cfg: Arc<Config>,
    pending: HashMap<String, Announcement>,
    seen_announcements: HashSet<String>,
    cache: HashMap<String, ContentMeta>,
    holders: HashMap<String, Vec<PeerId>>,
}

impl MetadataManager {
    pub fn new(self_id: PeerId, cfg: Arc<Config>) -> Self {
        Self {
            self_id,
            cfg,
            pending: HashMap::new(),
            seen_announcements: HashSet::new(),
            cache: HashMap::new(),
            holders: HashMap::new(),
        }
    }

    /// Announce content to one peer or (scope public) every open connection. Returns the announcement id.
    pub fn announce(
        &mut self,
        meta: ContentMeta,
        scope: Target,
        now: Millis,
        overlay: &mut Overlay,
        out: &mut Vec<OutboundAction>,
    ) -> String {
        let announcement_id = uuid::Uuid::new_v4().to_string();
        self.remember(meta.clone());
        self.seen_announcements.insert(announcement_id.clone());
        let msg = Message::ContentMeta {
            announcement_id: announcement_id.clone(),
            sender: self.self_id.clone(),
            scope: scope.clone(),
            meta,
        };
        let mut ann = Announcement {
            msg,
            scope: scope.clone(),
            targets: HashMap::new(),
            started_at: now,
            last_discovery_at: now,
        };
        let initial = match &scope {
            Target::Public => overlay.open_peers(),
            Target::Peer(p) => vec![p.clone()],
        };
        for peer in initial {
            Self::send_to(&mut ann, &peer, now, overlay, out);
        }
        info!(id = %announcement_id, %scope, targets = ann.targets.len(), "content announced");
        self.pending.insert(announcement_id.clone(), ann);
        announcement_id
    }

    /// Send (or resend) to one target, creating its state; unreachable direct targets trigger a connect.
    fn send_to(
        ann: &mut Announcement,
        peer: &PeerId,
        now: Millis,
        overlay: &mut Overlay,
        out: &mut Vec<OutboundAction>,
    ) {
        let state = ann.targets.entry(peer.clone()).or_insert(TargetState {
            acked: false,
            attempts: 0,
            last_sent_at: now,
        });
        state.attempts += 1;
        state.last_sent_at = now;
        if overlay.is_open(peer) {
            push_message(out, peer, &ann.msg);
        } else {
            overlay.connect_to(peer, now, out);
        }
    }

    /// Incoming ACK for `(ref_id, from)`. Idempotent.
    pub fn on_ack(&mut self, ref_id: &str, from: &PeerId) -> AckOutcome {
        let Some(ann) = self.pending.get_mut(ref_id) else {
            return AckOutcome::Unknown;
        };
        match ann.targets.get_mut(from) {
            Some(t) => t.acked = true,
            None => return AckOutcome::Unknown,
        }
        if ann.all_acked() {
            self.pending.remove(ref_id);
            debug!(id = %ref_id, "announcement fully acknowledged");
            AckOutcome::Completed
        } else {
            AckOutcome::Acked
        }
    }

    /// Receiver side: cache and surface on first receipt, ACK every time.
    /// Returns the meta when it was new.
    pub fn on_announcement(
        &mut self,
        announcement_id: String,
        sender: PeerId,
        meta: ContentMeta,
        from: &PeerId,
        out: &mut Vec<OutboundAction>,
    ) -> Option<ContentMeta> {
        push_message(
            out,
            from,
            &Message::ContentMetaAck {
                ref_id: announcement_id.clone(),
            },
        );
        if !self.seen_announcements.insert(announcement_id) {
            return None;
        }
        self.add_holder(&meta.content_id, meta.owner.clone());
        self.add_holder(&meta.content_id, sender);
        self.add_holder(&meta.content_id, from.clone());
        self.remember(meta.clone());
        out.push(OutboundAction::App(AppEvent::ContentMeta(meta.clone())));
        Some(meta)
    }

    fn remember(&mut self, meta: ContentMeta) {
        self.add_holder(&meta.content_id, meta.owner.clone());
        self.cache.insert(meta.content_id.clone(), meta);
    }

    pub fn add_holder(&mut self, content_id: &str, peer: PeerId) {
        if peer == self.self_id {
            return;
        }
        let list = self.holders.entry(content_id.to_string()).or_default();
        if !list.contains(&peer) {
            list.push(peer);
        }
    }

    pub fn meta(&self, content_id: &str) -> Option<&ContentMeta> {
        self.cache.get(content_id)
    }

    /// Peers known to hold `content_id`, owner first.
    pub fn holders(&self, content_id: &str) -> Vec<PeerId> {
        self.holders.get(content_id).cloned().unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, announcement_id: &str) -> bool {
        self.pending.contains_key(announcement_id)
    }

    /// Ticked: resend to un-acked targets, discover new connections for public scope, expire by age.
    pub fn poll(&mut self, now: Millis, overlay: &mut Overlay, out: &mut Vec<OutboundAction>) {
        let cfg = self.cfg.clone();
        let mut expired = Vec::new();
        for (id, ann) in self.pending.iter_mut() {
            if now.saturating_sub(ann.started_at) >= cfg.ack_max_age_ms {
                expired.push(id.clone());
                continue;
            }
            let due: Vec<PeerId> = ann
                .targets
                .iter()
                .filter(|(_, t)| {
                    !t.acked
                        && t.attempts < cfg.ack_max_attempts
                        && now.saturating_sub(t.last_sent_at) >= cfg.ack_retry_ms
                })
                .map(|(p, _)| p.clone())
                .collect();
            for peer in due {
                debug!(id = %id, peer = %peer, "resending announcement");
                Self::send_to(ann, &peer, now, overlay, out);
            }
            if ann.scope.is_public()
                && now.saturating_sub(ann.last_discovery_at) >= cfg.ack_discovery_ms
            {
                ann.last_discovery_at = now;
                for peer in overlay.open_peers() {
                    if !ann.targets.contains_key(&peer) {
                        debug!(id = %id, peer = %peer, "announcing to late joiner");
                        Self::send_to(ann, &peer, now, overlay, out);
                    }
                }
            }
        }
        for id in expired {
            if let Some(ann) = self.pending.remove(&id) {
                let missing: Vec<&PeerId> = ann
                    .targets
                    .iter()
                    .filter(|(_, t)| !t.acked)
                    .map(|(p, _)| p)
                    .collect();
                if !missing.is_empty() {
                    warn!(id = %id, missing = missing.len(), "announcement abandoned without full acknowledgement");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Direction;
    use crate::wire::{decode_frame, Packet};

    fn meta() -> ContentMeta {
        ContentMeta {
            content_id: "f1".into(),
            size: 10,
            mime_type: "text/plain".into(),
            owner: PeerId::from("p-me"),
            name: None,
        }
    }

    fn setup(open: &[&str]) -> (MetadataManager, Overlay) {
        let cfg = Arc::new(Config::default());
        let mut ov = Overlay::new(PeerId::from("p-me"), "me".into(), None, cfg.clone());
        let mut scratch = Vec::new();
        for p in open {
            ov.on_open(&PeerId::from(*p), Direction::Outbound, 0, 0, &mut scratch);
        }
        (MetadataManager::new(PeerId::from("p-me"), cfg), ov)
    }

    fn announcements_to(out: &[OutboundAction]) -> Vec<PeerId> {
        out.iter()
            .filter_map(|a| match a {
                OutboundAction::Send(p, Packet::Control(b)) => match decode_frame(b).unwrap().0 {
                    Message::ContentMeta { .. } => Some(p.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn public_announce_reaches_all_and_completes_on_last_ack() {
        let (mut mm, mut ov) = setup(&["p-a", "p-b"]);
        let mut out = Vec::new();
        let id = mm.announce(meta(), Target::Public, 0, &mut ov, &mut out);
        assert_eq!(announcements_to(&out).len(), 2);
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-a")), AckOutcome::Acked);
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-b")), AckOutcome::Completed);
        assert!(!mm.is_pending(&id));
        // Late duplicate ACK is harmless.
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-b")), AckOutcome::Unknown);
    }

    #[test]
    fn duplicate_ack_before_completion_does_not_remove() {
        let (mut mm, mut ov) = setup(&["p-a", "p-b"]);
        let mut out = Vec::new();
        let id = mm.announce(meta(), Target::Public, 0, &mut ov, &mut out);
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-a")), AckOutcome::Acked);
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-a")), AckOutcome::Acked);
        assert!(mm.is_pending(&id));
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-stranger")), AckOutcome::Unknown);
    }

    #[test]
    fn unacked_targets_are_retried_until_bounded() {
        let cfg = Config::default();
        let (mut mm, mut ov) = setup(&["p-a", "p-b"]);
        let mut out = Vec::new();
        let id = mm.announce(meta(), Target::Public, 0, &mut ov, &mut out);
        mm.on_ack(&id, &PeerId::from("p-a"));
        out.clear();
        mm.poll(cfg.ack_retry_ms - 1, &mut ov, &mut out);
        assert!(announcements_to(&out).is_empty());
        mm.poll(cfg.ack_retry_ms, &mut ov, &mut out);
        assert_eq!(announcements_to(&out), vec![PeerId::from("p-b")]);

        out.clear();
        mm.poll(cfg.ack_max_age_ms, &mut ov, &mut out);
        assert!(announcements_to(&out).is_empty());
        assert!(!mm.is_pending(&id));
    }

    #[test]
    fn public_discovery_adds_late_joiners() {
        let cfg = Config::default();
        let (mut mm, mut ov) = setup(&["p-a"]);
        let mut out = Vec::new();
        let id = mm.announce(meta(), Target::Public, 0, &mut ov, &mut out);
        ov.on_open(&PeerId::from("p-late"), Direction::Inbound, 500, 0, &mut out);
        out.clear();
        mm.poll(cfg.ack_discovery_ms, &mut ov, &mut out);
        assert_eq!(announcements_to(&out), vec![PeerId::from("p-late")]);
        mm.on_ack(&id, &PeerId::from("p-a"));
        assert_eq!(mm.on_ack(&id, &PeerId::from("p-late")), AckOutcome::Completed);
    }

    #[test]
    fn direct_announce_to_unconnected_peer_connects() {
        let (mut mm, mut ov) = setup(&[]);
        let mut out = Vec::new();
        mm.announce(meta(), Target::Peer(PeerId::from("p-x")), 0, &mut ov, &mut out);
        assert!(out
            .iter()
            .any(|a| matches!(a, OutboundAction::Connect { peer, .. } if peer.as_str() == "p-x")));
    }

    #[test]
    fn receiver_acks_every_time_but_surfaces_once() {
        let (mut mm, _) = setup(&[]);
        let mut out = Vec::new();
        let from = PeerId::from("p-owner");
        let mut m = meta();
        m.owner = from.clone();
        assert!(mm
            .on_announcement("a1".into(), from.clone(), m.clone(), &from, &mut out)
            .is_some());
        assert!(mm
            .on_announcement("a1".into(), from.clone(), m, &from, &mut out)
            .is_none());
        let acks = out
            .iter()
            .filter(|a| match a {
                OutboundAction::Send(_, Packet::Control(b)) => {
                    matches!(decode_frame(b).unwrap().0, Message::ContentMetaAck { .. })
                }
                _ => false,
            })
            .count();
        assert_eq!(acks, 2);
        let surfaced = out
            .iter()
            .filter(|a| matches!(a, OutboundAction::App(AppEvent::ContentMeta(_))))
            .count();
        assert_eq!(surfaced, 1);
        assert_eq!(mm.holders("f1"), vec![from]);
        assert_eq!(mm.meta("f1").map(|m| m.size), Some(10));
    }
}
