//! Local store boundary: envelope history and the outbound pending queue.
//! Persistence format is the host's concern; `MemoryStore` backs tests and the daemon.

use std::collections::BTreeMap;

use crate::identity::Target;
use crate::protocol::Envelope;

pub trait LocalStore: Send {
    fn save_envelope(&mut self, env: &Envelope);

    /// Newest `limit` envelopes of one conversation, older than `before_ts` when given, oldest first.
    /// A direct conversation with peer P holds envelopes sent to P and received from P.
    fn get_recent(&self, limit: usize, scope: &Target, before_ts: Option<u64>) -> Vec<Envelope>;

    /// Public envelopes strictly newer than `ts`, oldest first.
    fn get_public_after(&self, ts: u64, limit: usize) -> Vec<Envelope>;

    /// Newest public timestamp held, 0 when none.
    fn latest_public_ts(&self) -> u64;

    fn pending_add(&mut self, env: &Envelope);
    fn pending_all(&self) -> Vec<Envelope>;
    fn pending_remove(&mut self, id: &str);
}

/// In-memory store keyed by `(ts, id)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    envelopes: BTreeMap<(u64, String), Envelope>,
    pending: BTreeMap<String, Envelope>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

fn in_scope(env: &Envelope, scope: &Target) -> bool {
    match scope {
        Target::Public => env.target.is_public(),
        Target::Peer(p) => {
            env.target == Target::Peer(p.clone()) || (&env.sender == p && !env.target.is_public())
        }
    }
}

impl LocalStore for MemoryStore {
    fn save_envelope(&mut self, env: &Envelope) {
        self.envelopes
            .insert((env.ts, env.id.clone()), env.clone());
    }

    fn get_recent(&self, limit: usize, scope: &Target, before_ts: Option<u64>) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = self
            .envelopes
            .values()
            .rev()
            .filter(|e| before_ts.map_or(true, |b| e.ts < b))
            .filter(|e| in_scope(e, scope))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    fn get_public_after(&self, ts: u64, limit: usize) -> Vec<Envelope> {
        self.envelopes
            .range((ts.saturating_add(1), String::new())..)
            .map(|(_, e)| e)
            .filter(|e| e.target.is_public())
            .take(limit)
            .cloned()
            .collect()
    }

    fn latest_public_ts(&self) -> u64 {
        self.envelopes
            .values()
            .rev()
            .find(|e| e.target.is_public())
            .map_or(0, |e| e.ts)
    }

    fn pending_add(&mut self, env: &Envelope) {
        self.pending.insert(env.id.clone(), env.clone());
    }

    fn pending_all(&self) -> Vec<Envelope> {
        let mut all: Vec<Envelope> = self.pending.values().cloned().collect();
        all.sort_by_key(|e| e.ts);
        all
    }

    fn pending_remove(&mut self, id: &str) {
        self.pending.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::Body;

    fn env(id: &str, sender: &str, target: Target, ts: u64) -> Envelope {
        Envelope {
            id: id.into(),
            sender: PeerId::from(sender),
            target,
            body: Body::Text(id.into()),
            ts,
            ttl: 3,
        }
    }

    #[test]
    fn recent_is_scoped_and_paged() {
        let mut s = MemoryStore::new();
        for i in 0..5u64 {
            s.save_envelope(&env(&format!("pub{}", i), "p-a", Target::Public, 10 + i));
        }
        s.save_envelope(&env("dm", "p-a", Target::Peer(PeerId::from("p-me")), 12));
        let recent = s.get_recent(2, &Target::Public, None);
        assert_eq!(recent.iter().map(|e| e.ts).collect::<Vec<_>>(), vec![13, 14]);
        let older = s.get_recent(2, &Target::Public, Some(13));
        assert_eq!(older.iter().map(|e| e.ts).collect::<Vec<_>>(), vec![11, 12]);
        let dm = s.get_recent(10, &Target::Peer(PeerId::from("p-a")), None);
        assert_eq!(dm.len(), 1);
        assert_eq!(s.latest_public_ts(), 14);
    }

    #[test]
    fn public_after_is_strict() {
        let mut s = MemoryStore::new();
        s.save_envelope(&env("a", "p-a", Target::Public, 5));
        s.save_envelope(&env("b", "p-a", Target::Public, 6));
        s.save_envelope(&env("c", "p-a", Target::Peer(PeerId::from("p-b")), 7));
        let after = s.get_public_after(5, 10);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "b");
    }

    #[test]
    fn pending_queue() {
        let mut s = MemoryStore::new();
        s.pending_add(&env("x", "p-a", Target::Public, 2));
        s.pending_add(&env("y", "p-a", Target::Public, 1));
        assert_eq!(s.pending_all()[0].id, "y");
        s.pending_remove("y");
        s.pending_remove("y");
        assert_eq!(s.pending_all().len(), 1);
    }
}
