//! Peer identity: opaque string ids, hub identities, envelope targets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque peer identity. Unique per process instance; the host persists it across restarts.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        PeerId(format!("p-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Well-known identity for hub slot `index`.
    pub fn hub(prefix: &str, index: usize) -> Self {
        PeerId(format!("{}{}", prefix, index))
    }

    /// Slot index if this id is a hub identity under `prefix`.
    pub fn hub_slot(&self, prefix: &str) -> Option<usize> {
        self.0.strip_prefix(prefix)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const PUBLIC: &str = "public";

/// Envelope target: the public channel or one direct peer. Serialized as `"public"` or the peer id.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Public,
    Peer(PeerId),
}

impl Target {
    pub fn is_public(&self) -> bool {
        matches!(self, Target::Public)
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        if s == PUBLIC {
            Target::Public
        } else {
            Target::Peer(PeerId(s))
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        match t {
            Target::Public => PUBLIC.to_string(),
            Target::Peer(p) => p.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Public => f.write_str(PUBLIC),
            Target::Peer(p) => p.fmt(f),
        }
    }
}
