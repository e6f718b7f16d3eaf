//! Core types shared across the coordination subsystem.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Opaque stable identity of a server process.
pub type MemberId = String;

/// Width of the decimal sequence suffix assigned by the coordination service.
pub const SEQ_SUFFIX_WIDTH: usize = 10;

/// Which children stream a notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// The "who is alive" stream (presence nodes).
    Presence,
    /// The "whose claim version is current" stream (claim nodes).
    Claim,
}

/// A server process as seen through the presence and claim streams.
///
/// A member is logically gone only when both `active` and `locked` are
/// false; clearing one flag while the other stream still reports the
/// member keeps it in the view. A missing claim node is equivalent to
/// `lock_seq == service_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    /// Stable process identity.
    pub uid: MemberId,

    /// Arrival order assigned by the coordination service at node creation.
    pub service_seq: u64,

    /// Claim version; invariant `lock_seq >= service_seq`.
    pub lock_seq: u64,

    /// Presence node currently exists.
    pub active: bool,

    /// Claim node currently exists.
    pub locked: bool,
}

impl ClusterMember {
    /// Create the local member from the sequence returned by the
    /// coordination service for this process's own presence node.
    pub fn local(uid: impl Into<MemberId>, service_seq: u64) -> Self {
        Self {
            uid: uid.into(),
            service_seq,
            lock_seq: service_seq,
            active: true,
            locked: false,
        }
    }

    /// Parse a child node name received from a watch callback.
    ///
    /// Presence names are `<uid>-<seq>`, claim names `<uid>-<seq>-<lockseq>`.
    /// The uid itself may contain dashes, so suffixes are split from the
    /// right.
    pub fn parse(name: &str, kind: StreamKind) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedNodeName(name.to_string());

        match kind {
            StreamKind::Presence => {
                let (uid, seq) = name.rsplit_once('-').ok_or_else(malformed)?;
                let service_seq: u64 = seq.parse().map_err(|_| malformed())?;
                if uid.is_empty() {
                    return Err(malformed());
                }
                Ok(Self {
                    uid: uid.to_string(),
                    service_seq,
                    lock_seq: service_seq,
                    active: true,
                    locked: false,
                })
            }
            StreamKind::Claim => {
                let (rest, lock) = name.rsplit_once('-').ok_or_else(malformed)?;
                let (uid, seq) = rest.rsplit_once('-').ok_or_else(malformed)?;
                let lock_seq: u64 = lock.parse().map_err(|_| malformed())?;
                let service_seq: u64 = seq.parse().map_err(|_| malformed())?;
                if uid.is_empty() {
                    return Err(malformed());
                }
                if lock_seq < service_seq {
                    // lock_seq >= service_seq is a protocol invariant; a
                    // violating claim node must be flagged, not absorbed.
                    return Err(ProtocolError::ClaimRegression {
                        uid: uid.to_string(),
                        cached: service_seq,
                        observed: lock_seq,
                    });
                }
                Ok(Self {
                    uid: uid.to_string(),
                    service_seq,
                    lock_seq,
                    active: false,
                    locked: true,
                })
            }
        }
    }

    /// Merge a fresh observation of the same member into this one.
    ///
    /// Idempotent and commutative across delivery order: the claim version
    /// only ratchets up and the stream flags only accumulate.
    pub fn merge(&mut self, fresh: &ClusterMember) {
        debug_assert_eq!(self.uid, fresh.uid);
        debug_assert_eq!(self.service_seq, fresh.service_seq);

        self.lock_seq = self.lock_seq.max(fresh.lock_seq);
        self.active = self.active || fresh.active;
        self.locked = self.locked || fresh.locked;
    }

    /// Clear the flag for the stream the member vanished from.
    pub fn clear_stream(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Presence => self.active = false,
            StreamKind::Claim => self.locked = false,
        }
    }

    /// Both node categories are gone; the member can be purged.
    pub fn is_gone(&self) -> bool {
        !self.active && !self.locked
    }

    /// True iff this member is guaranteed to already account for `other`
    /// in its last rebalancing pass.
    ///
    /// Monotonic per pair: `service_seq` is fixed and `lock_seq` only
    /// increases, so once true this never becomes false.
    pub fn has_found(&self, other: &ClusterMember) -> bool {
        // Joined after `other`, so the initial view included it; or joined
        // before but has since advanced its claim past `other`'s arrival.
        self.service_seq > other.service_seq || self.lock_seq >= other.service_seq
    }

    /// Prefix handed to the coordination service when creating the
    /// sequential presence node; the service appends the sequence suffix.
    pub fn presence_prefix(uid: &str) -> String {
        format!("{uid}-")
    }

    /// Name of this member's presence node.
    pub fn presence_node_name(&self) -> String {
        format!(
            "{}-{:0width$}",
            self.uid,
            self.service_seq,
            width = SEQ_SUFFIX_WIDTH
        )
    }

    /// Name of this member's claim node for its current claim version.
    pub fn claim_node_name(&self) -> String {
        self.claim_node_name_for(self.lock_seq)
    }

    /// Name of this member's claim node for a specific claim version.
    pub fn claim_node_name_for(&self, lock_seq: u64) -> String {
        format!(
            "{}-{:0w$}-{:0w$}",
            self.uid,
            self.service_seq,
            lock_seq,
            w = SEQ_SUFFIX_WIDTH
        )
    }
}

impl std::fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}, active: {}, locked: {}",
            self.uid, self.service_seq, self.lock_seq, self.active, self.locked
        )
    }
}

/// Process-wide description of the local server, registered once at
/// startup and carried as the payload of the working node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Logical service this process belongs to (e.g. "presence", "msgid").
    pub service: String,

    /// Unique name of this process instance; used as the member uid.
    pub uid: MemberId,
}

impl ServerDescriptor {
    /// Create a new descriptor.
    pub fn new(service: impl Into<String>, uid: impl Into<MemberId>) -> Self {
        Self {
            service: service.into(),
            uid: uid.into(),
        }
    }

    /// Serialize the descriptor to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a descriptor from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
