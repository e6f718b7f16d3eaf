//! Consistent hashing over member uids.
//!
//! Each member is represented by multiple virtual nodes to even out key
//! distribution. The ring is derived state: it is rebuilt from the current
//! member set on every membership change and never persisted.

use crate::types::MemberId;
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Number of virtual nodes per member.
pub const DEFAULT_VNODES_PER_MEMBER: usize = 64;

/// A consistent hash ring mapping keys to owning member uids.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Hash position on the ring -> owning member uid.
    vnodes: BTreeMap<u64, MemberId>,

    /// Members currently on the ring, sorted.
    members: Vec<MemberId>,

    /// Virtual nodes per member.
    vnodes_per_member: usize,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_MEMBER)
    }

    /// Create an empty ring with a custom vnode count.
    pub fn with_vnodes(vnodes_per_member: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            members: Vec::new(),
            vnodes_per_member: vnodes_per_member.max(1),
        }
    }

    /// Build a ring from a member set.
    pub fn from_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new();
        for member in members {
            ring.add_member(member.as_ref());
        }
        ring
    }

    /// Number of members on the ring.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members currently on the ring.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Whether a member is on the ring.
    pub fn contains(&self, uid: &str) -> bool {
        self.members.iter().any(|m| m == uid)
    }

    /// Add a member; a duplicate add is a no-op.
    pub fn add_member(&mut self, uid: &str) {
        if self.contains(uid) {
            return;
        }

        self.members.push(uid.to_string());
        self.members.sort();

        for i in 0..self.vnodes_per_member {
            let hash = Self::hash(format!("{uid}:{i}").as_bytes());
            self.vnodes.insert(hash, uid.to_string());
        }
    }

    /// Remove a member; removing an absent member is a no-op.
    pub fn remove_member(&mut self, uid: &str) {
        if !self.contains(uid) {
            return;
        }

        self.members.retain(|m| m != uid);

        for i in 0..self.vnodes_per_member {
            let hash = Self::hash(format!("{uid}:{i}").as_bytes());
            self.vnodes.remove(&hash);
        }
    }

    /// Owning member for a key, or `None` if the ring is empty.
    ///
    /// Deterministic: the same member set and key always produce the same
    /// owner, regardless of insertion order.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.vnodes.is_empty() {
            return None;
        }

        let hash = Self::hash(key.as_bytes());

        // First vnode at or after the key's position, wrapping around.
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, uid)| uid.as_str())
    }

    /// Whether a member owns a key.
    pub fn is_owner(&self, key: &str, uid: &str) -> bool {
        self.owner(key) == Some(uid)
    }

    fn hash(bytes: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(bytes);
        hasher.finish()
    }
}
