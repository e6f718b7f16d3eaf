//! The partition-ownership protocol ("hash-lock").
//!
//! Maintains the authoritative in-memory view of all cluster members by
//! merging two independently-notified, non-transactional children streams
//! (presence and claim), answers "do I own key X", and decides when the
//! local member must advance its claim version.
//!
//! The coordination service delivers the two streams in no particular
//! relative order; node creation order (presence first, then claim) does
//! not constrain notification order, so every merge here is idempotent
//! and commutative with respect to delivery order.

use crate::error::{Error, ProtocolError, Result};
use crate::ring::HashRing;
use crate::types::{ClusterMember, MemberId, StreamKind};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A required advance of the local claim version, reported to the lock
/// binding when a newly-observed member's arrival exceeds the local
/// member's claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimAdvance {
    /// New claim version; strictly greater than the current one.
    pub new_lock_seq: u64,
}

/// External resource owner notified when ownership shrinks.
///
/// The callback receives an ownership predicate so the application can
/// drop every key that no longer hashes to the local member. Failures in
/// the callback are the observer's problem; the caller logs and keeps
/// processing notifications.
pub trait RebalanceObserver: Send + Sync {
    /// Drop resources the local member no longer owns.
    fn release_resources(&self, owns: &dyn Fn(&str) -> bool);
}

/// No-op observer.
pub struct NoopRebalanceObserver;

impl RebalanceObserver for NoopRebalanceObserver {
    fn release_resources(&self, _owns: &dyn Fn(&str) -> bool) {}
}

/// Authoritative view of the cluster's members and claim versions.
///
/// Owned by a single coordinating task; queries take `&self`, stream
/// notifications `&mut self`. No internal locking.
#[derive(Debug)]
pub struct PartitionCoordinator {
    /// uid -> member. Always contains the local member.
    members: HashMap<MemberId, ClusterMember>,

    /// Local member uid.
    local_uid: MemberId,

    /// Ring over all known member uids, rebuilt on every view change.
    ring: HashRing,
}

impl PartitionCoordinator {
    /// Create a coordinator around the local member.
    ///
    /// The local member is created once at process start from the
    /// sequence the coordination service returned for our own presence
    /// node; it is never mutated through the notification path.
    pub fn new(local: ClusterMember) -> Self {
        let local_uid = local.uid.clone();
        let mut members = HashMap::new();
        members.insert(local_uid.clone(), local);

        let mut coordinator = Self {
            members,
            local_uid,
            ring: HashRing::new(),
        };
        coordinator.rebuild_ring();
        coordinator
    }

    /// The local member.
    pub fn local(&self) -> Option<&ClusterMember> {
        self.members.get(&self.local_uid)
    }

    /// All known members, ordered by arrival.
    pub fn members_by_arrival(&self) -> Vec<&ClusterMember> {
        let mut members: Vec<&ClusterMember> = self.members.values().collect();
        members.sort_by(|a, b| {
            a.service_seq
                .cmp(&b.service_seq)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        members
    }

    /// Number of known members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Presence-stream snapshot: the full child list of "who is alive".
    pub fn on_presence_changed<S: AsRef<str>>(&mut self, names: &[S]) -> Option<ClaimAdvance> {
        self.apply(StreamKind::Presence, names)
    }

    /// Claim-stream snapshot: the full child list of current claims.
    pub fn on_claim_changed<S: AsRef<str>>(&mut self, names: &[S]) -> Option<ClaimAdvance> {
        self.apply(StreamKind::Claim, names)
    }

    /// Whether the local member currently owns `key`.
    ///
    /// Two-sided check: a member that joined earlier and has not yet
    /// found us may still claim the key under its own last-rebalanced
    /// view, in which case the key is not ours even if the current ring
    /// says otherwise; conversely the current ring may have reassigned
    /// the key away from us already.
    pub fn owns(&self, key: &str) -> bool {
        let Some(me) = self.members.get(&self.local_uid) else {
            debug_assert!(false, "local member missing from view");
            return false;
        };

        if !self.all_agreed(me) && self.taken_by_stale_peer(key, me) {
            return false;
        }

        self.ring.is_owner(key, &self.local_uid)
    }

    /// Record the completion of a claim update performed through the
    /// lock binding. This is the only path that mutates the local
    /// member's claim state.
    pub fn complete_claim_advance(&mut self, new_lock_seq: u64) -> Result<()> {
        let me = self
            .members
            .get_mut(&self.local_uid)
            .ok_or_else(|| Error::Internal("local member missing from view".to_string()))?;

        if new_lock_seq < me.lock_seq {
            return Err(ProtocolError::ClaimRegression {
                uid: me.uid.clone(),
                cached: me.lock_seq,
                observed: new_lock_seq,
            }
            .into());
        }

        me.lock_seq = new_lock_seq;
        me.locked = true;
        debug!(uid = %me.uid, lock_seq = new_lock_seq, "local claim advanced");
        Ok(())
    }

    /// Drop the local member from the view. Explicit shutdown only; the
    /// notification path never removes it.
    pub fn purge_local(&mut self) {
        self.members.remove(&self.local_uid);
        self.rebuild_ring();
    }

    fn apply<S: AsRef<str>>(&mut self, kind: StreamKind, names: &[S]) -> Option<ClaimAdvance> {
        let mut fresh: Vec<ClusterMember> = Vec::with_capacity(names.len());
        for name in names {
            match ClusterMember::parse(name.as_ref(), kind) {
                Ok(member) => fresh.push(member),
                // Skip the bad name; the rest of the list still merges.
                Err(e) => warn!(name = name.as_ref(), error = %e, "skipping bad node name"),
            }
        }

        let deleted: Vec<MemberId> = self
            .members
            .keys()
            .filter(|uid| !fresh.iter().any(|m| &m.uid == *uid))
            .cloned()
            .collect();

        for member in &fresh {
            self.member_updated(member);
        }
        for uid in &deleted {
            self.member_deleted(uid, kind);
        }

        self.rebuild_ring();
        self.claim_advance_needed(&fresh)
    }

    fn member_updated(&mut self, fresh: &ClusterMember) {
        if fresh.uid == self.local_uid {
            // A stale self-observation must not clobber in-flight local
            // state; the local member changes only through
            // complete_claim_advance.
            return;
        }

        match self.members.get_mut(&fresh.uid) {
            None => {
                info!(member = %fresh, "new member observed");
                self.members.insert(fresh.uid.clone(), fresh.clone());
            }
            Some(cached) if cached.service_seq == fresh.service_seq => {
                cached.merge(fresh);
                debug!(member = %cached, "member status merged");
            }
            Some(cached) if fresh.service_seq > cached.service_seq => {
                // Same uid, later arrival: the process restarted and
                // re-joined before its old nodes were reported gone.
                info!(member = %fresh, old_seq = cached.service_seq, "member re-joined");
                *cached = fresh.clone();
            }
            Some(_) => {
                debug!(member = %fresh, "stale incarnation ignored");
            }
        }
    }

    fn member_deleted(&mut self, uid: &str, kind: StreamKind) {
        if uid == self.local_uid {
            // Our own lock replacement transiently removes the old claim
            // node; never let that clear local state.
            return;
        }

        let Some(cached) = self.members.get_mut(uid) else {
            return;
        };

        cached.clear_stream(kind);
        if cached.is_gone() {
            info!(uid, "member purged from view");
            self.members.remove(uid);
        }
    }

    /// A newly-observed arrival past our claim version means we must
    /// advance our claim (and release resources) before the new member
    /// can serve.
    fn claim_advance_needed(&self, fresh: &[ClusterMember]) -> Option<ClaimAdvance> {
        let latest = fresh.iter().map(|m| m.service_seq).max()?;
        let me = self.members.get(&self.local_uid)?;

        if latest > me.lock_seq {
            Some(ClaimAdvance {
                new_lock_seq: latest,
            })
        } else {
            None
        }
    }

    /// Every other member is guaranteed to account for us.
    ///
    /// Computed against every member directly rather than by walking an
    /// ordered structure until `self` is encountered; members that joined
    /// after us have found us by definition of `has_found`.
    fn all_agreed(&self, me: &ClusterMember) -> bool {
        self.members
            .values()
            .filter(|m| m.uid != me.uid)
            .all(|m| m.has_found(me))
    }

    /// Some member that has not found us would still claim `key` under
    /// the membership it last rebalanced against.
    fn taken_by_stale_peer(&self, key: &str, me: &ClusterMember) -> bool {
        for peer in self.members.values() {
            if peer.uid == me.uid || peer.has_found(me) {
                continue;
            }

            // The view the peer last rebalanced against: everyone who
            // arrived at or before its claim version.
            let stale_ring = HashRing::from_members(
                self.members
                    .values()
                    .filter(|m| m.service_seq <= peer.lock_seq)
                    .map(|m| m.uid.as_str()),
            );

            if stale_ring.is_owner(key, &peer.uid) {
                return true;
            }
        }

        false
    }

    fn rebuild_ring(&mut self) {
        self.ring = HashRing::from_members(self.members.keys());
    }
}
