//! Ownership-protocol simulations.
//!
//! Drives several coordinator views through scripted and adversarial
//! notification interleavings and checks the protocol's one guarantee:
//! a key never has two owners, no matter the delivery order. A key may
//! transiently have no owner while views catch up; that is expected.

use shardlock::{
    ClusterMember, CoordinationClient, HashRing, MemoryCluster, NoopRebalanceObserver,
    PartitionCoordinator, PartitionLockBinding, PathLayout, RebalanceObserver,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sample_keys() -> Vec<String> {
    (0..50).map(|i| format!("key-{i}")).collect()
}

/// Scripted cluster of coordinator views with per-view delivery control.
///
/// Holds the authoritative presence and claim child lists; each view only
/// advances when the script delivers a snapshot to it, so arbitrary
/// stale-view interleavings can be expressed.
struct Script {
    next_seq: u64,
    presence: Vec<String>,
    claims: HashMap<String, String>,
    views: HashMap<String, PartitionCoordinator>,
}

impl Script {
    fn new() -> Self {
        Self {
            next_seq: 1,
            presence: Vec::new(),
            claims: HashMap::new(),
            views: HashMap::new(),
        }
    }

    /// A member joins: its presence node appears and it immediately
    /// receives the current snapshots, as a freshly-installed watch
    /// would deliver them. Nobody else learns of it yet.
    fn join(&mut self, uid: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let local = ClusterMember::local(uid, seq);
        self.presence.push(local.presence_node_name());
        self.views.insert(uid.to_string(), PartitionCoordinator::new(local));
        self.deliver_presence(uid);
        self.deliver_claims(uid);
    }

    /// A member leaves cleanly: claim node first, then presence node.
    fn leave(&mut self, uid: &str) {
        self.claims.remove(uid);
        self.presence
            .retain(|name| !name.starts_with(&ClusterMember::presence_prefix(uid)));
        self.views.remove(uid);
    }

    /// A member crashes: both nodes vanish at once, no cleanup.
    fn crash(&mut self, uid: &str) {
        self.leave(uid);
    }

    /// Deliver the current presence snapshot to one view. If the view
    /// demands a claim advance, perform it: new claim node first, then
    /// the old one replaced, then the local record updated.
    fn deliver_presence(&mut self, uid: &str) {
        let presence = self.presence.clone();
        let view = self.views.get_mut(uid).unwrap();
        if let Some(advance) = view.on_presence_changed(&presence) {
            let me = view.local().unwrap();
            let name = me.claim_node_name_for(advance.new_lock_seq);
            self.claims.insert(uid.to_string(), name);
            view.complete_claim_advance(advance.new_lock_seq).unwrap();
        }
    }

    /// Deliver the current claim snapshot to one view.
    fn deliver_claims(&mut self, uid: &str) {
        let claims: Vec<String> = self.claims.values().cloned().collect();
        let view = self.views.get_mut(uid).unwrap();
        if let Some(advance) = view.on_claim_changed(&claims) {
            let me = view.local().unwrap();
            let name = me.claim_node_name_for(advance.new_lock_seq);
            self.claims.insert(uid.to_string(), name);
            view.complete_claim_advance(advance.new_lock_seq).unwrap();
        }
    }

    /// Deliver everything to everyone until no view changes anymore.
    fn deliver_all(&mut self) {
        let uids: Vec<String> = self.views.keys().cloned().collect();
        // Claim advances can cascade; two sweeps settle a single change,
        // a few more cover pathological join bursts.
        for _ in 0..4 {
            for uid in &uids {
                self.deliver_presence(uid);
                self.deliver_claims(uid);
            }
        }
    }

    fn owners_of(&self, key: &str) -> Vec<String> {
        self.views
            .iter()
            .filter(|(_, view)| view.owns(key))
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    #[track_caller]
    fn assert_at_most_one_owner(&self) {
        for key in sample_keys() {
            let owners = self.owners_of(&key);
            assert!(
                owners.len() <= 1,
                "key {key} owned by {owners:?} simultaneously"
            );
        }
    }

    #[track_caller]
    fn assert_exactly_one_owner(&self) {
        for key in sample_keys() {
            let owners = self.owners_of(&key);
            assert_eq!(owners.len(), 1, "key {key} owned by {owners:?}");
        }
    }
}

#[test]
fn staggered_join_never_double_owns() {
    let mut script = Script::new();
    script.join("a");
    script.deliver_all();
    script.assert_exactly_one_owner();

    // "b" joins; only "b" learns of it first. "b" defers every key to
    // "a"'s pre-join assignment, so nothing is double-owned even though
    // "a" still believes it is alone.
    script.join("b");
    script.deliver_presence("b");
    script.assert_at_most_one_owner();
    for key in sample_keys() {
        assert!(!script.views["b"].owns(&key), "b must defer to a on {key}");
    }

    // "a" catches up and advances its claim, but "b" has not seen the
    // new claim yet; still no double ownership.
    script.deliver_presence("a");
    script.assert_at_most_one_owner();

    // Claim propagation completes the handover.
    script.deliver_claims("b");
    script.assert_exactly_one_owner();
}

#[test]
fn join_burst_with_adversarial_delivery_order() {
    let mut script = Script::new();
    for uid in ["a", "b", "c"] {
        script.join(uid);
    }

    // Deliver in every pairwise order: claims before presence, newest
    // view first, oldest last.
    script.deliver_claims("c");
    script.deliver_presence("c");
    script.assert_at_most_one_owner();
    script.deliver_presence("b");
    script.deliver_claims("b");
    script.assert_at_most_one_owner();
    script.deliver_claims("a");
    script.deliver_presence("a");
    script.assert_at_most_one_owner();

    script.deliver_all();
    script.assert_exactly_one_owner();
}

#[test]
fn clean_leave_reassigns_all_keys() {
    let mut script = Script::new();
    for uid in ["a", "b", "c"] {
        script.join(uid);
    }
    script.deliver_all();
    script.assert_exactly_one_owner();

    script.leave("a");
    // Survivors learn through different streams first.
    script.deliver_claims("b");
    script.assert_at_most_one_owner();
    script.deliver_presence("c");
    script.assert_at_most_one_owner();

    script.deliver_all();
    script.assert_exactly_one_owner();
    for key in sample_keys() {
        assert_ne!(script.owners_of(&key), vec!["a".to_string()]);
    }
}

#[test]
fn crash_without_cleanup_reassigns_all_keys() {
    let mut script = Script::new();
    for uid in ["a", "b", "c", "d"] {
        script.join(uid);
    }
    script.deliver_all();
    script.assert_exactly_one_owner();

    script.crash("c");
    script.deliver_presence("a");
    script.assert_at_most_one_owner();
    script.deliver_all();
    script.assert_exactly_one_owner();
}

#[test]
fn identical_redelivery_is_a_noop() {
    let mut script = Script::new();
    script.join("a");
    script.join("b");
    script.deliver_all();

    let owners_before: Vec<Vec<String>> =
        sample_keys().iter().map(|key| script.owners_of(key)).collect();
    let counts_before: Vec<usize> = script.views.values().map(|v| v.member_count()).collect();

    // Same snapshots again, several times.
    script.deliver_all();
    script.deliver_all();

    let owners_after: Vec<Vec<String>> =
        sample_keys().iter().map(|key| script.owners_of(key)).collect();
    let counts_after: Vec<usize> = script.views.values().map(|v| v.member_count()).collect();
    assert_eq!(owners_before, owners_after);
    assert_eq!(counts_before, counts_after);
}

#[test]
fn late_joiner_defers_to_uncaught_earlier_members() {
    let mut script = Script::new();
    for uid in ["a", "b"] {
        script.join(uid);
    }
    script.deliver_all();

    // Right after joining, every earlier member's last-rebalanced
    // assignment still covers the whole key space, so "d" owns nothing.
    script.join("d");
    for key in sample_keys() {
        assert!(!script.views["d"].owns(&key));
    }
    script.assert_at_most_one_owner();

    // "a" catches up and cedes keys; "d" may pick those up, but keys
    // that "b"'s stale assignment covers stay off limits.
    script.deliver_presence("a");
    script.deliver_claims("d");
    script.assert_at_most_one_owner();

    script.deliver_all();
    script.assert_exactly_one_owner();
    let owns_some = sample_keys()
        .iter()
        .any(|key| script.views["d"].owns(key));
    assert!(owns_some, "after full agreement d must hold a share");
}

#[test]
fn converged_ownership_matches_reference_ring() {
    let mut script = Script::new();
    for uid in ["a", "b", "c"] {
        script.join(uid);
    }
    script.deliver_all();

    // After convergence every view must answer exactly as a plain
    // consistent-hash computation over the full member set would.
    let reference = HashRing::from_members(["a", "b", "c"]);
    for i in 0..10_000 {
        let key = format!("key-{i}");
        let owner = reference.owner(&key).unwrap();
        for (uid, view) in &script.views {
            assert_eq!(
                view.owns(&key),
                uid == owner,
                "view {uid} disagrees with reference on {key}"
            );
        }
    }
}

#[test]
fn uuid_member_ids_survive_node_name_round_trips() {
    // Production uids are uuid strings; their dashes must not confuse
    // the node-name parsing.
    let mut script = Script::new();
    let uids: Vec<String> = (0..3).map(|_| uuid::Uuid::new_v4().to_string()).collect();
    for uid in &uids {
        script.join(uid);
    }
    script.deliver_all();
    script.assert_exactly_one_owner();
    for uid in &uids {
        assert!(script.views[uid].local().is_some());
    }
}

/// Observer recording which of the sampled keys were dropped.
struct RecordingObserver {
    calls: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl RebalanceObserver for RecordingObserver {
    fn release_resources(&self, owns: &dyn Fn(&str) -> bool) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut released = self.released.lock();
        for key in sample_keys() {
            if !owns(&key) {
                released.push(key);
            }
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn release_callback_fires_after_claim_advance() {
    let cluster = MemoryCluster::new();
    let paths = PathLayout::default();
    let observer = Arc::new(RecordingObserver::new());

    let first_client = cluster.client();
    first_client.connect().await.unwrap();
    let first = PartitionLockBinding::start(
        first_client,
        &paths,
        "presence",
        "alpha",
        observer.clone(),
    )
    .await
    .unwrap();
    settle().await;
    assert_eq!(observer.calls.load(Ordering::SeqCst), 0);

    let second_client = cluster.client();
    second_client.connect().await.unwrap();
    let second = PartitionLockBinding::start(
        second_client,
        &paths,
        "presence",
        "beta",
        Arc::new(NoopRebalanceObserver),
    )
    .await
    .unwrap();
    settle().await;

    // The joiner forced alpha's claim forward; alpha was told to release
    // exactly the keys that moved to beta.
    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    let released = observer.released.lock().clone();
    for key in &released {
        assert!(!first.owns(key));
        assert!(second.owns(key));
    }
    assert!(!released.is_empty(), "some keys must move to the joiner");

    first.cleanup().await;
    second.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn churn_over_memory_cluster_converges() {
    let cluster = MemoryCluster::new();
    let paths = PathLayout::default();

    let mut bindings: Vec<(Arc<shardlock::MemoryClient>, PartitionLockBinding)> = Vec::new();
    for uid in ["a", "b", "c"] {
        let client = cluster.client();
        client.connect().await.unwrap();
        let binding = PartitionLockBinding::start(
            client.clone(),
            &paths,
            "presence",
            uid,
            Arc::new(NoopRebalanceObserver),
        )
        .await
        .unwrap();
        bindings.push((client, binding));
        settle().await;
    }
    settle().await;

    let assert_exactly_one = |bindings: &[(Arc<shardlock::MemoryClient>, PartitionLockBinding)]| {
        for key in sample_keys() {
            let owners = bindings
                .iter()
                .filter(|(_, binding)| binding.owns(&key))
                .count();
            assert_eq!(owners, 1, "key {key} has {owners} owners");
        }
    };
    assert_exactly_one(&bindings);

    // Crash "b" mid-flight.
    let (client, binding) = bindings.remove(1);
    cluster.expire_session(&client);
    drop(binding);
    settle().await;
    assert_exactly_one(&bindings);

    // A new member joins after the crash.
    let client = cluster.client();
    client.connect().await.unwrap();
    let binding = PartitionLockBinding::start(
        client.clone(),
        &paths,
        "presence",
        "d",
        Arc::new(NoopRebalanceObserver),
    )
    .await
    .unwrap();
    bindings.push((client, binding));
    settle().await;
    assert_exactly_one(&bindings);

    for (_, binding) in &bindings {
        binding.cleanup().await;
    }
}
