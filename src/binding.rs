//! Binding between the partition coordinator and the coordination service.
//!
//! Owns the service-side footprint of the local member: the ephemeral
//! sequential presence node, the claim node, and the two children
//! watches. Every notification is marshalled onto one driver task, so
//! presence and claim snapshots never race against each other.

use crate::client::{node_name, CoordinationClient, CreateMode};
use crate::config::PathLayout;
use crate::coordinator::{ClaimAdvance, PartitionCoordinator, RebalanceObserver};
use crate::error::{Error, ProtocolError, Result};
use crate::types::{ClusterMember, MemberId, StreamKind};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before a failed claim advance is attempted again.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Live membership of the local process in one service's partition group.
///
/// Created through [`PartitionLockBinding::start`], torn down through
/// [`PartitionLockBinding::cleanup`].
pub struct PartitionLockBinding {
    client: Arc<dyn CoordinationClient>,
    claim_parent: String,
    presence_path: String,
    coordinator: Arc<Mutex<PartitionCoordinator>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionLockBinding {
    /// Join the partition group of `service` as `uid`.
    ///
    /// Creates the presence node, derives the local member from the
    /// sequence the service assigned, and starts watching both children
    /// streams. The claim node is created lazily, on the first required
    /// claim advance.
    pub async fn start(
        client: Arc<dyn CoordinationClient>,
        paths: &PathLayout,
        service: &str,
        uid: &str,
        observer: Arc<dyn RebalanceObserver>,
    ) -> Result<Self> {
        let presence_parent = paths.presence_parent(service);
        let claim_parent = paths.claim_parent(service);
        client.ensure_path(&presence_parent).await?;
        client.ensure_path(&claim_parent).await?;

        let prefix = ClusterMember::presence_prefix(uid);
        let presence_path = client
            .create(
                &format!("{presence_parent}/{prefix}"),
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let local = ClusterMember::parse(node_name(&presence_path), StreamKind::Presence)?;
        info!(uid, service_seq = local.service_seq, service, "joined partition group");

        let coordinator = Arc::new(Mutex::new(PartitionCoordinator::new(local)));

        // Watch after our own node exists, so the initial snapshots
        // already contain us.
        let presence_rx = client.watch_children(&presence_parent).await?;
        let claim_rx = client.watch_children(&claim_parent).await?;

        let cancel = CancellationToken::new();
        let driver = BindingDriver {
            client: client.clone(),
            claim_parent: claim_parent.clone(),
            coordinator: coordinator.clone(),
            observer,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run(presence_rx, claim_rx));

        Ok(Self {
            client,
            claim_parent,
            presence_path,
            coordinator,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Whether the local member currently owns `key`.
    pub fn owns(&self, key: &str) -> bool {
        self.coordinator.lock().owns(key)
    }

    /// Uid of the local member.
    pub fn uid(&self) -> MemberId {
        self.coordinator.lock().local().map(|m| m.uid.clone()).unwrap_or_default()
    }

    /// Number of members in the current view.
    pub fn member_count(&self) -> usize {
        self.coordinator.lock().member_count()
    }

    /// Leave the partition group: stop the driver and delete this
    /// member's nodes, claim first so no window exists where a stale
    /// claim outlives its presence. Deletes are best effort; ephemeral
    /// nodes die with the session anyway.
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let claim_path = {
            let coordinator = self.coordinator.lock();
            coordinator
                .local()
                .filter(|m| m.locked)
                .map(|m| format!("{}/{}", self.claim_parent, m.claim_node_name()))
        };
        if let Some(path) = claim_path {
            if let Err(e) = self.client.delete(&path).await {
                warn!(path = %path, error = %e, "claim node delete failed");
            }
        }
        if let Err(e) = self.client.delete(&self.presence_path).await {
            warn!(path = %self.presence_path, error = %e, "presence node delete failed");
        }

        self.coordinator.lock().purge_local();
        info!("left partition group");
    }
}

/// The single task processing both children streams.
struct BindingDriver {
    client: Arc<dyn CoordinationClient>,
    claim_parent: String,
    coordinator: Arc<Mutex<PartitionCoordinator>>,
    observer: Arc<dyn RebalanceObserver>,
    cancel: CancellationToken,
}

impl BindingDriver {
    async fn run(
        self,
        mut presence_rx: mpsc::UnboundedReceiver<Vec<String>>,
        mut claim_rx: mpsc::UnboundedReceiver<Vec<String>>,
    ) {
        // A mandatory advance that failed against the service; retried on
        // a timer so a quiet cluster cannot stall the rebalance forever.
        let mut pending: Option<ClaimAdvance> = None;
        let mut retry: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            let advance = tokio::select! {
                _ = self.cancel.cancelled() => break,

                snapshot = presence_rx.recv() => match snapshot {
                    Some(names) => self.coordinator.lock().on_presence_changed(&names),
                    None => break,
                },

                snapshot = claim_rx.recv() => match snapshot {
                    Some(names) => self.coordinator.lock().on_claim_changed(&names),
                    None => break,
                },

                () = async { retry.as_mut().expect("guarded").as_mut().await },
                        if retry.is_some() => {
                    retry = None;
                    pending.take()
                }
            };

            // A fresh snapshot can only demand the same or a later claim
            // version, so the newest advance supersedes any pending one.
            if let Some(advance) = advance {
                if self.advance_claim(advance).await {
                    pending = None;
                    retry = None;
                } else {
                    pending = Some(advance);
                    if retry.is_none() {
                        retry = Some(Box::pin(tokio::time::sleep(CLAIM_RETRY_DELAY)));
                    }
                }
            }
        }
        debug!("binding driver stopped");
    }

    /// Move the local claim to a new version: create the new claim node,
    /// then delete the previous one, then update the local view and give
    /// the application a chance to drop keys it no longer owns.
    ///
    /// The create comes strictly before the delete so peers never observe
    /// us without a current claim. On a failed create nothing is mutated
    /// and false is returned; the caller re-queues the advance. A claim
    /// node already existing at the exact target path is our own leftover
    /// from a previous partial attempt and counts as created.
    async fn advance_claim(&self, advance: ClaimAdvance) -> bool {
        let (member, previous) = {
            let coordinator = self.coordinator.lock();
            let Some(me) = coordinator.local() else {
                return true;
            };
            let previous = me.locked.then(|| me.claim_node_name());
            (me.clone(), previous)
        };

        let new_path = format!(
            "{}/{}",
            self.claim_parent,
            member.claim_node_name_for(advance.new_lock_seq)
        );
        match self.client.create(&new_path, Vec::new(), CreateMode::Ephemeral).await {
            Ok(_) | Err(Error::Protocol(ProtocolError::NodeExists(_))) => {}
            Err(e) => {
                warn!(path = %new_path, error = %e, "claim node create failed");
                return false;
            }
        }

        if let Some(previous) = previous {
            let old_path = format!("{}/{previous}", self.claim_parent);
            if let Err(e) = self.client.delete(&old_path).await {
                warn!(path = %old_path, error = %e, "stale claim delete failed");
            }
        }

        let completed = self
            .coordinator
            .lock()
            .complete_claim_advance(advance.new_lock_seq);
        match completed {
            Ok(()) => {
                info!(
                    uid = %member.uid,
                    lock_seq = advance.new_lock_seq,
                    "claim advanced, releasing reassigned keys"
                );
                let coordinator = self.coordinator.clone();
                self.observer
                    .release_resources(&move |key| coordinator.lock().owns(key));
            }
            Err(e) => warn!(error = %e, "recording claim advance failed"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::NoopRebalanceObserver;
    use crate::memory::MemoryCluster;
    use std::time::Duration;

    async fn settle() {
        // Let watch notifications drain through the driver tasks.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn join(
        cluster: &Arc<MemoryCluster>,
        paths: &PathLayout,
        uid: &str,
    ) -> PartitionLockBinding {
        let client = cluster.client();
        client.connect().await.unwrap();
        PartitionLockBinding::start(
            client,
            paths,
            "presence",
            uid,
            Arc::new(NoopRebalanceObserver),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_owns_everything() {
        let cluster = MemoryCluster::new();
        let paths = PathLayout::default();
        let binding = join(&cluster, &paths, "alpha").await;
        settle().await;

        assert_eq!(binding.member_count(), 1);
        for key in ["a", "b", "c", "room-17"] {
            assert!(binding.owns(key));
        }
        binding.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_triggers_claim_advance_of_earlier_member() {
        let cluster = MemoryCluster::new();
        let paths = PathLayout::default();

        let first = join(&cluster, &paths, "alpha").await;
        settle().await;
        let second = join(&cluster, &paths, "beta").await;
        settle().await;

        assert_eq!(first.member_count(), 2);
        assert_eq!(second.member_count(), 2);

        // The earlier member must have advanced its claim past the
        // joiner's arrival; a claim node appears for it.
        let claims = cluster.children(&paths.claim_parent("presence"));
        assert!(claims.iter().any(|name| name.starts_with("alpha-")));

        // The two views agree on every key, exactly one owner each.
        for key in ["a", "b", "c", "d", "e", "room-17", "room-42"] {
            let owners =
                usize::from(first.owns(key)) + usize::from(second.owns(key));
            assert_eq!(owners, 1, "key {key} must have exactly one owner");
        }

        first.cleanup().await;
        second.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_claim_advance_retries_without_new_snapshots() {
        let cluster = MemoryCluster::new();
        let paths = PathLayout::default();

        let first_client = cluster.client();
        first_client.connect().await.unwrap();
        let first = PartitionLockBinding::start(
            first_client.clone(),
            &paths,
            "presence",
            "alpha",
            Arc::new(NoopRebalanceObserver),
        )
        .await
        .unwrap();
        settle().await;

        // The next create on alpha's client is the claim node demanded
        // by the joiner; it fails once.
        cluster.fail_next_creates(&first_client, 1);
        let second = join(&cluster, &paths, "beta").await;
        settle().await;
        let claims = cluster.children(&paths.claim_parent("presence"));
        assert!(claims.is_empty(), "claim create failed, none expected yet");

        // No further children changes arrive; the driver must recover by
        // itself.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let claims = cluster.children(&paths.claim_parent("presence"));
        assert!(claims.iter().any(|name| name.starts_with("alpha-")));

        for key in ["a", "b", "c", "room-17"] {
            let owners =
                usize::from(first.owns(key)) + usize::from(second.owns(key));
            assert_eq!(owners, 1, "key {key} must have exactly one owner");
        }

        first.cleanup().await;
        second.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_both_nodes() {
        let cluster = MemoryCluster::new();
        let paths = PathLayout::default();

        let first = join(&cluster, &paths, "alpha").await;
        let second = join(&cluster, &paths, "beta").await;
        settle().await;
        first.cleanup().await;
        settle().await;

        let presence = cluster.children(&paths.presence_parent("presence"));
        assert!(presence.iter().all(|name| !name.starts_with("alpha-")));
        let claims = cluster.children(&paths.claim_parent("presence"));
        assert!(claims.iter().all(|name| !name.starts_with("alpha-")));

        // The survivor takes the whole key space back.
        settle().await;
        for key in ["a", "b", "c"] {
            assert!(second.owns(key));
        }
        second.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_without_cleanup_reassigns_keys() {
        let cluster = MemoryCluster::new();
        let paths = PathLayout::default();

        let survivor = join(&cluster, &paths, "alpha").await;
        let victim_client = cluster.client();
        victim_client.connect().await.unwrap();
        let victim = PartitionLockBinding::start(
            victim_client.clone(),
            &paths,
            "presence",
            "beta",
            Arc::new(NoopRebalanceObserver),
        )
        .await
        .unwrap();
        settle().await;
        assert_eq!(survivor.member_count(), 2);

        // Session expiry wipes the victim's ephemerals; the survivor's
        // watches see the shrink without any explicit cleanup.
        cluster.expire_session(&victim_client);
        settle().await;

        assert_eq!(survivor.member_count(), 1);
        for key in ["a", "b", "c"] {
            assert!(survivor.owns(key));
        }

        drop(victim);
        survivor.cleanup().await;
    }
}
