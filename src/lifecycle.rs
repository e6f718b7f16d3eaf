//! Server lifecycle orchestration.
//!
//! Couples the application's health (starting, running, stopping) with
//! the coordination session: the working and alive nodes exist exactly
//! while the server is running AND the session is established, and
//! dependency membership watches are armed once per service.

use crate::client::{CoordinationClient, CreateMode};
use crate::config::CoordinatorConfig;
use crate::error::{Error, ProtocolError};
use crate::membership::ServiceRoster;
use crate::registry::ClusterRegistry;
use crate::session::{ConnectionSession, ConnectionState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Application health as reported by the embedding server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    /// Booting, not yet serving.
    Starting,
    /// Serving traffic.
    Running,
    /// Draining before exit.
    Stopping,
}

impl std::fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerHealth::Starting => "starting",
            ServerHealth::Running => "running",
            ServerHealth::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Drives the service-side footprint of this server from health and
/// session transitions.
pub struct LifecycleOrchestrator {
    health_tx: watch::Sender<ServerHealth>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleOrchestrator {
    /// Start orchestrating. The working node appears once the health is
    /// set to [`ServerHealth::Running`] and the session is connected.
    pub fn start(
        session: &ConnectionSession,
        config: Arc<CoordinatorConfig>,
        registry: Arc<ClusterRegistry>,
        roster: Arc<ServiceRoster>,
    ) -> Self {
        let (health_tx, health_rx) = watch::channel(ServerHealth::Starting);
        let cancel = CancellationToken::new();

        let task = LifecycleTask {
            client: session.client(),
            config,
            registry,
            roster,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(health_rx, session.subscribe()));

        Self {
            health_tx,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Report a health transition.
    pub fn set_health(&self, health: ServerHealth) {
        self.health_tx.send_replace(health);
    }

    /// Current reported health.
    pub fn health(&self) -> ServerHealth {
        *self.health_tx.borrow()
    }

    /// Stop orchestrating. Does not delete nodes; callers drain through
    /// [`ServerHealth::Stopping`] first, and ephemerals die with the
    /// session regardless.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct LifecycleTask {
    client: Arc<dyn CoordinationClient>,
    config: Arc<CoordinatorConfig>,
    registry: Arc<ClusterRegistry>,
    roster: Arc<ServiceRoster>,
    cancel: CancellationToken,
}

impl LifecycleTask {
    async fn run(
        self,
        mut health_rx: watch::Receiver<ServerHealth>,
        mut state_rx: watch::Receiver<ConnectionState>,
    ) {
        // Whether our working/alive nodes exist under the current session.
        let mut published = false;

        loop {
            let health = *health_rx.borrow_and_update();
            let state = *state_rx.borrow_and_update();

            // Session loss kills the ephemerals; forget them so the next
            // connected+running evaluation recreates them, once.
            if state == ConnectionState::Closed && published {
                debug!("session lost, working node gone with it");
                published = false;
            }

            // The working node exists exactly while running; any health
            // transition away from Running withdraws it.
            if state == ConnectionState::Connected {
                if health == ServerHealth::Running && !published {
                    published = self.publish().await;
                } else if health != ServerHealth::Running && published {
                    self.unpublish().await;
                    published = false;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = health_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("lifecycle task stopped");
    }

    /// Create the working and alive nodes and arm dependency watches.
    /// Returns whether the footprint is up; on failure the next health or
    /// session transition retries.
    async fn publish(&self) -> bool {
        let descriptor = match self.registry.current() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(error = %e, "cannot publish before registration");
                return false;
            }
        };
        let payload = match descriptor.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "serializing server descriptor failed");
                return false;
            }
        };

        let paths = &self.config.paths;
        let service = &self.config.service_name;
        let working = paths.working_node(service, &descriptor.uid);
        let alive = paths.alive_node(service, &descriptor.uid);

        let steps = async {
            self.client.ensure_path(&paths.working_parent(service)).await?;
            self.client.ensure_path(&paths.alive_parent(service)).await?;
            self.create_if_absent(&working, payload).await?;
            self.create_if_absent(&alive, Vec::new()).await?;
            crate::error::Result::Ok(())
        };
        if let Err(e) = steps.await {
            warn!(path = %working, error = %e, "publishing working node failed");
            return false;
        }
        info!(path = %working, "working node published");

        for dependency in &self.config.dependencies {
            if let Err(e) = self.arm_dependency(dependency).await {
                warn!(service = %dependency, error = %e, "arming dependency watch failed");
            }
        }
        true
    }

    /// Create an ephemeral node, treating an already-existing node as
    /// success. A leftover from a partially-failed publish belongs to
    /// this same session, so a retry must converge instead of wedging
    /// on its own node.
    async fn create_if_absent(&self, path: &str, payload: Vec<u8>) -> crate::error::Result<()> {
        match self.client.create(path, payload, CreateMode::Ephemeral).await {
            Ok(_) => Ok(()),
            Err(Error::Protocol(ProtocolError::NodeExists(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn unpublish(&self) {
        let Ok(descriptor) = self.registry.current() else {
            return;
        };
        let paths = &self.config.paths;
        let service = &self.config.service_name;

        for path in [
            paths.alive_node(service, &descriptor.uid),
            paths.working_node(service, &descriptor.uid),
        ] {
            if let Err(e) = self.client.delete(&path).await {
                warn!(path = %path, error = %e, "working node delete failed");
            }
        }
        info!("working node withdrawn");
    }

    /// Arm the membership watch for one dependency service. Keyed no-op
    /// when already armed.
    async fn arm_dependency(&self, service: &str) -> crate::error::Result<()> {
        self.roster.ensure(service);
        if !self.roster.mark_armed(service) {
            debug!(service, "dependency watch already armed");
            return Ok(());
        }

        let parent = self.config.paths.working_parent(service);
        self.client.ensure_path(&parent).await?;
        let mut rx = self.client.watch_children(&parent).await?;
        info!(service, "dependency watch armed");

        let roster = self.roster.clone();
        let service = service.to_string();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    snapshot = rx.recv() => match snapshot {
                        Some(nodes) => roster.set_all(&service, &nodes),
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }
}
