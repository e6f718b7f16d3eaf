//! In-memory coordination service.
//!
//! Implements [`CoordinationClient`] entirely in-process: per-session
//! ephemeral nodes, monotonic sequence assignment per parent path, and
//! snapshot watch delivery, plus fault injection (session expiry,
//! suspension, failing connects) so tests can drive the session state
//! machine and the ownership protocol through real interleavings.

use crate::client::{CoordinationClient, CreateMode, SessionEvent};
use crate::error::{ProtocolError, Result, SessionError};
use crate::types::SEQ_SUFFIX_WIDTH;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

#[derive(Debug, Clone)]
struct NodeRecord {
    payload: Vec<u8>,
    session: u64,
}

#[derive(Default)]
struct Hub {
    /// Parent path -> child name -> node.
    parents: HashMap<String, BTreeMap<String, NodeRecord>>,

    /// Sequence counter per parent path.
    counters: HashMap<String, u64>,

    /// Children watchers per parent path.
    watches: HashMap<String, Vec<mpsc::UnboundedSender<Vec<String>>>>,

    /// Creations per full node path prefix, for test assertions.
    creations: HashMap<String, u64>,

    next_session: u64,
}

impl Hub {
    fn fire_watches(&mut self, parent: &str) {
        let snapshot: Vec<String> = self
            .parents
            .get(parent)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default();

        if let Some(watchers) = self.watches.get_mut(parent) {
            watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }

    fn drop_session_nodes(&mut self, session: u64) -> Vec<String> {
        let mut affected = Vec::new();
        for (parent, children) in self.parents.iter_mut() {
            let before = children.len();
            children.retain(|_, record| record.session != session);
            if children.len() != before {
                affected.push(parent.clone());
            }
        }
        affected
    }
}

/// Shared in-memory coordination service.
pub struct MemoryCluster {
    hub: Mutex<Hub>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: Mutex::new(Hub {
                next_session: 1,
                ..Hub::default()
            }),
        })
    }

    /// Create a client with its own session lifecycle.
    pub fn client(self: &Arc<Self>) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            cluster: self.clone(),
            session: Mutex::new(None),
            events: broadcast::channel(64).0,
            fail_connects: AtomicU32::new(0),
            fail_creates: AtomicU32::new(0),
        })
    }

    /// Expire a client's session: all its ephemeral nodes disappear and
    /// the client observes a `Lost` event, as after a crash-without-cleanup
    /// or a network partition outliving the session timeout.
    pub fn expire_session(&self, client: &MemoryClient) {
        let session = client.session.lock().take();
        if let Some(session) = session {
            let mut hub = self.hub.lock();
            let affected = hub.drop_session_nodes(session);
            for parent in affected {
                hub.fire_watches(&parent);
            }
            debug!(session, "session expired");
        }
        let _ = client.events.send(SessionEvent::Lost);
    }

    /// Drop the connection without ending the session; the service will
    /// recover it by itself.
    pub fn suspend_session(&self, client: &MemoryClient) {
        let _ = client.events.send(SessionEvent::Suspended);
    }

    /// Recover a suspended connection.
    pub fn resume_session(&self, client: &MemoryClient) {
        let _ = client.events.send(SessionEvent::Connected);
    }

    /// Make the next `n` connect attempts of a client fail.
    pub fn fail_next_connects(&self, client: &MemoryClient, n: u32) {
        client.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` node creations of a client fail.
    pub fn fail_next_creates(&self, client: &MemoryClient, n: u32) {
        client.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Current children of a parent path, sorted.
    pub fn children(&self, parent: &str) -> Vec<String> {
        self.hub
            .lock()
            .parents
            .get(parent)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a node exists.
    pub fn node_exists(&self, path: &str) -> bool {
        let Some((parent, name)) = path.rsplit_once('/') else {
            return false;
        };
        self.hub
            .lock()
            .parents
            .get(parent)
            .map(|children| children.contains_key(name))
            .unwrap_or(false)
    }

    /// Payload of a node, if it exists.
    pub fn payload(&self, path: &str) -> Option<Vec<u8>> {
        let (parent, name) = path.rsplit_once('/')?;
        self.hub
            .lock()
            .parents
            .get(parent)?
            .get(name)
            .map(|record| record.payload.clone())
    }

    /// How many times a node was created at exactly this path.
    pub fn creation_count(&self, path: &str) -> u64 {
        self.hub.lock().creations.get(path).copied().unwrap_or(0)
    }
}

/// One client (one process) of a [`MemoryCluster`].
pub struct MemoryClient {
    cluster: Arc<MemoryCluster>,
    session: Mutex<Option<u64>>,
    events: broadcast::Sender<SessionEvent>,
    fail_connects: AtomicU32,
    fail_creates: AtomicU32,
}

impl MemoryClient {
    fn current_session(&self) -> Result<u64> {
        (*self.session.lock()).ok_or_else(|| SessionError::NotConnected.into())
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn connect(&self) -> Result<()> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::ConnectFailed {
                reason: "injected connect failure".to_string(),
            }
            .into());
        }

        let session = {
            let mut hub = self.cluster.hub.lock();
            let session = hub.next_session;
            hub.next_session += 1;
            session
        };
        *self.session.lock() = Some(session);
        debug!(session, "session established");

        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let mut hub = self.cluster.hub.lock();
            let affected = hub.drop_session_nodes(session);
            for parent in affected {
                hub.fire_watches(&parent);
            }
            debug!(session, "session closed");
        }
        Ok(())
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        self.current_session()?;
        self.cluster
            .hub
            .lock()
            .parents
            .entry(path.to_string())
            .or_default();
        Ok(())
    }

    async fn create(&self, path: &str, payload: Vec<u8>, mode: CreateMode) -> Result<String> {
        let session = self.current_session()?;
        let failures = self.fail_creates.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_creates.store(failures - 1, Ordering::SeqCst);
            return Err(crate::error::Error::Internal(
                "injected create failure".to_string(),
            ));
        }
        let (parent, name) = path
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::MalformedNodeName(path.to_string()))?;

        let mut hub = self.cluster.hub.lock();
        if !hub.parents.contains_key(parent) {
            return Err(ProtocolError::NodeNotFound(parent.to_string()).into());
        }

        let final_name = match mode {
            CreateMode::Ephemeral => name.to_string(),
            CreateMode::EphemeralSequential => {
                let counter = hub.counters.entry(parent.to_string()).or_insert(0);
                *counter += 1;
                format!("{name}{:0width$}", *counter, width = SEQ_SUFFIX_WIDTH)
            }
        };

        let children = hub
            .parents
            .get_mut(parent)
            .ok_or_else(|| ProtocolError::NodeNotFound(parent.to_string()))?;
        if children.contains_key(&final_name) {
            return Err(ProtocolError::NodeExists(format!("{parent}/{final_name}")).into());
        }
        children.insert(final_name.clone(), NodeRecord { payload, session });

        let full = format!("{parent}/{final_name}");
        *hub.creations.entry(full.clone()).or_insert(0) += 1;
        hub.fire_watches(parent);

        debug!(path = %full, "node created");
        Ok(full)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.current_session()?;
        let (parent, name) = path
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::MalformedNodeName(path.to_string()))?;

        let mut hub = self.cluster.hub.lock();
        let removed = hub
            .parents
            .get_mut(parent)
            .and_then(|children| children.remove(name));
        if removed.is_none() {
            return Err(ProtocolError::NodeNotFound(path.to_string()).into());
        }
        hub.fire_watches(parent);

        debug!(path, "node deleted");
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Vec<String>>> {
        self.current_session()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut hub = self.cluster.hub.lock();
        let snapshot: Vec<String> = hub
            .parents
            .get(path)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default();
        let _ = tx.send(snapshot);
        hub.watches.entry(path.to_string()).or_default().push(tx);

        Ok(rx)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
