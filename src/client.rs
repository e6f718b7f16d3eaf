//! Coordination-service client seam.
//!
//! The external coordination service (a ZooKeeper-like system providing
//! linearizable ephemeral/sequential node creation and children-change
//! notifications) sits behind this trait so the rest of the subsystem can
//! be driven by any implementation, including the in-memory one used by
//! the simulation tests.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Disappears when the creator's session ends.
    Ephemeral,
    /// Ephemeral, with a service-assigned strictly increasing decimal
    /// suffix appended to the supplied path prefix.
    EphemeralSequential,
}

/// Session-level events delivered by the client library.
///
/// These may originate on the client's own network thread; consumers must
/// marshal them onto their coordinating task before touching shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session is established (first connect or recovery).
    Connected,
    /// The connection dropped; the service is attempting auto-recovery.
    Suspended,
    /// The session is gone; all ephemeral nodes have been removed.
    Lost,
    /// A connect attempt failed before a session existed.
    ConnectFailed,
}

/// Asynchronous client to the coordination service.
///
/// All node operations return futures; callers must not assume relative
/// completion order of two independently issued calls unless they await
/// one before issuing the other.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Start a connect attempt. Session establishment is reported through
    /// [`CoordinationClient::subscribe_session`].
    async fn connect(&self) -> Result<()>;

    /// Close the session and release all ephemeral nodes.
    async fn close(&self) -> Result<()>;

    /// Recursively create a parent path if it does not exist.
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create a node and return its final full path.
    ///
    /// For [`CreateMode::EphemeralSequential`], `path` is a prefix and the
    /// service appends the sequence suffix.
    async fn create(&self, path: &str, payload: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Watch a path's children. The receiver gets the full current child
    /// list immediately and a full snapshot (not a diff) on every change.
    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Vec<String>>>;

    /// Subscribe to session-level events.
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Extract the node name from a full path returned by [`CoordinationClient::create`].
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
