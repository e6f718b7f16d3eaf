//! Error types for the coordination subsystem.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the coordination subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination-service session errors.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Peer routing errors.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Partition-ownership protocol errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cluster registry errors.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coordination-service session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Initial connection could not be established.
    #[error("connect failed: {reason}")]
    ConnectFailed { reason: String },

    /// The session was expired by the coordination service.
    #[error("session expired")]
    Expired,

    /// An operation was attempted while not connected.
    #[error("not connected")]
    NotConnected,

    /// The session was closed locally.
    #[error("session closed")]
    Closed,
}

/// Peer routing errors.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// No live members for a dependency service; routing is impossible.
    #[error("no live members for service: {service}")]
    NoMembers { service: String },

    /// The service name has no membership table.
    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Partition-ownership protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A child-node name did not parse as `uid-seq` or `uid-seq-lockseq`.
    #[error("malformed node name: {0}")]
    MalformedNodeName(String),

    /// A claim version moved backwards; a correctness bug under the protocol.
    #[error("claim regression for {uid}: cached {cached}, observed {observed}")]
    ClaimRegression {
        uid: String,
        cached: u64,
        observed: u64,
    },

    /// A node already exists at the given path.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// No node exists at the given path.
    #[error("node not found: {0}")]
    NodeNotFound(String),
}

/// Cluster registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The process-wide server descriptor was already registered.
    #[error("server already registered")]
    AlreadyRegistered,

    /// No server descriptor has been registered yet.
    #[error("no server registered")]
    NotRegistered,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
