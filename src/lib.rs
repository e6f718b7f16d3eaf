//! Cluster coordination over an external coordination service.
//!
//! This crate keeps a fleet of stateful server processes agreed on which
//! process owns which hash partition, using:
//! - **Ephemeral sequential nodes** for crash-safe membership (a member's
//!   footprint dies with its session, no explicit deregistration needed)
//! - **A two-stream claim protocol** ("hash-lock") so members that joined
//!   at different times never serve the same key concurrently
//! - **Consistent hashing** for stable key placement as members come and go
//!
//! # Example
//!
//! ```rust,no_run
//! use shardlock::{
//!     ClusterRegistry, ConnectionSession, ConnectionState, CoordinatorConfig,
//!     LifecycleOrchestrator, MemoryCluster, NoopRebalanceObserver, PartitionLockBinding,
//!     ServerDescriptor, ServerHealth, ServiceRoster,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(CoordinatorConfig::new("presence", "memory"));
//!
//!     let registry = Arc::new(ClusterRegistry::new());
//!     registry.register(ServerDescriptor {
//!         service: "presence".into(),
//!         uid: "presence-a".into(),
//!     })?;
//!
//!     let cluster = MemoryCluster::new();
//!     let session = ConnectionSession::new(cluster.client(), config.session.clone());
//!     let mut state = session.subscribe();
//!     while *state.borrow_and_update() != ConnectionState::Connected {
//!         state.changed().await?;
//!     }
//!
//!     let roster = Arc::new(ServiceRoster::new());
//!     let lifecycle =
//!         LifecycleOrchestrator::start(&session, config.clone(), registry, roster);
//!     lifecycle.set_health(ServerHealth::Running);
//!
//!     let binding = PartitionLockBinding::start(
//!         session.client(),
//!         &config.paths,
//!         &config.service_name,
//!         "presence-a",
//!         Arc::new(NoopRebalanceObserver),
//!     )
//!     .await?;
//!
//!     if binding.owns("room-17") {
//!         // serve the key
//!     }
//!
//!     binding.cleanup().await;
//!     lifecycle.shutdown().await;
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Application Layer               │
//! │   owns(key)?        route(service, key)?     │
//! └──────────────────────────────────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐   ┌──────────────────┐
//! │ PartitionLock   │   │  ServiceRoster   │
//! │ Binding         │   │  (per-dependency │
//! │  └ Partition    │   │   membership)    │
//! │    Coordinator  │   └──────────────────┘
//! └─────────────────┘            ▲
//!          │                     │
//!          ▼                     │
//! ┌──────────────────────────────────────────────┐
//! │ ConnectionSession / LifecycleOrchestrator    │
//! │        over a CoordinationClient             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Mutual exclusion model
//!
//! - A key has **at most one** owner at any time; during a rebalance a key
//!   may transiently have no owner (new members defer to not-yet-caught-up
//!   earlier members)
//! - Claim versions only move forward; identical notification redelivery
//!   is a no-op

pub mod binding;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod membership;
pub mod memory;
pub mod registry;
pub mod ring;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use binding::PartitionLockBinding;
pub use client::{CoordinationClient, CreateMode, SessionEvent};
pub use config::{CoordinatorConfig, PathLayout, SessionConfig};
pub use coordinator::{
    ClaimAdvance, NoopRebalanceObserver, PartitionCoordinator, RebalanceObserver,
};
pub use error::{Error, ProtocolError, RegistryError, Result, RoutingError, SessionError};
pub use lifecycle::{LifecycleOrchestrator, ServerHealth};
pub use membership::{MembershipTable, ServiceRoster};
pub use memory::{MemoryClient, MemoryCluster};
pub use registry::ClusterRegistry;
pub use ring::HashRing;
pub use session::{ConnectionSession, ConnectionState};
pub use types::{ClusterMember, MemberId, ServerDescriptor, StreamKind};
