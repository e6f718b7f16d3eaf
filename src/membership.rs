//! Peer membership tables for dependency services.
//!
//! Each watched remote service has one [`MembershipTable`] fed by full
//! child-list snapshots from the coordination service; routing queries
//! resolve a key to the peer uid that owns it. [`ServiceRoster`] holds the
//! tables for all declared dependencies and tracks which watches have been
//! armed so duplicate installation is a keyed no-op.

use crate::error::{Result, RoutingError};
use crate::ring::HashRing;
use crate::types::MemberId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{error, info};

/// Routing table for one dependency service.
#[derive(Debug)]
pub struct MembershipTable {
    /// Service this table routes for.
    service: String,

    /// Current peer uids.
    members: BTreeSet<MemberId>,

    /// Ring derived from `members`, rebuilt on every change.
    ring: HashRing,
}

impl MembershipTable {
    /// Create an empty table for a service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            members: BTreeSet::new(),
            ring: HashRing::new(),
        }
    }

    /// The service this table routes for.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current peer uids.
    pub fn members(&self) -> impl Iterator<Item = &MemberId> {
        self.members.iter()
    }

    /// Number of known peers.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Replace the entire member set with a fresh snapshot and rebuild
    /// the ring. An empty snapshot means serving against this dependency
    /// is impossible; the table stays valid and queryable (empty).
    pub fn set_all<S: AsRef<str>>(&mut self, nodes: &[S]) {
        if nodes.is_empty() {
            error!(service = %self.service, "all service nodes down");
        }

        self.members = nodes.iter().map(|n| n.as_ref().to_string()).collect();
        self.rebuild();
        info!(
            service = %self.service,
            count = self.members.len(),
            "service membership replaced"
        );
    }

    /// Add one or more peers.
    pub fn add_nodes<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            self.members.insert(node.as_ref().to_string());
        }
        self.rebuild();
    }

    /// Remove one or more peers.
    pub fn remove_nodes<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            self.members.remove(node.as_ref());
        }
        self.rebuild();
    }

    /// Peer uid that owns the given key.
    pub fn route(&self, key: &str) -> Result<MemberId> {
        self.ring
            .owner(key)
            .map(|uid| uid.to_string())
            .ok_or_else(|| {
                RoutingError::NoMembers {
                    service: self.service.clone(),
                }
                .into()
            })
    }

    fn rebuild(&mut self) {
        self.ring = HashRing::from_members(self.members.iter());
    }
}

/// All dependency-service tables of one process.
#[derive(Debug, Default)]
pub struct ServiceRoster {
    tables: RwLock<HashMap<String, MembershipTable>>,
    armed: RwLock<HashSet<String>>,
}

impl ServiceRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the table for a service if it does not exist yet.
    pub fn ensure(&self, service: &str) {
        self.tables
            .write()
            .entry(service.to_string())
            .or_insert_with(|| MembershipTable::new(service));
    }

    /// Replace a service's member set from a watch snapshot.
    pub fn set_all<S: AsRef<str>>(&self, service: &str, nodes: &[S]) {
        let mut tables = self.tables.write();
        tables
            .entry(service.to_string())
            .or_insert_with(|| MembershipTable::new(service))
            .set_all(nodes);
    }

    /// Route a key to the owning peer of a dependency service.
    pub fn route(&self, service: &str, key: &str) -> Result<MemberId> {
        let tables = self.tables.read();
        let table = tables
            .get(service)
            .ok_or_else(|| RoutingError::UnknownService(service.to_string()))?;
        table.route(key)
    }

    /// Number of known peers for a service.
    pub fn member_count(&self, service: &str) -> usize {
        self.tables
            .read()
            .get(service)
            .map(|t| t.member_count())
            .unwrap_or(0)
    }

    /// Mark a service's watch as armed. Returns false if it already was;
    /// callers use that to make duplicate installation a no-op.
    pub fn mark_armed(&self, service: &str) -> bool {
        self.armed.write().insert(service.to_string())
    }

    /// Whether a service's watch is armed.
    pub fn is_armed(&self, service: &str) -> bool {
        self.armed.read().contains(service)
    }
}
