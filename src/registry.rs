//! Process-wide cluster registry.
//!
//! A single registration point holding "which server am I". Created once
//! at startup and passed by reference to the components that need it,
//! never accessed as ambient global state.

use crate::error::{RegistryError, Result};
use crate::types::ServerDescriptor;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Holder of the local server descriptor.
///
/// `register` is called exactly once at process start; `clear` only at
/// shutdown.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    current: RwLock<Option<Arc<ServerDescriptor>>>,
}

impl ClusterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local server. Errors if a server is already registered.
    pub fn register(&self, descriptor: ServerDescriptor) -> Result<()> {
        let mut current = self.current.write();
        if current.is_some() {
            return Err(RegistryError::AlreadyRegistered.into());
        }

        info!(service = %descriptor.service, uid = %descriptor.uid, "server registered");
        *current = Some(Arc::new(descriptor));
        Ok(())
    }

    /// The registered local server. Errors before registration.
    pub fn current(&self) -> Result<Arc<ServerDescriptor>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| RegistryError::NotRegistered.into())
    }

    /// Whether a server has been registered.
    pub fn is_registered(&self) -> bool {
        self.current.read().is_some()
    }

    /// Clear the registration. Shutdown path only.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_register_once() {
        let registry = ClusterRegistry::new();
        assert!(!registry.is_registered());

        registry
            .register(ServerDescriptor::new("presence", "presence-1"))
            .unwrap();
        assert_eq!(registry.current().unwrap().uid, "presence-1");

        // Second registration is refused.
        let err = registry
            .register(ServerDescriptor::new("presence", "presence-2"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_current_before_register_errors() {
        let registry = ClusterRegistry::new();
        assert!(matches!(
            registry.current(),
            Err(Error::Registry(RegistryError::NotRegistered))
        ));
    }

    #[test]
    fn test_clear_allows_reregistration() {
        let registry = ClusterRegistry::new();
        registry
            .register(ServerDescriptor::new("presence", "presence-1"))
            .unwrap();
        registry.clear();
        assert!(registry
            .register(ServerDescriptor::new("presence", "presence-1"))
            .is_ok());
    }
}
