//! Configuration types for the coordination subsystem.

use std::time::Duration;

/// Main configuration for a coordinated server process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Logical service name of this process (e.g. "presence").
    pub service_name: String,

    /// Coordination-service host list, e.g. "10.0.0.1:2181,10.0.0.2:2181".
    pub hosts: String,

    /// Session behaviour.
    pub session: SessionConfig,

    /// Path layout on the coordination service.
    pub paths: PathLayout,

    /// Dependency services whose membership this process routes against.
    pub dependencies: Vec<String>,
}

impl CoordinatorConfig {
    /// Create a configuration for the given service name and hosts.
    pub fn new(service_name: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            hosts: hosts.into(),
            session: SessionConfig::default(),
            paths: PathLayout::default(),
            dependencies: Vec::new(),
        }
    }

    /// Set the session configuration.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the path layout.
    pub fn with_paths(mut self, paths: PathLayout) -> Self {
        self.paths = paths;
        self
    }

    /// Declare a dependency service to watch and route against.
    pub fn with_dependency(mut self, service: impl Into<String>) -> Self {
        self.dependencies.push(service.into());
        self
    }
}

/// Connection-session behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,

    /// How long a single connect attempt may take before it counts as failed.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Set the reconnect interval.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Root paths on the coordination service.
///
/// Per-service parents hang off the configured roots:
/// working `<working_root>/<service>`, alive `<alive_root>/<service>`,
/// hash-lock presence `<lock_root>/<service>/nodes` and claims
/// `<lock_root>/<service>/locks`.
#[derive(Debug, Clone)]
pub struct PathLayout {
    /// Root for working nodes (online and serving).
    pub working_root: String,

    /// Root for alive nodes (started, not necessarily serving).
    pub alive_root: String,

    /// Root for hash-lock presence and claim nodes.
    pub lock_root: String,
}

impl Default for PathLayout {
    fn default() -> Self {
        Self {
            working_root: "/cluster/working".to_string(),
            alive_root: "/cluster/alive".to_string(),
            lock_root: "/cluster/locks".to_string(),
        }
    }
}

impl PathLayout {
    /// Parent path of a service's working nodes.
    pub fn working_parent(&self, service: &str) -> String {
        format!("{}/{}", self.working_root, service)
    }

    /// Full path of one process's working node.
    pub fn working_node(&self, service: &str, uid: &str) -> String {
        format!("{}/{}/{}", self.working_root, service, uid)
    }

    /// Parent path of a service's alive nodes.
    pub fn alive_parent(&self, service: &str) -> String {
        format!("{}/{}", self.alive_root, service)
    }

    /// Full path of one process's alive node.
    pub fn alive_node(&self, service: &str, uid: &str) -> String {
        format!("{}/{}/{}", self.alive_root, service, uid)
    }

    /// Parent path of a service's hash-lock presence nodes.
    pub fn presence_parent(&self, service: &str) -> String {
        format!("{}/{}/nodes", self.lock_root, service)
    }

    /// Parent path of a service's hash-lock claim nodes.
    pub fn claim_parent(&self, service: &str) -> String {
        format!("{}/{}/locks", self.lock_root, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.reconnect_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_config_builder() {
        let cfg = CoordinatorConfig::new("presence", "127.0.0.1:2181")
            .with_dependency("msgid")
            .with_dependency("roster")
            .with_session(SessionConfig::default().with_reconnect_interval(
                Duration::from_secs(1),
            ));

        assert_eq!(cfg.service_name, "presence");
        assert_eq!(cfg.dependencies, vec!["msgid", "roster"]);
        assert_eq!(cfg.session.reconnect_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_path_layout() {
        let paths = PathLayout::default();
        assert_eq!(paths.working_parent("presence"), "/cluster/working/presence");
        assert_eq!(
            paths.presence_parent("presence"),
            "/cluster/locks/presence/nodes"
        );
        assert_eq!(
            paths.claim_parent("presence"),
            "/cluster/locks/presence/locks"
        );
        assert_eq!(
            paths.working_node("presence", "presence-1"),
            "/cluster/working/presence/presence-1"
        );
    }
}
