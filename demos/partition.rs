//! Three coordinated servers dividing a key space.
//!
//! Runs three members of a "presence" service against the in-memory
//! coordination service, shows the key assignment after each join, then
//! crashes one member and shows the reassignment.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example partition

use shardlock::{
    ClusterRegistry, ConnectionSession, ConnectionState, CoordinatorConfig,
    LifecycleOrchestrator, MemoryClient, MemoryCluster, NoopRebalanceObserver,
    PartitionLockBinding, ServerDescriptor, ServerHealth, ServiceRoster,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

struct Server {
    client: Arc<MemoryClient>,
    session: ConnectionSession,
    lifecycle: LifecycleOrchestrator,
    binding: PartitionLockBinding,
    uid: String,
}

async fn start_server(
    cluster: &Arc<MemoryCluster>,
    config: &Arc<CoordinatorConfig>,
    uid: &str,
) -> Result<Server, Box<dyn std::error::Error>> {
    let registry = Arc::new(ClusterRegistry::new());
    registry.register(ServerDescriptor {
        service: config.service_name.clone(),
        uid: uid.to_string(),
    })?;

    let client = cluster.client();
    let session = ConnectionSession::new(client.clone(), config.session.clone());
    let mut state = session.subscribe();
    while *state.borrow_and_update() != ConnectionState::Connected {
        state.changed().await?;
    }

    let roster = Arc::new(ServiceRoster::new());
    let lifecycle =
        LifecycleOrchestrator::start(&session, config.clone(), registry, roster);
    lifecycle.set_health(ServerHealth::Running);

    let binding = PartitionLockBinding::start(
        session.client(),
        &config.paths,
        &config.service_name,
        uid,
        Arc::new(NoopRebalanceObserver),
    )
    .await?;

    Ok(Server {
        client,
        session,
        lifecycle,
        binding,
        uid: uid.to_string(),
    })
}

fn print_assignment(servers: &[Server], keys: &[String]) {
    for server in servers {
        let owned: Vec<&str> = keys
            .iter()
            .filter(|key| server.binding.owns(key))
            .map(|key| key.as_str())
            .collect();
        println!("  {} owns {} keys: {:?}", server.uid, owned.len(), owned);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "shardlock=info".to_string()))
        .init();

    let cluster = MemoryCluster::new();
    let config = Arc::new(CoordinatorConfig::new("presence", "memory"));
    let keys: Vec<String> = (0..12).map(|i| format!("room-{i}")).collect();

    let mut servers = Vec::new();
    for uid in ["presence-a", "presence-b", "presence-c"] {
        servers.push(start_server(&cluster, &config, uid).await?);
        tokio::time::sleep(Duration::from_millis(200)).await;

        println!("\nAfter {uid} joined:");
        print_assignment(&servers, &keys);
    }

    // Crash the middle member without any cleanup; its ephemeral nodes
    // die with the session and the survivors take over its keys.
    let victim = servers.remove(1);
    println!("\nCrashing {} ...", victim.uid);
    cluster.expire_session(&victim.client);
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("After the crash:");
    print_assignment(&servers, &keys);

    for server in servers {
        server.binding.cleanup().await;
        server.lifecycle.shutdown().await;
        server.session.shutdown().await;
    }
    Ok(())
}
