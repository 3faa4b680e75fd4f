//! jvm-discovery: JVM discovery and reconciliation service
//!
//! Runs every enabled discovery backend against one shared discovery tree,
//! accepts plugin registrations and custom targets, and serves the tree over
//! REST.
//!
//! ## Architecture
//! ```text
//! [JDP] [Podman] [Docker] [Kubernetes]      [Plugins] [Custom targets]
//!    \      |       |        /                    \        /
//!     [DiscoveryDriver] -> [ScopeQueue] <- [PluginRegistry / CustomTargets]
//!                              |
//!                              v
//!                     [reconcile] -> [TopologyStore]
//!                              |
//!                              v
//!                         [EventBus] -> [LoggingEventHandler]
//! ```
//!
//! ## Configuration
//! - `--config <path>` or DISCOVERY_CONFIG: YAML config file
//! - DISCOVERY__SECTION__KEY: overrides, e.g. DISCOVERY__SERVER__PORT=9000
//! - DISCOVERY_LOG: log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jvm_discovery::bus::{EventBus, LoggingEventHandler, ScopeQueue};
use jvm_discovery::config::Config;
use jvm_discovery::connection::NoopJvmIdResolver;
use jvm_discovery::discovery::container::{ContainerBackend, ContainerRuntime};
use jvm_discovery::discovery::custom::CustomTargets;
use jvm_discovery::discovery::jdp::JdpBackend;
use jvm_discovery::discovery::{DiscoveryBackend, DiscoveryDriver};
use jvm_discovery::handlers::rest::{self, AppState};
use jvm_discovery::model::realms;
use jvm_discovery::plugins::{CallbackClient, PluginRegistry, TokenService};
use jvm_discovery::storage::init_store;
use jvm_discovery::topology::Topology;
use jvm_discovery::utils::bootstrap::{config_path_from_args, init_tracing, shutdown_signal};
use jvm_discovery::utils::retry::store_backoff;

fn backends(config: &Config) -> Vec<Arc<dyn DiscoveryBackend>> {
    let discovery = &config.discovery;
    #[allow(unused_mut)]
    let mut backends: Vec<Arc<dyn DiscoveryBackend>> = vec![
        Arc::new(JdpBackend::new(discovery.jdp.clone())),
        Arc::new(ContainerBackend::new(
            ContainerRuntime::Podman,
            discovery.podman.clone(),
        )),
        Arc::new(ContainerBackend::new(
            ContainerRuntime::Docker,
            discovery.docker.clone(),
        )),
    ];
    #[cfg(feature = "k8s")]
    backends.push(Arc::new(
        jvm_discovery::discovery::k8s::KubeBackend::new(discovery.kubernetes.clone()),
    ));
    backends
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = config_path_from_args(std::env::args().skip(1));
    let config = Config::load(config_path.as_deref().and_then(|p| p.to_str()))?;
    info!(
        port = config.server.port,
        storage = %config.storage.storage_type,
        "starting jvm-discovery"
    );

    let store = (|| async { init_store(&config.storage).await.map_err(|e| e.to_string()) })
        .retry(store_backoff())
        .notify(|e: &String, after: Duration| {
            warn!(error = %e, retry_in = ?after, "topology store not ready");
        })
        .await
        .map_err(|e| format!("failed to open topology store: {}", e))?;

    let bus = EventBus::new();
    let topology = Topology::new(store, bus.clone()).with_resolver(
        Arc::new(NoopJvmIdResolver),
        Duration::from_secs(config.connection.jvm_id_timeout_secs),
    );
    topology.init().await?;
    let _notifications = bus.subscribe(None, Box::new(LoggingEventHandler));

    let cancel = CancellationToken::new();
    let queue = ScopeQueue::new();

    let tokens = Arc::new(TokenService::from_config(&config.server, &config.plugins)?);
    let plugins = PluginRegistry::new(
        topology.clone(),
        queue.clone(),
        tokens,
        CallbackClient::new(config.plugins.callback_timeout())?,
        config.plugins.ping_period(),
    );
    let custom = CustomTargets::new(topology.clone(), queue.clone(), &config.discovery.custom);

    let backends = backends(&config);
    let mut builtin_realms: Vec<&str> = backends
        .iter()
        .filter(|b| b.enabled())
        .map(|b| b.realm())
        .collect();
    if config.discovery.custom.enabled {
        builtin_realms.push(realms::CUSTOM);
    }
    for realm in builtin_realms {
        plugins.ensure_builtin(realm).await?;
    }

    match plugins.prune_unreachable().await {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "pruned plugins unreachable since last run"),
        Err(e) => warn!(error = %e, "startup plugin prune failed"),
    }
    let mut tasks = vec![plugins.spawn_reverification(cancel.child_token())];

    let driver = DiscoveryDriver::new(topology.clone(), queue.clone(), cancel.child_token());
    for backend in backends {
        if let Some(handle) = driver.spawn(backend).await {
            tasks.push(handle);
        }
    }

    let state = AppState {
        topology,
        plugins,
        custom,
    };
    let server_cancel = cancel.child_token();
    let host = config.server.host.clone();
    let port = config.server.port;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = rest::serve(state, &host, port, server_cancel).await {
            error!(error = %e, "REST server failed");
        }
    }));

    shutdown_signal().await;
    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    info!("jvm-discovery stopped");
    Ok(())
}
