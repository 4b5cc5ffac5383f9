mod api;
mod cache;
mod config;
mod error;
mod instance;
mod orchestrator;
mod scheduler;
mod storage;

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::create_router;
use crate::config::Config;
use crate::instance::InstanceService;
use crate::orchestrator::{Orchestrator, PortainerClient};
use crate::scheduler::HostScheduler;
use crate::storage::InstanceStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_scheduler=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: orchestrator {}, store {}, image {}",
        config.portainer_url, config.metadata_db_path, config.instance_image
    );
    if config.portainer_api_key.is_empty() {
        warn!("PORTAINER_API_KEY is not set; orchestration calls will be rejected");
    }

    // Orchestration client
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(PortainerClient::new(&config)?);
    match orchestrator.list_hosts().await {
        Ok(hosts) => {
            let up = hosts.iter().filter(|h| h.is_up()).count();
            info!("Orchestration API reachable: {} host(s), {} up", hosts.len(), up);
        }
        Err(e) => warn!("Orchestration API not reachable yet: {}", e),
    }

    // Instance store (SQLite)
    let store = Arc::new(InstanceStore::new(&config.metadata_db_path)?);
    info!("Instance store initialized at {}", config.metadata_db_path);

    let scheduler = Arc::new(
        HostScheduler::new(orchestrator.clone(), store.clone(), config.cache_ttl)
            .with_strategy(config.scheduler_strategy),
    );
    info!("Scheduling strategy: {:?}", config.scheduler_strategy);

    let service = Arc::new(InstanceService::new(
        orchestrator,
        scheduler,
        store,
        config.clone(),
    ));

    // Report managed containers that lost their records
    match service.find_orphaned_containers().await {
        Ok(orphans) if !orphans.is_empty() => {
            for orphan in &orphans {
                warn!(
                    "Orphaned container {} ({}) on host {}",
                    orphan.container_id,
                    orphan.name.as_deref().unwrap_or("unnamed"),
                    orphan.endpoint_id
                );
            }
        }
        Ok(_) => info!("No orphaned containers found"),
        Err(e) => warn!("Failed to scan for orphaned containers: {}", e),
    }

    service.clone().start_host_cache_cleanup_task();
    info!("Started host cache cleanup task");

    let app = create_router(service);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
