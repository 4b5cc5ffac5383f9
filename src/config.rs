use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::scheduler::Strategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,

    // Orchestration API
    pub portainer_url: String,
    pub portainer_api_key: String,
    pub http_timeout: Duration,
    pub cache_ttl: Duration,

    // Storage configuration
    pub metadata_db_path: String,
    pub host_cache_stale_after: Duration,

    // Instance provisioning
    pub instance_image: String,
    pub instance_domain: String,
    pub instance_url_scheme: String,
    pub data_root: String,
    pub container_prefix: String,
    pub gateway_bind: String,

    // Scheduling
    pub scheduler_strategy: Strategy,

    // Feature flags
    pub restart_confirm: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env::var("HOST")
                .ok()
                .and_then(|s| IpAddr::from_str(&s).ok())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),

            // Orchestration
            portainer_url: env::var("PORTAINER_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            portainer_api_key: env::var("PORTAINER_API_KEY").unwrap_or_default(),
            http_timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            cache_ttl: Duration::from_secs(
                env::var("CACHE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),

            // Storage
            metadata_db_path: env::var("METADATA_DB_PATH")
                .unwrap_or_else(|_| "/data/instances.db".to_string()),
            host_cache_stale_after: Duration::from_secs(
                env::var("HOST_CACHE_STALE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),

            // Instances
            instance_image: env::var("INSTANCE_IMAGE")
                .unwrap_or_else(|_| "ghcr.io/tenant/gateway:latest".to_string()),
            instance_domain: env::var("INSTANCE_DOMAIN")
                .unwrap_or_else(|_| "instances.localhost".to_string()),
            instance_url_scheme: env::var("INSTANCE_URL_SCHEME")
                .unwrap_or_else(|_| "https".to_string()),
            data_root: env::var("DATA_ROOT").unwrap_or_else(|_| "/srv/tenants".to_string()),
            container_prefix: env::var("CONTAINER_PREFIX")
                .unwrap_or_else(|_| "tenant".to_string()),
            gateway_bind: env::var("GATEWAY_BIND").unwrap_or_else(|_| "lan".to_string()),

            // Scheduling
            scheduler_strategy: env::var("SCHEDULER_STRATEGY")
                .map(|s| parse_strategy(&s))
                .unwrap_or_default(),

            // Features
            restart_confirm: env::var("RESTART_CONFIRM")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Public URL for an instance, built from its name-derived id
    pub fn instance_url(&self, instance_id: &str) -> String {
        format!(
            "{}://{}.{}",
            self.instance_url_scheme, instance_id, self.instance_domain
        )
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Unknown names are logged and fall back to the default strategy
fn parse_strategy(raw: &str) -> Strategy {
    match raw.trim().parse() {
        Ok(strategy) => strategy,
        Err(e) => {
            let fallback = Strategy::default();
            warn!("{}; falling back to {:?}", e, fallback);
            fallback
        }
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            portainer_url: "http://portainer.test".to_string(),
            portainer_api_key: "test-key".to_string(),
            http_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
            metadata_db_path: ":memory:".to_string(),
            host_cache_stale_after: Duration::from_secs(300),
            instance_image: "gateway:test".to_string(),
            instance_domain: "example.test".to_string(),
            instance_url_scheme: "https".to_string(),
            data_root: "/srv/tenants".to_string(),
            container_prefix: "tenant".to_string(),
            gateway_bind: "lan".to_string(),
            scheduler_strategy: Strategy::RoundRobin,
            restart_confirm: false,
        }
    }
}
