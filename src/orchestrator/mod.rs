//! Access to the remote container-orchestration API.
//!
//! The scheduler and the lifecycle service only see the [`Orchestrator`]
//! trait; [`PortainerClient`] is the production implementation.

pub mod portainer;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;

pub use portainer::PortainerClient;

/// Label carrying the memory reservation (bytes) of a managed container.
/// Summed per host to derive used memory.
pub const LABEL_MEMORY_BYTES: &str = "tenant.memory_bytes";

/// CFS period used when translating a core count into a CPU quota.
pub const CPU_PERIOD_US: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// A worker node registered with the orchestration layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub endpoint_id: i64,
    pub name: String,
    pub status: HostStatus,
}

impl Host {
    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }
}

/// Live resource figures for a host. Memory values are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostStats {
    pub cpu_cores: i64,
    pub memory_total: i64,
    pub memory_used: i64,
}

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

impl HostStats {
    pub fn available_memory_gb(&self) -> f64 {
        (self.memory_total - self.memory_used) as f64 / BYTES_PER_GB
    }

    pub fn memory_usage_pct(&self) -> f64 {
        if self.memory_total <= 0 {
            return 100.0;
        }
        self.memory_used as f64 / self.memory_total as f64 * 100.0
    }
}

/// Everything needed to create a tenant container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// Container-side TCP port published on an auto-assigned host port
    pub container_port: u16,
    /// `host_path:container_path` bind mounts
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    /// CPU quota in microseconds per [`CPU_PERIOD_US`]
    pub cpu_quota: i64,
}

/// Inspected state of a single container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    /// `"18789/tcp"` -> first published host port
    pub ports: HashMap<String, Option<u16>>,
    pub labels: HashMap<String, String>,
}

impl ContainerDetails {
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .get(&format!("{}/tcp", container_port))
            .copied()
            .flatten()
    }
}

/// One row of a container listing
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerListing {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Drop cached read responses: all of them, or those whose key contains `pattern`.
    /// Returns how many entries were dropped.
    fn invalidate_cache(&self, pattern: Option<&str>) -> usize;

    async fn list_hosts(&self) -> Result<Vec<Host>>;

    /// Hosts that are currently reachable
    async fn list_available_hosts(&self) -> Result<Vec<Host>> {
        let hosts = self.list_hosts().await?;
        Ok(hosts.into_iter().filter(Host::is_up).collect())
    }

    /// `None` means the stats could not be obtained; never schedule there.
    async fn get_host_stats(&self, endpoint_id: i64) -> Option<HostStats>;

    /// Returns the new container id
    async fn create_container(&self, endpoint_id: i64, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, endpoint_id: i64, container_id: &str) -> Result<()>;

    async fn stop_container(&self, endpoint_id: i64, container_id: &str) -> Result<()>;

    async fn restart_container(&self, endpoint_id: i64, container_id: &str) -> Result<()>;

    async fn remove_container(&self, endpoint_id: i64, container_id: &str, force: bool)
        -> Result<()>;

    async fn get_container(&self, endpoint_id: i64, container_id: &str)
        -> Result<ContainerDetails>;

    async fn list_containers(&self, endpoint_id: i64, all: bool) -> Result<Vec<ContainerListing>>;

    async fn get_container_logs(&self, endpoint_id: i64, container_id: &str, tail: u32)
        -> Result<String>;
}
