//! In-memory orchestrator for exercising the scheduler and lifecycle service.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AppError, Result};

use super::{
    ContainerDetails, ContainerListing, ContainerSpec, Host, HostStats, HostStatus, Orchestrator,
};

#[derive(Debug, Default)]
pub struct MockState {
    pub hosts: Vec<Host>,
    pub stats: HashMap<i64, HostStats>,
    /// Every call in order, e.g. `"start:7:c-1"`
    pub calls: Vec<String>,
    pub created: Vec<(i64, ContainerSpec)>,
    pub next_container_id: String,
    pub host_port: Option<u16>,
    pub running: bool,
    pub logs: String,
    /// Returned by `list_containers` for every host
    pub containers: Vec<ContainerListing>,
    pub fail_list_hosts: bool,
    pub fail_start: bool,
    pub fail_inspect: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
}

pub struct MockOrchestrator {
    state: Mutex<MockState>,
}

pub fn host(endpoint_id: i64, name: &str) -> Host {
    Host {
        endpoint_id,
        name: name.to_string(),
        status: HostStatus::Up,
    }
}

pub fn stats_gb(total_gb: f64, used_gb: f64) -> HostStats {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    HostStats {
        cpu_cores: 4,
        memory_total: (total_gb * GIB) as i64,
        memory_used: (used_gb * GIB) as i64,
    }
}

impl MockOrchestrator {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            state: Mutex::new(MockState {
                hosts,
                next_container_id: "c-1".to_string(),
                host_port: Some(40213),
                running: true,
                ..Default::default()
            }),
        }
    }

    pub fn with_stats(self, endpoint_id: i64, stats: HostStats) -> Self {
        self.update(|s| {
            s.stats.insert(endpoint_id, stats);
        });
        self
    }

    pub fn update(&self, f: impl FnOnce(&mut MockState)) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created(&self) -> Vec<(i64, ContainerSpec)> {
        self.state.lock().unwrap().created.clone()
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

fn mock_failure(what: &str) -> AppError {
    AppError::OrchestrationApi {
        status: 500,
        body: format!("mock {} failure", what),
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    fn invalidate_cache(&self, _pattern: Option<&str>) -> usize {
        0
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let state = self.record("list_hosts".to_string());
        if state.fail_list_hosts {
            return Err(mock_failure("list_hosts"));
        }
        Ok(state.hosts.clone())
    }

    async fn get_host_stats(&self, endpoint_id: i64) -> Option<HostStats> {
        let state = self.record(format!("stats:{}", endpoint_id));
        state.stats.get(&endpoint_id).copied()
    }

    async fn create_container(&self, endpoint_id: i64, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.record(format!("create:{}:{}", endpoint_id, spec.name));
        state.created.push((endpoint_id, spec.clone()));
        Ok(state.next_container_id.clone())
    }

    async fn start_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        let state = self.record(format!("start:{}:{}", endpoint_id, container_id));
        if state.fail_start {
            return Err(mock_failure("start"));
        }
        Ok(())
    }

    async fn stop_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        let state = self.record(format!("stop:{}:{}", endpoint_id, container_id));
        if state.fail_stop {
            return Err(mock_failure("stop"));
        }
        Ok(())
    }

    async fn restart_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        self.record(format!("restart:{}:{}", endpoint_id, container_id));
        Ok(())
    }

    async fn remove_container(
        &self,
        endpoint_id: i64,
        container_id: &str,
        force: bool,
    ) -> Result<()> {
        let state = self.record(format!("remove:{}:{}:{}", endpoint_id, container_id, force));
        if state.fail_remove {
            return Err(mock_failure("remove"));
        }
        Ok(())
    }

    async fn get_container(
        &self,
        endpoint_id: i64,
        container_id: &str,
    ) -> Result<ContainerDetails> {
        let state = self.record(format!("inspect:{}:{}", endpoint_id, container_id));
        if state.fail_inspect {
            return Err(mock_failure("inspect"));
        }
        let mut ports = HashMap::new();
        ports.insert("18789/tcp".to_string(), state.host_port);
        Ok(ContainerDetails {
            id: container_id.to_string(),
            running: state.running,
            ports,
            labels: HashMap::new(),
        })
    }

    async fn list_containers(&self, endpoint_id: i64, all: bool) -> Result<Vec<ContainerListing>> {
        let state = self.record(format!("list_containers:{}:{}", endpoint_id, all));
        Ok(state.containers.clone())
    }

    async fn get_container_logs(
        &self,
        endpoint_id: i64,
        container_id: &str,
        tail: u32,
    ) -> Result<String> {
        let state = self.record(format!("logs:{}:{}:{}", endpoint_id, container_id, tail));
        Ok(state.logs.clone())
    }
}
