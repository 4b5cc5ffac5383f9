use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::orchestrator::{ContainerSpec, Orchestrator, LABEL_MEMORY_BYTES};
use crate::scheduler::{HostOverview, HostScheduler, Plan, SelectOptions};
use crate::storage::{InstanceFilter, InstanceStats, InstanceStore, InstanceUpdate};

use super::model::{
    instance_id_from_name, ContainerBinding, ExternalEndpoint, Instance, InstanceInfo,
    InstanceKind, InstanceSource, InstanceStatus,
};

/// Port the gateway listens on inside every tenant container
pub const GATEWAY_PORT: u16 = 18789;

const DEFAULT_LOG_TAIL: u32 = 100;
const NAME_SUFFIX_LEN: usize = 6;
const GATEWAY_TOKEN_BYTES: usize = 32;
const HOST_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const LABEL_INSTANCE_ID: &str = "tenant.instance_id";
const LABEL_INSTANCE_NAME: &str = "tenant.instance_name";
const LABEL_USER_ID: &str = "tenant.user_id";
const LABEL_PLAN: &str = "tenant.plan";
const LABEL_MANAGED: &str = "tenant.managed";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstance {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub prefer_same_host: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterExternal {
    pub user_id: String,
    pub name: String,
    pub source: InstanceSource,
    pub custom_url: String,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub health_check_interval: Option<u32>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub email: Option<String>,
}

/// A managed-looking container with no instance record
#[derive(Debug, Clone, Serialize)]
pub struct OrphanContainer {
    pub endpoint_id: i64,
    pub container_id: String,
    pub name: Option<String>,
    pub state: String,
}

pub struct InstanceService {
    orchestrator: Arc<dyn Orchestrator>,
    scheduler: Arc<HostScheduler>,
    store: Arc<InstanceStore>,
    config: Config,
}

impl InstanceService {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        scheduler: Arc<HostScheduler>,
        store: Arc<InstanceStore>,
        config: Config,
    ) -> Self {
        Self {
            orchestrator,
            scheduler,
            store,
            config,
        }
    }

    /// Place, create and start a container for a new instance, then record it.
    ///
    /// Once the container exists any failure force-removes it before the
    /// original error is returned.
    pub async fn create(&self, request: CreateInstance) -> Result<InstanceInfo> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::InvalidInput("user_id is required".to_string()));
        }

        let name = match request.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-{}", user_id, random_suffix()),
        };
        let instance_id = instance_id_from_name(&name);
        if instance_id.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Instance name '{}' has no letters or digits",
                name
            )));
        }
        if self.store.get(&instance_id)?.is_some() {
            return Err(AppError::Conflict(format!(
                "Instance {} already exists",
                instance_id
            )));
        }

        let plan = request.plan.unwrap_or_default();
        let selection = self
            .scheduler
            .select(SelectOptions {
                user_id,
                plan,
                prefer_same_host: request.prefer_same_host,
            })
            .await?
            .ok_or(AppError::NoAvailableHost)?;
        let endpoint_id = selection.endpoint_id;

        let check = self.scheduler.validate_resources(endpoint_id, plan).await;
        if !check.valid {
            let reason = check
                .reason
                .unwrap_or_else(|| "Insufficient resources".to_string());
            warn!("Rejecting instance {} on host {}: {}", instance_id, endpoint_id, reason);
            return Err(AppError::InsufficientResources(reason));
        }

        let gateway_token = generate_gateway_token();
        let container_name = format!("{}-{}", self.config.container_prefix, instance_id);
        let spec = self.container_spec(
            &instance_id,
            &name,
            user_id,
            plan,
            &container_name,
            &gateway_token,
        );

        info!(
            "Creating instance {} for user {} on host {} ({}, plan {}, score {:.1})",
            instance_id, user_id, endpoint_id, selection.host.name, plan, selection.score
        );

        let container_id = self.orchestrator.create_container(endpoint_id, &spec).await?;

        let binding = ContainerBinding {
            container_id: container_id.clone(),
            container_name,
            endpoint_id,
            port: None,
            gateway_token,
        };
        let draft = Instance {
            instance_id: instance_id.clone(),
            user_id: user_id.to_string(),
            name,
            owner_email: request.email,
            plan,
            url: self.config.instance_url(&instance_id),
            status: InstanceStatus::Creating,
            kind: InstanceKind::Managed(binding),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        match self.start_and_record(draft).await {
            Ok(instance) => {
                info!(
                    "Instance {} is {} on host {}",
                    instance_id,
                    instance.status.as_str(),
                    endpoint_id
                );
                Ok(InstanceInfo::created(&instance))
            }
            Err(e) => {
                error!("Instance {} failed after container creation: {}", instance_id, e);
                if let Err(cleanup) = self
                    .orchestrator
                    .remove_container(endpoint_id, &container_id, true)
                    .await
                {
                    warn!(
                        "Failed to remove container {} of instance {}: {}",
                        container_id, instance_id, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn start_and_record(&self, mut instance: Instance) -> Result<Instance> {
        let InstanceKind::Managed(binding) = &mut instance.kind else {
            return Err(AppError::Internal("expected a managed instance".to_string()));
        };

        self.orchestrator
            .start_container(binding.endpoint_id, &binding.container_id)
            .await?;

        let details = self
            .orchestrator
            .get_container(binding.endpoint_id, &binding.container_id)
            .await?;

        binding.port = details.host_port(GATEWAY_PORT);
        if binding.port.is_none() {
            warn!(
                "Container {} has no published port for {}/tcp",
                binding.container_id, GATEWAY_PORT
            );
        }
        instance.status = InstanceStatus::from_running(details.running);

        self.store.insert(&instance)?;
        Ok(instance)
    }

    fn container_spec(
        &self,
        instance_id: &str,
        name: &str,
        user_id: &str,
        plan: Plan,
        container_name: &str,
        gateway_token: &str,
    ) -> ContainerSpec {
        let quota = plan.quota();

        let env = vec![
            ("GATEWAY_TOKEN".to_string(), gateway_token.to_string()),
            ("GATEWAY_BIND".to_string(), self.config.gateway_bind.clone()),
            ("GATEWAY_PORT".to_string(), GATEWAY_PORT.to_string()),
            ("INSTANCE_ID".to_string(), instance_id.to_string()),
            ("INSTANCE_NAME".to_string(), name.to_string()),
            ("USER_ID".to_string(), user_id.to_string()),
        ];

        let labels = HashMap::from([
            (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
            (LABEL_INSTANCE_NAME.to_string(), name.to_string()),
            (LABEL_USER_ID.to_string(), user_id.to_string()),
            (LABEL_PLAN.to_string(), plan.as_str().to_string()),
            (LABEL_MEMORY_BYTES.to_string(), quota.memory_bytes().to_string()),
            (LABEL_MANAGED.to_string(), "true".to_string()),
        ]);

        ContainerSpec {
            name: container_name.to_string(),
            image: self.config.instance_image.clone(),
            env,
            labels,
            container_port: GATEWAY_PORT,
            binds: vec![format!(
                "{}/{}:/data",
                self.config.data_root.trim_end_matches('/'),
                instance_id
            )],
            memory_bytes: quota.memory_bytes(),
            cpu_quota: quota.cpu_quota(),
        }
    }

    fn require(&self, instance_id: &str) -> Result<Instance> {
        self.store
            .get(instance_id)?
            .ok_or_else(|| AppError::NotFound(instance_id.to_string()))
    }

    /// Get an instance, with its status refreshed from the live container
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        let instance = self.require(instance_id)?;
        let instance = self.reconcile(instance).await;
        Ok(InstanceInfo::from(&instance))
    }

    pub async fn get_instances_by_user(&self, user_id: &str) -> Result<Vec<InstanceInfo>> {
        let instances = self.store.list_by_user(user_id)?;
        let reconciled = join_all(instances.into_iter().map(|i| self.reconcile(i))).await;
        Ok(reconciled.iter().map(InstanceInfo::from).collect())
    }

    /// Stored view only; no container lookups
    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceInfo>> {
        let instances = self.store.list(filter)?;
        Ok(instances.iter().map(InstanceInfo::from).collect())
    }

    /// Write the observed running state back when it differs from the record.
    /// Orchestration failures keep the stored status.
    async fn reconcile(&self, mut instance: Instance) -> Instance {
        let Some(binding) = instance.container() else {
            return instance;
        };

        let details = match self
            .orchestrator
            .get_container(binding.endpoint_id, &binding.container_id)
            .await
        {
            Ok(details) => details,
            Err(e) => {
                warn!(
                    "Could not inspect container of instance {}: {}",
                    instance.instance_id, e
                );
                return instance;
            }
        };

        let observed = InstanceStatus::from_running(details.running);
        if observed == instance.status {
            return instance;
        }

        debug!(
            "Instance {} is {} but recorded as {}",
            instance.instance_id,
            observed.as_str(),
            instance.status.as_str()
        );
        match self
            .store
            .update(&instance.instance_id, &InstanceUpdate::status(observed))
        {
            Ok(_) => instance.status = observed,
            Err(e) => warn!("Failed to record status of {}: {}", instance.instance_id, e),
        }
        instance
    }

    /// Stop and remove the container, then drop the record.
    /// A failed stop or remove leaves the record in place.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<bool> {
        let instance = self.require(instance_id)?;

        if let Some(binding) = instance.container() {
            info!(
                "Destroying instance {} (container {} on host {})",
                instance_id, binding.container_id, binding.endpoint_id
            );

            self.orchestrator
                .stop_container(binding.endpoint_id, &binding.container_id)
                .await
                .inspect_err(|e| error!("Failed to stop instance {}: {}", instance_id, e))?;

            self.orchestrator
                .remove_container(binding.endpoint_id, &binding.container_id, true)
                .await
                .inspect_err(|e| error!("Failed to remove instance {}: {}", instance_id, e))?;
        }

        self.store.delete(instance_id)
    }

    pub async fn restart_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        let instance = self.require(instance_id)?;
        let binding = managed(&instance, "restarted")?;

        self.orchestrator
            .restart_container(binding.endpoint_id, &binding.container_id)
            .await
            .inspect_err(|e| error!("Failed to restart instance {}: {}", instance_id, e))?;

        let status = if self.config.restart_confirm {
            match self
                .orchestrator
                .get_container(binding.endpoint_id, &binding.container_id)
                .await
            {
                Ok(details) => InstanceStatus::from_running(details.running),
                Err(e) => {
                    warn!("Could not confirm restart of {}: {}", instance_id, e);
                    InstanceStatus::Running
                }
            }
        } else {
            InstanceStatus::Running
        };

        self.store
            .update(instance_id, &InstanceUpdate::status(status))?;
        info!("Restarted instance {} ({})", instance_id, status.as_str());

        let instance = self.require(instance_id)?;
        Ok(InstanceInfo::from(&instance))
    }

    /// Rename the instance. Its id, URL and container keep their names.
    pub fn update_instance_name(&self, instance_id: &str, name: &str) -> Result<InstanceInfo> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("Name must not be empty".to_string()));
        }

        self.apply(
            instance_id,
            &InstanceUpdate {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
    }

    /// Record a new plan. The running container keeps its original limits.
    pub fn update_plan(&self, instance_id: &str, plan: Plan) -> Result<InstanceInfo> {
        self.apply(
            instance_id,
            &InstanceUpdate {
                plan: Some(plan),
                ..Default::default()
            },
        )
    }

    fn apply(&self, instance_id: &str, update: &InstanceUpdate) -> Result<InstanceInfo> {
        if !self.store.update(instance_id, update)? {
            return Err(AppError::NotFound(instance_id.to_string()));
        }
        let instance = self.require(instance_id)?;
        Ok(InstanceInfo::from(&instance))
    }

    pub async fn get_logs(&self, instance_id: &str, tail: Option<u32>) -> Result<String> {
        let instance = self.require(instance_id)?;
        let binding = managed(&instance, "read for logs")?;

        self.orchestrator
            .get_container_logs(
                binding.endpoint_id,
                &binding.container_id,
                tail.unwrap_or(DEFAULT_LOG_TAIL),
            )
            .await
    }

    pub fn get_stats(&self) -> Result<InstanceStats> {
        self.store.stats()
    }

    /// Track an instance running outside the managed hosts
    pub fn register_external(&self, request: RegisterExternal) -> Result<InstanceInfo> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::InvalidInput("user_id is required".to_string()));
        }
        let custom_url = request.custom_url.trim();
        if !(custom_url.starts_with("http://") || custom_url.starts_with("https://")) {
            return Err(AppError::InvalidInput(format!(
                "custom_url must be an http(s) URL: {}",
                custom_url
            )));
        }
        let instance_id = instance_id_from_name(&request.name);
        if instance_id.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Instance name '{}' has no letters or digits",
                request.name
            )));
        }

        let endpoint = ExternalEndpoint {
            custom_url: custom_url.to_string(),
            health_check_url: request.health_check_url,
            health_check_interval: request.health_check_interval,
            is_healthy: None,
            last_health_check: None,
        };
        let kind = match request.source {
            InstanceSource::Custom => InstanceKind::Custom(endpoint),
            InstanceSource::Hardware => InstanceKind::Hardware(endpoint),
            InstanceSource::Managed => {
                return Err(AppError::InvalidInput(
                    "Managed instances are created through POST /instances".to_string(),
                ))
            }
        };

        let now = Utc::now();
        let instance = Instance {
            instance_id: instance_id.clone(),
            user_id: user_id.to_string(),
            name: request.name.trim().to_string(),
            owner_email: request.email,
            plan: request.plan.unwrap_or_default(),
            url: custom_url.to_string(),
            status: InstanceStatus::Running,
            kind,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&instance)?;
        info!(
            "Registered {} instance {} at {}",
            instance.source().as_str(),
            instance_id,
            custom_url
        );

        Ok(InstanceInfo::from(&instance))
    }

    /// Store a health probe result for an external instance
    pub fn record_health(&self, instance_id: &str, healthy: bool) -> Result<InstanceInfo> {
        let instance = self.require(instance_id)?;
        if instance.external().is_none() {
            return Err(AppError::Precondition(format!(
                "Instance {} is managed; its health follows the container",
                instance_id
            )));
        }

        self.store
            .record_health_check(instance_id, healthy, Utc::now())?;
        if !healthy {
            warn!("External instance {} reported unhealthy", instance_id);
        }

        let instance = self.require(instance_id)?;
        Ok(InstanceInfo::from(&instance))
    }

    pub async fn list_hosts(&self, refresh: bool) -> Result<Vec<HostOverview>> {
        if refresh {
            self.scheduler.forget_stats();
        }
        self.scheduler.host_overview().await
    }

    /// Whether the orchestration API answers, with the number of hosts it reports
    pub async fn orchestrator_status(&self) -> Result<usize> {
        Ok(self.orchestrator.list_hosts().await?.len())
    }

    /// Containers labelled as managed that have no instance record
    pub async fn find_orphaned_containers(&self) -> Result<Vec<OrphanContainer>> {
        let hosts = self.orchestrator.list_available_hosts().await?;
        let mut orphans = Vec::new();

        for host in hosts {
            let containers = match self.orchestrator.list_containers(host.endpoint_id, true).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!("Failed to list containers on host {}: {}", host.endpoint_id, e);
                    continue;
                }
            };

            for container in containers {
                let managed = container
                    .labels
                    .get(LABEL_MANAGED)
                    .is_some_and(|v| v == "true");
                if !managed || self.store.get_by_container_id(&container.id)?.is_some() {
                    continue;
                }
                orphans.push(OrphanContainer {
                    endpoint_id: host.endpoint_id,
                    name: container
                        .names
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string()),
                    container_id: container.id,
                    state: container.state,
                });
            }
        }

        Ok(orphans)
    }

    pub fn start_host_cache_cleanup_task(self: Arc<Self>) {
        let service = self.clone();
        let max_age = self.config.host_cache_stale_after;

        tokio::spawn(async move {
            let mut ticker = interval(HOST_CACHE_SWEEP_INTERVAL);

            loop {
                ticker.tick().await;
                match service.store.cleanup_stale_hosts(max_age) {
                    Ok(0) => {}
                    Ok(removed) => debug!("Dropped {} stale host cache row(s)", removed),
                    Err(e) => warn!("Failed to clean host cache: {}", e),
                }
            }
        });
    }
}

fn managed<'a>(instance: &'a Instance, action: &str) -> Result<&'a ContainerBinding> {
    instance.container().ok_or_else(|| {
        AppError::Precondition(format!(
            "Instance {} is {} and cannot be {}",
            instance.instance_id,
            instance.source().as_str(),
            action
        ))
    })
}

fn random_suffix() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..NAME_SUFFIX_LEN)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

fn generate_gateway_token() -> String {
    let mut bytes = [0u8; GATEWAY_TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}
