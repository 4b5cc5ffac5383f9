use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{Plan, Quota};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn from_running(running: bool) -> Self {
        if running {
            Self::Running
        } else {
            Self::Stopped
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    Managed,
    Custom,
    Hardware,
}

impl InstanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Custom => "custom",
            Self::Hardware => "hardware",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "managed" => Some(Self::Managed),
            "custom" => Some(Self::Custom),
            "hardware" => Some(Self::Hardware),
            _ => None,
        }
    }
}

/// Where a managed instance's container lives
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerBinding {
    pub container_id: String,
    pub container_name: String,
    pub endpoint_id: i64,
    pub port: Option<u16>,
    pub gateway_token: String,
}

/// An externally registered endpoint, tracked for health only
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEndpoint {
    pub custom_url: String,
    pub health_check_url: Option<String>,
    /// Seconds between health checks
    pub health_check_interval: Option<u32>,
    /// `None` until the first check has run
    pub is_healthy: Option<bool>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceKind {
    Managed(ContainerBinding),
    Custom(ExternalEndpoint),
    Hardware(ExternalEndpoint),
}

impl InstanceKind {
    pub fn source(&self) -> InstanceSource {
        match self {
            Self::Managed(_) => InstanceSource::Managed,
            Self::Custom(_) => InstanceSource::Custom,
            Self::Hardware(_) => InstanceSource::Hardware,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_id: String,
    pub user_id: String,
    pub name: String,
    pub owner_email: Option<String>,
    pub plan: Plan,
    pub url: String,
    pub status: InstanceStatus,
    pub kind: InstanceKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn source(&self) -> InstanceSource {
        self.kind.source()
    }

    pub fn container(&self) -> Option<&ContainerBinding> {
        match &self.kind {
            InstanceKind::Managed(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn external(&self) -> Option<&ExternalEndpoint> {
        match &self.kind {
            InstanceKind::Custom(endpoint) | InstanceKind::Hardware(endpoint) => Some(endpoint),
            InstanceKind::Managed(_) => None,
        }
    }
}

/// Instance view returned across the API boundary.
///
/// `gateway_token` is only filled in by [`InstanceInfo::created`]; every other
/// read leaves it out.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub user_id: String,
    pub name: String,
    pub plan: Plan,
    pub quota: Quota,
    pub source: InstanceSource,
    pub status: InstanceStatus,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceInfo {
    /// View handed back once to the creator, carrying the gateway credential
    pub fn created(instance: &Instance) -> Self {
        Self {
            gateway_token: instance.container().map(|c| c.gateway_token.clone()),
            ..Self::from(instance)
        }
    }
}

impl From<&Instance> for InstanceInfo {
    fn from(instance: &Instance) -> Self {
        let container = instance.container();
        let external = instance.external();

        Self {
            instance_id: instance.instance_id.clone(),
            user_id: instance.user_id.clone(),
            name: instance.name.clone(),
            plan: instance.plan,
            quota: instance.plan.quota(),
            source: instance.source(),
            status: instance.status,
            url: instance.url.clone(),
            endpoint_id: container.map(|c| c.endpoint_id),
            container_name: container.map(|c| c.container_name.clone()),
            port: container.and_then(|c| c.port),
            gateway_token: None,
            custom_url: external.map(|e| e.custom_url.clone()),
            health_check_url: external.and_then(|e| e.health_check_url.clone()),
            is_healthy: external.and_then(|e| e.is_healthy),
            last_health_check: external.and_then(|e| e.last_health_check),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Stable instance id derived from a display name: lower case, runs of
/// anything other than ASCII alphanumerics collapsed to a single `-`.
pub fn instance_id_from_name(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.is_empty() && !id.ends_with('-') {
            id.push('-');
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    id
}
