use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::instance::InstanceService;

pub struct HealthState {
    pub service: Arc<InstanceService>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub orchestrator: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<usize>,
}

pub async fn health_check(State(state): State<Arc<HealthState>>) -> Result<Json<HealthResponse>> {
    let hosts = match state.service.orchestrator_status().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Orchestration API unreachable: {}", e);
            None
        }
    };

    let (status, orchestrator) = match hosts {
        Some(_) => ("healthy", "connected"),
        None => ("degraded", "disconnected"),
    };

    Ok(Json(HealthResponse {
        status,
        orchestrator,
        hosts,
    }))
}
