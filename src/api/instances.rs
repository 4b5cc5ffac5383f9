use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::instance::{
    CreateInstance, InstanceInfo, InstanceService, OrphanContainer, RegisterExternal,
};
use crate::scheduler::{HostOverview, Plan};
use crate::storage::{InstanceFilter, InstanceStats};

pub struct AppState {
    pub service: Arc<InstanceService>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
pub struct DeleteInstanceResponse {
    pub instance_id: String,
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
}

#[derive(Debug, Deserialize)]
pub struct HostsQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstance>,
) -> Result<(StatusCode, Json<InstanceInfo>)> {
    let info = state.service.create(req).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<InstanceFilter>,
) -> Result<Json<Vec<InstanceInfo>>> {
    Ok(Json(state.service.list_instances(&filter)?))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceInfo>> {
    Ok(Json(state.service.get_instance(&instance_id).await?))
}

pub async fn update_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateInstanceRequest>,
) -> Result<Json<InstanceInfo>> {
    let mut info = None;

    if let Some(name) = &req.name {
        info = Some(state.service.update_instance_name(&instance_id, name)?);
    }
    if let Some(plan) = req.plan {
        info = Some(state.service.update_plan(&instance_id, plan)?);
    }

    info.map(Json)
        .ok_or_else(|| AppError::InvalidInput("Nothing to update: provide name or plan".to_string()))
}

pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<DeleteInstanceResponse>> {
    let deleted = state.service.delete_instance(&instance_id).await?;

    Ok(Json(DeleteInstanceResponse {
        instance_id,
        deleted,
    }))
}

pub async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceInfo>> {
    Ok(Json(state.service.restart_instance(&instance_id).await?))
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    let logs = state.service.get_logs(&instance_id, query.tail).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        logs,
    )
        .into_response())
}

pub async fn record_health(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(report): Json<HealthReport>,
) -> Result<Json<InstanceInfo>> {
    Ok(Json(
        state.service.record_health(&instance_id, report.healthy)?,
    ))
}

pub async fn register_external(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterExternal>,
) -> Result<(StatusCode, Json<InstanceInfo>)> {
    let info = state.service.register_external(req)?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn get_user_instances(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<InstanceInfo>>> {
    Ok(Json(state.service.get_instances_by_user(&user_id).await?))
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<InstanceStats>> {
    Ok(Json(state.service.get_stats()?))
}

pub async fn list_hosts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HostsQuery>,
) -> Result<Json<Vec<HostOverview>>> {
    Ok(Json(state.service.list_hosts(query.refresh).await?))
}

pub async fn list_orphans(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrphanContainer>>> {
    Ok(Json(state.service.find_orphaned_containers().await?))
}
