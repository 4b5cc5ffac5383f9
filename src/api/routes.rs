use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::instance::InstanceService;

use super::health::{health_check, HealthState};
use super::instances::{
    create_instance, delete_instance, get_instance, get_logs, get_stats, get_user_instances,
    list_hosts, list_instances, list_orphans, record_health, register_external, restart_instance,
    update_instance, AppState,
};

pub fn create_router(service: Arc<InstanceService>) -> Router {
    let app_state = Arc::new(AppState {
        service: service.clone(),
    });

    let health_state = Arc::new(HealthState { service });

    let instance_routes = Router::new()
        .route("/instances", post(create_instance).get(list_instances))
        .route("/instances/external", post(register_external))
        .route(
            "/instances/{instance_id}",
            get(get_instance)
                .patch(update_instance)
                .delete(delete_instance),
        )
        .route("/instances/{instance_id}/restart", post(restart_instance))
        .route("/instances/{instance_id}/logs", get(get_logs))
        .route("/instances/{instance_id}/health", post(record_health))
        .route("/users/{user_id}/instances", get(get_user_instances))
        .with_state(app_state.clone());

    let operator_routes = Router::new()
        .route("/stats", get(get_stats))
        .route("/hosts", get(list_hosts))
        .route("/orphans", get(list_orphans))
        .with_state(app_state);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .with_state(health_state);

    Router::new()
        .merge(instance_routes)
        .merge(operator_routes)
        .merge(health_routes)
        .layer(TraceLayer::new_for_http())
}
