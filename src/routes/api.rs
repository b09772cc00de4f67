use crate::{handlers::collaborators, handlers::diagnostics, handlers::health, routes::auth_middleware::auth_middleware};
use crate::AppState;
use axum::{routing::get, Router, middleware};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/diagnostics", get(diagnostics::diagnostics))
        .route("/v1/projects/:project_id/collaborators", get(collaborators::list_collaborators))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware)) // Applies to all routes added above
        .route("/v1/health", get(health::health_check))
        .route("/v1/ready", get(health::ready_check))
        .with_state(app_state)
}
