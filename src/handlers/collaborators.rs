use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use tracing::debug;

use crate::models::Collaborator;
use crate::AppState;

/// List everyone currently live in a project
pub async fn list_collaborators(
    State(app_state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Json<Vec<Collaborator>> {
    debug!("Collaborator listing requested for project {}", project_id);
    let collaborators = app_state.presence.list_collaborators(&project_id).await;
    Json(collaborators)
}
