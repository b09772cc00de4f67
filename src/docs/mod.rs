use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/ready",
    responses(
        (status = 200, description = "Service is ready to accept connections", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// List the live collaborators of a project
#[utoipa::path(
    get,
    path = "/api/v1/projects/{project_id}/collaborators",
    params(
        ("project_id" = String, Path, description = "Project identifier")
    ),
    responses(
        (status = 200, description = "Collaborators currently online or away", body = [Collaborator]),
        (status = 401, description = "Missing or invalid token")
    )
)]
#[allow(dead_code)]
pub async fn list_collaborators_doc() {}

/// Runtime diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Runtime counters and system stats", body = DiagnosticsResponse),
        (status = 403, description = "Caller is not a cloud admin", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        list_collaborators_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            Collaborator,
            PresenceStatus,
            crate::crdt::CursorPosition,
            DiagnosticsResponse,
            ErrorResponse
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
