//! colabri-sync library
//!
//! Real-time collaboration engine: rooms, presence, replicated project
//! documents and the WebSocket gateway that ties them together.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod clients;
pub mod config;
pub mod crdt;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod room;
pub mod routes;
pub mod services;
pub mod ws;

use clients::NotifierClient;
use config::Config;
use db::SnapshotStore;
use docs::ApiDoc;
use presence::PresenceStore;
use room::RoomRegistry;
use routes::create_api_routes;
use services::auth_service::IdentityVerifier;
use ws::ws_handler;

/// Everything the handlers and the gateway share. Built once at startup and
/// passed around explicitly; nothing in here is a process global.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<RoomRegistry>,
    pub presence: Arc<PresenceStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub store: Arc<dyn SnapshotStore>,
    pub notifier: Option<Arc<NotifierClient>>,
}

/// Assemble the full router: collaboration endpoint, REST API and docs.
/// Shared by the binary and the integration tests.
pub fn app_router(app_state: Arc<AppState>) -> Router {
    let api_routes = create_api_routes(app_state.clone());

    Router::new()
        // Mount the collaboration endpoint
        .route("/ws", get(ws_handler))
        .with_state(app_state)
        // Mount API routes
        .nest("/api", api_routes)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
}
