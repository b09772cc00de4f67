use std::panic;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use colabri_sync::clients::NotifierClient;
use colabri_sync::config::Config;
use colabri_sync::db::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use colabri_sync::presence::{spawn_presence_cleanup, PresenceStore};
use colabri_sync::room::{spawn_registry_sweep, RoomRegistry};
use colabri_sync::services::auth_service::{IdentityVerifier, JwtVerifier};
use colabri_sync::{app_router, AppState};

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_sync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Open snapshot storage if a database URL is provided
    let store: Arc<dyn SnapshotStore> = if let Some(db_url) = &config.db_url {
        match PgSnapshotStore::connect(db_url).await {
            Ok(store) => {
                info!("Database initialized successfully");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to in-memory snapshots - documents will not survive a restart");
                Arc::new(MemorySnapshotStore::new())
            }
        }
    } else {
        warn!("No database URL configured - documents will not survive a restart");
        Arc::new(MemorySnapshotStore::new())
    };

    // Presence store and its cleanup task
    let presence = Arc::new(PresenceStore::new(
        config.offline_threshold(),
        config.away_threshold(),
        config.presence_retention(),
    ));
    spawn_presence_cleanup(presence.clone(), config.presence_cleanup_interval());

    // Room registry and its eviction sweep
    let registry = Arc::new(RoomRegistry::new(config.clone(), store.clone(), presence.clone()));
    spawn_registry_sweep(registry.clone(), config.sweep_interval());

    // Token verification
    if config.cloud_auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - every connection will be rejected");
    }
    let verifier: Arc<dyn IdentityVerifier> =
        Arc::new(JwtVerifier::new(config.cloud_auth_jwt_secret.clone()));

    // Optional activity/presence notifications to the app service
    let notifier = match (&config.notifier_base_url, &config.cloud_auth_jwt_secret) {
        (Some(base_url), Some(secret)) => Some(Arc::new(NotifierClient::new(
            base_url.clone(),
            secret.clone(),
            config.cloud_service_name.clone(),
        ))),
        _ => {
            info!("Notifier not configured - activity and presence events stay local");
            None
        }
    };

    let app_state = Arc::new(AppState {
        config: config.clone(),
        registry,
        presence,
        verifier,
        store,
        notifier,
    });

    let app_routes = app_router(app_state);

    // Start the server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/ws", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
