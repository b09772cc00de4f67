use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse}};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Runtime counters for operators
pub async fn diagnostics(
    State(app_state): State<Arc<AppState>>,
    Extension(prpls): Extension<Vec<String>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Ensure the caller is a cloud admin
    let _ = auth::ensure_cloud_admin(&prpls)?;

    // Aggregate counters from the registry and the presence store
    let stats = app_state.registry.stats().await;
    let (n_presence, n_active_collaborators) = app_state.presence.counts().await;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Rooms: {}, Sessions: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.n_rooms,
        stats.n_sessions
    );

    return Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_rooms: stats.n_rooms,
            n_sessions: stats.n_sessions,
            n_dirty_rooms: stats.n_dirty_rooms,
            n_presence: n_presence as u32,
            n_active_collaborators: n_active_collaborators as u32,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ));
}
