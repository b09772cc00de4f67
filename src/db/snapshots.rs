use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::crdt::DocumentSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] SqlxError),
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_cbor::Error),
}

/// Durable storage for project snapshots. One opaque blob per project,
/// written whole; the last write wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<Option<DocumentSnapshot>, StoreError>;
    async fn save(&self, project_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError>;
    fn backend(&self) -> &'static str;
}

/// Snapshot storage on Postgres
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Create the connection pool and make sure the snapshot table exists.
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20) // Increased from 5 to support more concurrent operations
            .min_connections(2) // Keep some connections alive
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_snapshots (
                project_id TEXT PRIMARY KEY,
                snapshot BYTEA NOT NULL,
                saved_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&pool)
        .await?;
        info!("Snapshot table ready");

        Ok(Self { pool })
    }

    pub fn _pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, project_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM project_snapshots WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let blob: Vec<u8> = row.get("snapshot");
                Ok(Some(serde_cbor::from_slice(&blob)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, project_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        // Log pool stats before acquiring connection
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "Saving snapshot for project {}. Pool connections: {} idle, {} in use",
            project_id,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );

        let blob = serde_cbor::to_vec(snapshot)?;
        let result = sqlx::query(
            r#"
            INSERT INTO project_snapshots (project_id, snapshot, saved_at, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (project_id) DO UPDATE
                SET snapshot = EXCLUDED.snapshot,
                    saved_at = EXCLUDED.saved_at,
                    updated_at = now()
            "#,
        )
        .bind(project_id)
        .bind(&blob)
        .bind(snapshot.saved_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = &result {
            error!(
                "Failed to save snapshot for project {}: {}. Pool state: {} idle, {} total",
                project_id,
                e,
                self.pool.num_idle(),
                self.pool.size()
            );
        }
        result?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// In-memory fallback used when no database URL is configured. Snapshots
/// go through the same codec as the Postgres path.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, project_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let blobs = self.blobs.lock().await;
        match blobs.get(project_id) {
            Some(blob) => Ok(Some(serde_cbor::from_slice(blob)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, project_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let blob = serde_cbor::to_vec(snapshot)?;
        self.blobs.lock().await.insert(project_id.to_string(), blob);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
