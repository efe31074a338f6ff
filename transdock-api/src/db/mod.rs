//! Database layer using SQLite
//!
//! The orchestrator only sees the `MigrationRepository` trait; the SQLite
//! implementation keeps a migration row and its step rows consistent by
//! writing them in one transaction.

pub mod migrations;

use crate::migration::{
    Migration, MigrationOptions, MigrationStatus, MigrationStep, MigrationStepStatus,
    MigrationStepType,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use transdock_common::values::HostConnection;
use transdock_common::{Error, Result, TransferMethod};
use uuid::Uuid;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Operation(format!("failed to create DB directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::Unavailable(format!("invalid database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::Unavailable(format!("database connection failed: {}", e)))?;

        tracing::info!("Database connection established");
        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Unavailable(format!("database health check failed: {}", e)))?;
        Ok(())
    }
}

/// Durable storage of migrations and their steps.
#[async_trait]
pub trait MigrationRepository: Send + Sync {
    async fn create(&self, migration: &Migration) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Migration>>;
    /// Most recently created migration with the given name.
    async fn find_by_name(&self, name: &str) -> Result<Option<Migration>>;
    async fn list_all(&self) -> Result<Vec<Migration>>;
    async fn list_active(&self) -> Result<Vec<Migration>>;
    async fn list_completed(&self) -> Result<Vec<Migration>>;
    async fn list_failed(&self) -> Result<Vec<Migration>>;
    /// Write the migration row and all of its steps in one transaction.
    async fn update(&self, migration: &Migration) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn update_status(&self, id: &str, status: MigrationStatus) -> Result<()>;
    async fn add_step(&self, migration_id: &str, step: &MigrationStep, position: i64) -> Result<()>;
    async fn update_step(&self, migration_id: &str, step: &MigrationStep) -> Result<()>;
    async fn store_compose_content(
        &self,
        migration_id: &str,
        compose_content: &str,
        env_content: Option<&str>,
        project_name: Option<&str>,
    ) -> Result<()>;
    async fn get_compose_content(&self, migration_id: &str) -> Result<Option<ComposeContent>>;
    /// Delete completed migrations older than the cutoff; returns the count.
    async fn cleanup_old_migrations(&self, keep_days: i64) -> Result<u64>;
    /// Synthesized log view over step details and errors.
    async fn get_migration_logs(&self, migration_id: &str) -> Result<Vec<serde_json::Value>>;
    async fn record_snapshot(&self, migration_id: &str, full_name: &str) -> Result<()>;
    async fn mark_snapshot_deleted(&self, migration_id: &str, full_name: &str) -> Result<()>;
}

/// Stored compose file contents for a migration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComposeContent {
    pub compose_content: String,
    pub env_content: Option<String>,
    pub project_name: Option<String>,
}

/// SQLite-backed repository.
pub struct SqliteMigrationRepository {
    pool: SqlitePool,
}

impl SqliteMigrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, migration_id: &str) -> Result<Vec<MigrationStep>> {
        let rows = sqlx::query(
            "SELECT * FROM migration_steps WHERE migration_id = ? ORDER BY position",
        )
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_step).collect()
    }

    async fn load_migration(&self, row: &SqliteRow) -> Result<Migration> {
        let mut migration = row_to_migration(row)?;
        migration.steps = self.load_steps(&migration.id).await?;
        Ok(migration)
    }

    async fn list_by_clause(&self, clause: &str) -> Result<Vec<Migration>> {
        let query = format!(
            "SELECT * FROM migrations {} ORDER BY created_at DESC",
            clause
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await.map_err(db_err)?;

        let mut migrations = Vec::with_capacity(rows.len());
        for row in &rows {
            migrations.push(self.load_migration(row).await?);
        }
        Ok(migrations)
    }
}

fn db_err(err: sqlx::Error) -> Error {
    Error::Operation(format!("database error: {}", err))
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'rolled_back')";

#[async_trait]
impl MigrationRepository for SqliteMigrationRepository {
    async fn create(&self, migration: &Migration) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO migrations (
                id, name, status,
                source_host, source_port, source_username,
                target_host, target_port, target_username,
                compose_stack_path, target_base_path,
                use_zfs, transfer_method, cleanup_on_success,
                verify_transfer, create_backup_snapshot,
                created_at, started_at, completed_at,
                error_message, metadata_blob
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&migration.id)
        .bind(&migration.name)
        .bind(migration.status.to_string())
        .bind(&migration.source_host.hostname)
        .bind(migration.source_host.port as i64)
        .bind(&migration.source_host.username)
        .bind(&migration.target_host.hostname)
        .bind(migration.target_host.port as i64)
        .bind(&migration.target_host.username)
        .bind(&migration.compose_stack_path)
        .bind(&migration.target_base_path)
        .bind(migration.options.use_zfs)
        .bind(migration.options.transfer_method.to_string())
        .bind(migration.options.cleanup_on_success)
        .bind(migration.options.verify_transfer)
        .bind(migration.options.create_backup_snapshot)
        .bind(migration.created_at)
        .bind(migration.started_at)
        .bind(migration.completed_at)
        .bind(&migration.error_message)
        .bind(serde_json::to_string(&migration.metadata).unwrap_or_else(|_| "{}".to_string()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for (position, step) in migration.steps.iter().enumerate() {
            insert_step(&mut tx, &migration.id, step, position as i64).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Migration>> {
        let row = sqlx::query("SELECT * FROM migrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.load_migration(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Migration>> {
        let row = sqlx::query(
            "SELECT * FROM migrations WHERE name = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.load_migration(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<Migration>> {
        self.list_by_clause("").await
    }

    async fn list_active(&self) -> Result<Vec<Migration>> {
        self.list_by_clause(&format!("WHERE status NOT IN {}", TERMINAL_STATUSES))
            .await
    }

    async fn list_completed(&self) -> Result<Vec<Migration>> {
        self.list_by_clause("WHERE status = 'completed'").await
    }

    async fn list_failed(&self) -> Result<Vec<Migration>> {
        self.list_by_clause("WHERE status = 'failed'").await
    }

    async fn update(&self, migration: &Migration) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE migrations SET
                name = ?, status = ?, started_at = ?, completed_at = ?,
                error_message = ?, metadata_blob = ?
             WHERE id = ?",
        )
        .bind(&migration.name)
        .bind(migration.status.to_string())
        .bind(migration.started_at)
        .bind(migration.completed_at)
        .bind(&migration.error_message)
        .bind(serde_json::to_string(&migration.metadata).unwrap_or_else(|_| "{}".to_string()))
        .bind(&migration.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("migration {}", migration.id)));
        }

        for (position, step) in migration.steps.iter().enumerate() {
            upsert_step(&mut tx, &migration.id, step, position as i64).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        // Steps and snapshot rows cascade.
        let result = sqlx::query("DELETE FROM migrations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("migration {}", id)));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: MigrationStatus) -> Result<()> {
        let result = sqlx::query("UPDATE migrations SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("migration {}", id)));
        }
        Ok(())
    }

    async fn add_step(&self, migration_id: &str, step: &MigrationStep, position: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        insert_step(&mut tx, migration_id, step, position).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_step(&self, migration_id: &str, step: &MigrationStep) -> Result<()> {
        let result = sqlx::query(
            "UPDATE migration_steps SET
                status = ?, started_at = ?, completed_at = ?,
                progress = ?, error_message = ?, details_blob = ?
             WHERE id = ? AND migration_id = ?",
        )
        .bind(step.status.to_string())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.progress_percentage)
        .bind(&step.error_message)
        .bind(serde_json::to_string(&step.details).unwrap_or_else(|_| "{}".to_string()))
        .bind(&step.id)
        .bind(migration_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "step {} of migration {}",
                step.id, migration_id
            )));
        }
        Ok(())
    }

    async fn store_compose_content(
        &self,
        migration_id: &str,
        compose_content: &str,
        env_content: Option<&str>,
        project_name: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE migrations SET
                compose_file_content = ?, compose_env_content = ?, compose_project_name = ?
             WHERE id = ?",
        )
        .bind(compose_content)
        .bind(env_content)
        .bind(project_name)
        .bind(migration_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("migration {}", migration_id)));
        }
        Ok(())
    }

    async fn get_compose_content(&self, migration_id: &str) -> Result<Option<ComposeContent>> {
        let row = sqlx::query(
            "SELECT compose_file_content, compose_env_content, compose_project_name
             FROM migrations WHERE id = ?",
        )
        .bind(migration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let row = match row {
            Some(row) => row,
            None => return Err(Error::NotFound(format!("migration {}", migration_id))),
        };

        let compose: Option<String> = row.get("compose_file_content");
        Ok(compose.map(|compose_content| ComposeContent {
            compose_content,
            env_content: row.get("compose_env_content"),
            project_name: row.get("compose_project_name"),
        }))
    }

    async fn cleanup_old_migrations(&self, keep_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(keep_days);
        let result = sqlx::query(
            "DELETE FROM migrations
             WHERE status = 'completed' AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn get_migration_logs(&self, migration_id: &str) -> Result<Vec<serde_json::Value>> {
        let migration = self
            .find_by_id(migration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("migration {}", migration_id)))?;

        let mut logs = Vec::new();
        for step in &migration.steps {
            if let Some(started) = step.started_at {
                logs.push(serde_json::json!({
                    "timestamp": started,
                    "step": step.name,
                    "step_type": step.step_type,
                    "event": "started",
                }));
            }
            if let Some(message) = step.details.get("progress_message") {
                logs.push(serde_json::json!({
                    "timestamp": step.completed_at.or(step.started_at),
                    "step": step.name,
                    "step_type": step.step_type,
                    "event": "progress",
                    "message": message,
                }));
            }
            if let Some(completed) = step.completed_at {
                logs.push(serde_json::json!({
                    "timestamp": completed,
                    "step": step.name,
                    "step_type": step.step_type,
                    "event": step.status.to_string(),
                    "error": step.error_message,
                }));
            }
        }
        Ok(logs)
    }

    async fn record_snapshot(&self, migration_id: &str, full_name: &str) -> Result<()> {
        let (dataset, snapshot_part) = full_name
            .rsplit_once('@')
            .ok_or_else(|| Error::validation("snapshot", "snapshot name missing '@'"))?;

        sqlx::query(
            "INSERT INTO migration_snapshots
                (id, migration_id, full_name, dataset_name, snapshot_part, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(migration_id)
        .bind(full_name)
        .bind(dataset)
        .bind(snapshot_part)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_snapshot_deleted(&self, migration_id: &str, full_name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE migration_snapshots SET is_deleted = 1, deleted_at = ?
             WHERE migration_id = ? AND full_name = ?",
        )
        .bind(Utc::now())
        .bind(migration_id)
        .bind(full_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

async fn insert_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    migration_id: &str,
    step: &MigrationStep,
    position: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO migration_steps (
            id, migration_id, position, name, step_type, status,
            started_at, completed_at, progress, error_message, details_blob
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&step.id)
    .bind(migration_id)
    .bind(position)
    .bind(&step.name)
    .bind(step.step_type.to_string())
    .bind(step.status.to_string())
    .bind(step.started_at)
    .bind(step.completed_at)
    .bind(step.progress_percentage)
    .bind(&step.error_message)
    .bind(serde_json::to_string(&step.details).unwrap_or_else(|_| "{}".to_string()))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn upsert_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    migration_id: &str,
    step: &MigrationStep,
    position: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO migration_steps (
            id, migration_id, position, name, step_type, status,
            started_at, completed_at, progress, error_message, details_blob
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            position = excluded.position,
            status = excluded.status,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            progress = excluded.progress,
            error_message = excluded.error_message,
            details_blob = excluded.details_blob",
    )
    .bind(&step.id)
    .bind(migration_id)
    .bind(position)
    .bind(&step.name)
    .bind(step.step_type.to_string())
    .bind(step.status.to_string())
    .bind(step.started_at)
    .bind(step.completed_at)
    .bind(step.progress_percentage)
    .bind(&step.error_message)
    .bind(serde_json::to_string(&step.details).unwrap_or_else(|_| "{}".to_string()))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn row_to_migration(row: &SqliteRow) -> Result<Migration> {
    let status_str: String = row.get("status");
    let transfer_str: String = row.get("transfer_method");

    let source_host = HostConnection::new(
        row.get::<String, _>("source_host"),
        row.get::<String, _>("source_username"),
        row.get::<i64, _>("source_port") as u16,
    )?;
    let target_host = HostConnection::new(
        row.get::<String, _>("target_host"),
        row.get::<String, _>("target_username"),
        row.get::<i64, _>("target_port") as u16,
    )?;

    let metadata_blob: String = row.get("metadata_blob");
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(&metadata_blob)
        .map_err(|e| Error::Parse(format!("invalid metadata blob: {}", e)))?;

    Ok(Migration {
        id: row.get("id"),
        name: row.get("name"),
        status: MigrationStatus::from_str(&status_str)?,
        source_host,
        target_host,
        compose_stack_path: row.get("compose_stack_path"),
        target_base_path: row.get("target_base_path"),
        options: MigrationOptions {
            use_zfs: row.get("use_zfs"),
            transfer_method: TransferMethod::from_str(&transfer_str)?,
            cleanup_on_success: row.get("cleanup_on_success"),
            verify_transfer: row.get("verify_transfer"),
            create_backup_snapshot: row.get("create_backup_snapshot"),
        },
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
        metadata,
        steps: Vec::new(),
    })
}

fn row_to_step(row: &SqliteRow) -> Result<MigrationStep> {
    let step_type_str: String = row.get("step_type");
    let status_str: String = row.get("status");
    let details_blob: String = row.get("details_blob");

    Ok(MigrationStep {
        id: row.get("id"),
        name: row.get("name"),
        step_type: MigrationStepType::from_str(&step_type_str)?,
        status: MigrationStepStatus::from_str(&status_str)?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        progress_percentage: row.get("progress"),
        error_message: row.get("error_message"),
        details: serde_json::from_str(&details_blob)
            .map_err(|e| Error::Parse(format!("invalid step details blob: {}", e)))?,
    })
}
