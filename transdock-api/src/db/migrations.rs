//! Database schema migrations

use sqlx::sqlite::SqlitePool;
use transdock_common::{Error, Result};

/// Create or upgrade the schema. Statements are idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS migrations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            source_host TEXT NOT NULL DEFAULT 'localhost',
            source_port INTEGER NOT NULL DEFAULT 22,
            source_username TEXT NOT NULL DEFAULT 'root',
            target_host TEXT NOT NULL,
            target_port INTEGER NOT NULL DEFAULT 22,
            target_username TEXT NOT NULL DEFAULT 'root',
            compose_stack_path TEXT NOT NULL,
            target_base_path TEXT NOT NULL,
            use_zfs INTEGER NOT NULL DEFAULT 1,
            transfer_method TEXT NOT NULL DEFAULT 'zfs_send',
            cleanup_on_success INTEGER NOT NULL DEFAULT 1,
            verify_transfer INTEGER NOT NULL DEFAULT 1,
            create_backup_snapshot INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            metadata_blob TEXT NOT NULL DEFAULT '{}',
            compose_project_name TEXT,
            compose_file_content TEXT,
            compose_env_content TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_migrations_name ON migrations(name)",
        "CREATE INDEX IF NOT EXISTS idx_migrations_status ON migrations(status)",
        "CREATE TABLE IF NOT EXISTS migration_steps (
            id TEXT PRIMARY KEY,
            migration_id TEXT NOT NULL REFERENCES migrations(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            step_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            started_at TEXT,
            completed_at TEXT,
            progress REAL NOT NULL DEFAULT 0.0,
            error_message TEXT,
            details_blob TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_migration_steps_migration
            ON migration_steps(migration_id, position)",
        "CREATE TABLE IF NOT EXISTS migration_snapshots (
            id TEXT PRIMARY KEY,
            migration_id TEXT NOT NULL REFERENCES migrations(id) ON DELETE CASCADE,
            full_name TEXT NOT NULL,
            dataset_name TEXT NOT NULL,
            snapshot_part TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            transfer_started_at TEXT,
            transfer_completed_at TEXT,
            transfer_status TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_migration_snapshots_migration
            ON migration_snapshots(migration_id)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Operation(format!("schema migration failed: {}", e)))?;
    }

    Ok(())
}
