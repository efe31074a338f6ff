//! TransDock API server
//!
//! Wires configuration, the SQLite repository, the ZFS services and the
//! migration orchestrator behind the HTTP/WebSocket surface.

use axum::{
    extract::{Path, Query, State},
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use transdock_api::auth::AuthService;
use transdock_api::compose::DockerComposeClient;
use transdock_api::config::TransdockConfig;
use transdock_api::db::{Database, MigrationRepository, SqliteMigrationRepository};
use transdock_api::error::ApiError;
use transdock_api::executor::{CommandExecutor, SystemCommandExecutor};
use transdock_api::migration::orchestrator::{
    CreateMigrationRequest, MigrationOrchestrator, OrchestratorConfig,
};
use transdock_api::migration::{Migration, MigrationOptions};
use transdock_api::state::AppState;
use transdock_api::websocket::{ConnectionManager, EventBroadcaster};
use transdock_api::zfs::{DatasetService, PoolService, SnapshotService};
use transdock_common::values::{DatasetName, HostConnection};
use transdock_common::TransferMethod;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TransdockConfig::load();
    let _log_guard = transdock_api::logging::init(&config.logging);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("invalid configuration: {}", e));
    }
    info!("Configuration loaded successfully");
    let config = Arc::new(config);

    // Database
    let database = Arc::new(
        Database::new(&config.database.url, config.database.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("database setup failed: {}", e))?,
    );
    database
        .migrate()
        .await
        .map_err(|e| anyhow::anyhow!("database migration failed: {}", e))?;
    info!("Database initialized");

    let repository: Arc<dyn MigrationRepository> =
        Arc::new(SqliteMigrationRepository::new(database.pool().clone()));

    // Command execution and services
    let executor: Arc<dyn CommandExecutor> = Arc::new(
        SystemCommandExecutor::new(
            config.executor.command_timeout_secs,
            config.executor.known_hosts_file.clone(),
        )
        .map_err(|e| anyhow::anyhow!("executor setup failed: {}", e))?,
    );
    let datasets = Arc::new(DatasetService::new(executor.clone()));
    let snapshots = Arc::new(SnapshotService::new(executor.clone()));
    let pools = Arc::new(PoolService::new(executor.clone()));
    let compose = Arc::new(DockerComposeClient::new(executor.clone()));

    // Events
    let connections = Arc::new(ConnectionManager::new());
    let broadcaster = Arc::new(EventBroadcaster::new(connections.clone()));
    broadcaster.start().await;

    // Orchestrator
    let orchestrator_config = OrchestratorConfig {
        max_migration_timeout_hours: config.safety.max_migration_timeout_hours,
        mandatory_pre_migration_snapshots: config.safety.mandatory_pre_migration_snapshots,
        require_dry_run_before_transfer: config.safety.require_dry_run_before_transfer,
        auto_accept_hostkeys: false,
    };
    let orchestrator = Arc::new(MigrationOrchestrator::new(
        repository.clone(),
        snapshots.clone(),
        datasets.clone(),
        compose.clone(),
        executor.clone(),
        broadcaster.clone(),
        orchestrator_config,
    ));

    // Authentication
    let auth = Arc::new(
        AuthService::new(&config.auth).map_err(|e| anyhow::anyhow!("auth setup failed: {}", e))?,
    );
    if config.auth.admin_password == "admin" {
        tracing::warn!("Using default admin password; set ADMIN_PASSWORD for production");
    }

    // Periodic retention of completed migrations
    {
        let orchestrator = orchestrator.clone();
        let keep_days = config.safety.backup_retention_days;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(24 * 3600));
            loop {
                interval.tick().await;
                match orchestrator.cleanup_old_migrations(keep_days).await {
                    Ok(0) => {}
                    Ok(n) => info!("Cleaned up {} old migrations", n),
                    Err(e) => error!("Migration cleanup failed: {}", e),
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        database: database.clone(),
        repository,
        orchestrator,
        datasets,
        snapshots,
        pools,
        compose,
        auth,
        connections,
        broadcaster: broadcaster.clone(),
    });

    let app = build_router(state.clone(), &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", addr, e))?;
    info!("TransDock API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broadcaster.stop().await;
    database.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn build_router(state: Arc<AppState>, config: &TransdockConfig) -> Router {
    let cors = if config.cors.origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors
            .origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // Health
        .route("/api/health", get(health_check))
        // Migrations
        .route("/migrations", post(create_migration).get(list_migrations))
        .route("/migrations/validate", post(validate_migration))
        .route("/migrations/:id", get(get_migration).delete(delete_migration))
        .route("/migrations/:id/start", post(start_migration))
        .route("/migrations/:id/cancel", post(cancel_migration))
        .route("/migrations/:id/status", get(migration_status))
        .route("/migrations/:id/logs", get(migration_logs))
        // Datasets
        .route("/api/v1/datasets", get(list_datasets).post(create_dataset))
        .route("/api/v1/datasets/properties", post(set_dataset_property))
        .route("/api/v1/datasets/mount", post(mount_dataset))
        .route("/api/v1/datasets/unmount", post(unmount_dataset))
        .route("/api/v1/datasets/usage", get(dataset_usage))
        .route("/api/v1/datasets/performance", get(dataset_performance))
        .route("/api/v1/datasets/*name", get(get_dataset).delete(destroy_dataset))
        // Snapshots
        .route("/api/v1/snapshots", get(list_snapshots).post(create_snapshot).delete(destroy_snapshot))
        .route("/api/v1/snapshots/rollback", post(rollback_snapshot))
        .route("/api/v1/snapshots/incremental", post(create_incremental_snapshot))
        .route("/api/v1/snapshots/retention", post(apply_retention))
        .route("/api/v1/snapshots/efficiency", get(snapshot_efficiency))
        // Pools
        .route("/api/v1/pools", get(list_pools))
        .route("/api/v1/pools/import", post(import_pool))
        .route("/api/v1/pools/:name", get(get_pool))
        .route("/api/v1/pools/:name/status", get(pool_status))
        .route("/api/v1/pools/:name/health", get(pool_health))
        .route("/api/v1/pools/:name/iostat", get(pool_iostat))
        .route("/api/v1/pools/:name/scrub", post(pool_scrub).get(pool_scrub_status))
        .route("/api/v1/pools/:name/history", get(pool_history))
        .route("/api/v1/pools/:name/export", post(export_pool))
        // Auth
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh_token))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/blacklist/stats", get(blacklist_stats))
        // WebSocket
        .route("/ws/monitor", get(transdock_api::websocket::ws_monitor_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.database.health_check().await?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "running_migrations": state.orchestrator.running_count().await,
    })))
}

// ---------------------------------------------------------------------------
// Migration handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateMigrationBody {
    name: String,
    compose_stack_path: String,
    target_host: String,
    #[serde(default = "default_port")]
    target_port: u16,
    #[serde(default = "default_username")]
    target_username: String,
    target_base_path: String,
    #[serde(default = "default_true")]
    use_zfs: bool,
    #[serde(default)]
    transfer_method: TransferMethod,
    #[serde(default = "default_source_host")]
    source_host: String,
    #[serde(default = "default_port")]
    source_port: u16,
    #[serde(default = "default_username")]
    source_username: String,
    #[serde(default = "default_true")]
    cleanup_on_success: bool,
    #[serde(default = "default_true")]
    verify_transfer: bool,
    #[serde(default = "default_true")]
    create_backup_snapshot: bool,
}

fn default_port() -> u16 {
    22
}
fn default_username() -> String {
    "root".to_string()
}
fn default_source_host() -> String {
    "localhost".to_string()
}
fn default_true() -> bool {
    true
}

async fn create_migration(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateMigrationBody>,
) -> Result<Json<Migration>, ApiError> {
    let target_host =
        HostConnection::new(body.target_host, body.target_username, body.target_port)?;
    let source_host =
        HostConnection::new(body.source_host, body.source_username, body.source_port)?;

    let request = CreateMigrationRequest {
        name: body.name,
        compose_stack_path: body.compose_stack_path,
        target_host,
        target_base_path: body.target_base_path,
        source_host: Some(source_host),
        options: MigrationOptions {
            use_zfs: body.use_zfs,
            transfer_method: body.transfer_method,
            cleanup_on_success: body.cleanup_on_success,
            verify_transfer: body.verify_transfer,
            create_backup_snapshot: body.create_backup_snapshot,
        },
    };

    let migration = state.orchestrator.create(request).await?;
    Ok(Json(migration))
}

async fn list_migrations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Migration>>, ApiError> {
    Ok(Json(state.orchestrator.list().await?))
}

async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Migration>, ApiError> {
    state
        .orchestrator
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Migration '{}' not found", id)))
}

async fn start_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.start(&id).await {
        Ok(_) => Ok(Json(serde_json::json!({
            "status": "started",
            "migration_id": id,
        }))),
        Err(transdock_common::Error::NotFound(msg)) => Err(ApiError::NotFound(msg)),
        Err(transdock_common::Error::Operation(msg)) => Err(ApiError::BadRequest(msg)),
        Err(e) => Err(e.into()),
    }
}

async fn cancel_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.cancel(&id).await {
        Ok(_) => Ok(Json(serde_json::json!({
            "status": "cancelled",
            "migration_id": id,
        }))),
        Err(transdock_common::Error::Operation(msg)) => Err(ApiError::BadRequest(msg)),
        Err(e) => Err(e.into()),
    }
}

async fn migration_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<transdock_api::migration::MigrationSummary>, ApiError> {
    Ok(Json(state.orchestrator.status(&id).await?))
}

async fn migration_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    Ok(Json(state.repository.get_migration_logs(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ValidateMigrationBody {
    compose_stack_path: String,
    target_host: String,
    #[serde(default = "default_port")]
    target_port: u16,
    #[serde(default = "default_username")]
    target_username: String,
    target_base_path: String,
}

async fn validate_migration(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateMigrationBody>,
) -> Result<Json<transdock_api::migration::orchestrator::RequestValidation>, ApiError> {
    let target_host =
        HostConnection::new(body.target_host, body.target_username, body.target_port)?;
    let outcome = state
        .orchestrator
        .validate_request(&body.compose_stack_path, &target_host, &body.target_base_path)
        .await;
    Ok(Json(outcome))
}

async fn delete_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.delete(&id).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "status": "deleted",
            "migration_id": id,
        }))),
        Err(transdock_common::Error::Operation(msg)) => Err(ApiError::BadRequest(msg)),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Dataset handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListDatasetsQuery {
    pool: Option<String>,
}

async fn list_datasets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListDatasetsQuery>,
) -> Result<Json<Vec<transdock_api::zfs::Dataset>>, ApiError> {
    Ok(Json(state.datasets.list(query.pool.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
struct CreateDatasetBody {
    name: String,
    #[serde(default)]
    properties: std::collections::HashMap<String, String>,
}

async fn create_dataset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDatasetBody>,
) -> Result<Json<transdock_api::zfs::Dataset>, ApiError> {
    let name = DatasetName::from_string(&body.name)?;
    Ok(Json(state.datasets.create(&name, &body.properties).await?))
}

async fn get_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<transdock_api::zfs::Dataset>, ApiError> {
    let name = DatasetName::from_string(&name)?;
    Ok(Json(state.datasets.get(&name).await?))
}

#[derive(Debug, Deserialize)]
struct DestroyDatasetQuery {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    recursive: bool,
}

async fn destroy_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<DestroyDatasetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = DatasetName::from_string(&name)?;
    state
        .datasets
        .destroy(&name, query.force, query.recursive)
        .await?;
    Ok(Json(serde_json::json!({ "status": "destroyed", "name": name.to_string() })))
}

#[derive(Debug, Deserialize)]
struct SetPropertyBody {
    name: String,
    property: String,
    value: String,
}

async fn set_dataset_property(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetPropertyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = DatasetName::from_string(&body.name)?;
    state
        .datasets
        .set_property(&name, &body.property, &body.value)
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct MountBody {
    name: String,
    #[serde(default)]
    force: bool,
}

async fn mount_dataset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MountBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = DatasetName::from_string(&body.name)?;
    state.datasets.mount(&name).await?;
    Ok(Json(serde_json::json!({ "status": "mounted" })))
}

async fn unmount_dataset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MountBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = DatasetName::from_string(&body.name)?;
    state.datasets.unmount(&name, body.force).await?;
    Ok(Json(serde_json::json!({ "status": "unmounted" })))
}

#[derive(Debug, Deserialize)]
struct DatasetNameQuery {
    name: String,
}

async fn dataset_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatasetNameQuery>,
) -> Result<Json<transdock_api::zfs::DatasetUsage>, ApiError> {
    let name = DatasetName::from_string(&query.name)?;
    Ok(Json(state.datasets.get_usage(&name).await?))
}

#[derive(Debug, Deserialize)]
struct PerformanceQuery {
    name: String,
    #[serde(default = "default_duration")]
    duration_secs: u64,
}

fn default_duration() -> u64 {
    30
}

async fn dataset_performance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PerformanceQuery>,
) -> Result<Json<transdock_api::zfs::dataset::PerformanceReport>, ApiError> {
    let name = DatasetName::from_string(&query.name)?;
    Ok(Json(
        state
            .datasets
            .monitor_performance(&name, query.duration_secs.min(300))
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Snapshot handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListSnapshotsQuery {
    dataset: Option<String>,
    #[serde(default)]
    recursive: bool,
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSnapshotsQuery>,
) -> Result<Json<Vec<transdock_api::zfs::Snapshot>>, ApiError> {
    let dataset = match &query.dataset {
        Some(name) => Some(DatasetName::from_string(name)?),
        None => None,
    };
    Ok(Json(
        state
            .snapshots
            .list(dataset.as_ref(), query.recursive)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CreateSnapshotBody {
    dataset: String,
    snapshot_name: String,
    #[serde(default)]
    recursive: bool,
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSnapshotBody>,
) -> Result<Json<transdock_api::zfs::Snapshot>, ApiError> {
    let dataset = DatasetName::from_string(&body.dataset)?;
    Ok(Json(
        state
            .snapshots
            .create(&dataset, &body.snapshot_name, body.recursive)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct SnapshotTargetQuery {
    dataset: String,
    snapshot: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    recursive: bool,
}

async fn destroy_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotTargetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dataset = DatasetName::from_string(&query.dataset)?;
    state
        .snapshots
        .destroy(&dataset, &query.snapshot, query.force, query.recursive)
        .await?;
    Ok(Json(serde_json::json!({ "status": "destroyed" })))
}

#[derive(Debug, Deserialize)]
struct RollbackBody {
    dataset: String,
    snapshot: String,
    #[serde(default)]
    force: bool,
}

async fn rollback_snapshot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RollbackBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dataset = DatasetName::from_string(&body.dataset)?;
    state
        .snapshots
        .rollback(&dataset, &body.snapshot, body.force)
        .await?;
    Ok(Json(serde_json::json!({ "status": "rolled_back" })))
}

#[derive(Debug, Deserialize)]
struct IncrementalBody {
    dataset: String,
    base_snapshot: String,
    new_snapshot: String,
}

async fn create_incremental_snapshot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IncrementalBody>,
) -> Result<Json<transdock_api::zfs::Snapshot>, ApiError> {
    let dataset = DatasetName::from_string(&body.dataset)?;
    Ok(Json(
        state
            .snapshots
            .create_incremental(&dataset, &body.base_snapshot, &body.new_snapshot)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct RetentionBody {
    dataset: String,
    retention_days: i64,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_retention(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RetentionBody>,
) -> Result<Json<transdock_api::zfs::RetentionReport>, ApiError> {
    if body.retention_days < 0 {
        return Err(ApiError::ValidationError(
            "retention_days must be nonnegative".to_string(),
        ));
    }
    let dataset = DatasetName::from_string(&body.dataset)?;
    Ok(Json(
        state
            .snapshots
            .apply_retention(&dataset, body.retention_days, body.dry_run)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct EfficiencyQuery {
    dataset: String,
    snapshot: String,
}

async fn snapshot_efficiency(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EfficiencyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dataset = DatasetName::from_string(&query.dataset)?;
    Ok(Json(
        state
            .snapshots
            .space_efficiency(&dataset, &query.snapshot)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Pool handlers
// ---------------------------------------------------------------------------

async fn list_pools(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<transdock_api::zfs::Pool>>, ApiError> {
    Ok(Json(state.pools.list().await?))
}

async fn get_pool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<transdock_api::zfs::Pool>, ApiError> {
    Ok(Json(state.pools.get(&name).await?))
}

async fn pool_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<transdock_api::zfs::pool::PoolStatus>, ApiError> {
    Ok(Json(state.pools.get_status(&name).await?))
}

async fn pool_health(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<transdock_api::zfs::pool::PoolHealthReport>, ApiError> {
    Ok(Json(state.pools.health_check(&name).await?))
}

#[derive(Debug, Deserialize)]
struct IostatQuery {
    #[serde(default = "default_interval")]
    interval: u32,
    #[serde(default = "default_count")]
    count: u32,
}

fn default_interval() -> u32 {
    1
}
fn default_count() -> u32 {
    1
}

async fn pool_iostat(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<IostatQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let output = state
        .pools
        .get_iostat(Some(&name), query.interval, query.count.min(10))
        .await?;
    Ok(Json(serde_json::json!({ "pool": name, "iostat": output })))
}

#[derive(Debug, Deserialize)]
struct ScrubBody {
    action: String,
}

async fn pool_scrub(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ScrubBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match body.action.as_str() {
        "start" => state.pools.start_scrub(&name).await?,
        "stop" => state.pools.stop_scrub(&name).await?,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown scrub action '{}', expected start or stop",
                other
            )))
        }
    }
    Ok(Json(serde_json::json!({ "status": body.action, "pool": name })))
}

async fn pool_scrub_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scan = state.pools.get_scrub_status(&name).await?;
    Ok(Json(serde_json::json!({ "pool": name, "scan": scan })))
}

async fn pool_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.pools.get_pool_history(&name).await?))
}

#[derive(Debug, Deserialize)]
struct ExportBody {
    #[serde(default)]
    force: bool,
}

async fn export_pool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ExportBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.pools.export(&name, body.force).await?;
    Ok(Json(serde_json::json!({ "status": "exported", "pool": name })))
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    name: String,
    new_name: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn import_pool(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .pools
        .import(&body.name, body.new_name.as_deref(), body.force)
        .await?;
    Ok(Json(serde_json::json!({ "status": "imported", "pool": body.name })))
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<transdock_common::auth::LoginRequest>,
) -> Result<Json<transdock_common::auth::LoginResponse>, ApiError> {
    state
        .auth
        .login(&body.username, &body.password)
        .map(Json)
        .map_err(|_| ApiError::AuthenticationFailed)
}

async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<transdock_common::auth::RefreshRequest>,
) -> Result<Json<transdock_common::auth::LoginResponse>, ApiError> {
    state
        .auth
        .refresh(&body.refresh_token)
        .map(Json)
        .map_err(|_| ApiError::AuthenticationFailed)
}

#[derive(Debug, Deserialize)]
struct LogoutBody {
    token: String,
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogoutBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.auth.logout(&body.token)?;
    Ok(Json(serde_json::json!({ "status": "logged_out" })))
}

async fn blacklist_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<transdock_common::auth::BlacklistStats>, ApiError> {
    Ok(Json(state.auth.blacklist.stats()))
}
