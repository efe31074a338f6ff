//! Migration orchestration
//!
//! Owns the migration lifecycle: builds the step list, runs one worker task
//! per started migration, persists every state transition before emitting
//! it, and honors cooperative cancellation at each suspension point.

use crate::compose::ComposeClient;
use crate::db::MigrationRepository;
use crate::executor::CommandExecutor;
use crate::migration::{
    build_steps, Migration, MigrationOptions, MigrationStatus, MigrationStepType, MigrationSummary,
};
use crate::validation;
use crate::websocket::{EventBroadcaster, EventType};
use crate::zfs::{DatasetService, SnapshotService};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transdock_common::values::{HostConnection, SshConfig};
use transdock_common::{Error, Result, TransferMethod};

/// How often the verification step polls service states.
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Soft deadline for the verification step, distinct from the global
/// migration timeout.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// Request to create a migration
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMigrationRequest {
    pub name: String,
    pub compose_stack_path: String,
    pub target_host: HostConnection,
    pub target_base_path: String,
    pub source_host: Option<HostConnection>,
    pub options: MigrationOptions,
}

/// Outcome of validate_request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub requirements: Vec<String>,
}

struct RunningMigration {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

enum StepOutcome {
    Completed,
    Skipped,
}

/// Safety toggles the orchestrator consults
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_migration_timeout_hours: u64,
    pub mandatory_pre_migration_snapshots: bool,
    pub require_dry_run_before_transfer: bool,
    pub auto_accept_hostkeys: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_migration_timeout_hours: 12,
            mandatory_pre_migration_snapshots: true,
            require_dry_run_before_transfer: true,
            auto_accept_hostkeys: false,
        }
    }
}

/// The migration state machine.
pub struct MigrationOrchestrator {
    repository: Arc<dyn MigrationRepository>,
    snapshots: Arc<SnapshotService>,
    datasets: Arc<DatasetService>,
    compose: Arc<dyn ComposeClient>,
    executor: Arc<dyn CommandExecutor>,
    broadcaster: Arc<EventBroadcaster>,
    config: OrchestratorConfig,
    running: Mutex<HashMap<String, RunningMigration>>,
}

impl MigrationOrchestrator {
    pub fn new(
        repository: Arc<dyn MigrationRepository>,
        snapshots: Arc<SnapshotService>,
        datasets: Arc<DatasetService>,
        compose: Arc<dyn ComposeClient>,
        executor: Arc<dyn CommandExecutor>,
        broadcaster: Arc<EventBroadcaster>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            snapshots,
            datasets,
            compose,
            executor,
            broadcaster,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Create a migration with its deterministic step list.
    pub async fn create(&self, request: CreateMigrationRequest) -> Result<Migration> {
        validation::validate_path(&request.compose_stack_path)?;
        if request.name.trim().is_empty() {
            return Err(Error::validation("name", "migration name cannot be empty"));
        }

        let source_host = request.source_host.unwrap_or_else(HostConnection::localhost);
        let mut migration = Migration::new(
            request.name,
            source_host,
            request.target_host,
            request.compose_stack_path,
            request.target_base_path,
            request.options,
        );
        migration.steps = build_steps(&migration.options);

        self.repository.create(&migration).await?;
        info!("Created migration: {} (ID: {})", migration.name, migration.id);
        Ok(migration)
    }

    /// Start a created migration; one worker per migration.
    pub async fn start(self: &Arc<Self>, migration_id: &str) -> Result<bool> {
        let migration = self
            .repository
            .find_by_id(migration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("migration {}", migration_id)))?;

        let mut running = self.running.lock().await;
        if running.contains_key(migration_id) || migration.is_running() {
            return Err(Error::Operation(format!(
                "migration {} is already running",
                migration_id
            )));
        }
        if migration.status.is_terminal() {
            return Err(Error::Operation(format!(
                "migration {} already finished as {}",
                migration_id, migration.status
            )));
        }

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let this = self.clone();
        let id = migration_id.to_string();
        let handle = tokio::spawn(async move {
            this.run_worker(&id, worker_token).await;
        });

        running.insert(
            migration_id.to_string(),
            RunningMigration { token, handle },
        );
        info!("Started migration: {} (ID: {})", migration.name, migration_id);
        Ok(true)
    }

    /// Cancel a running migration; returns once the worker has unwound.
    pub async fn cancel(&self, migration_id: &str) -> Result<bool> {
        let entry = self.running.lock().await.remove(migration_id);
        let entry = match entry {
            Some(entry) => entry,
            None => {
                return Err(Error::Operation(format!(
                    "migration {} is not running and cannot be cancelled",
                    migration_id
                )))
            }
        };

        entry.token.cancel();
        if let Err(e) = entry.handle.await {
            error!("Migration worker for {} panicked: {}", migration_id, e);
        }

        info!("Cancelled migration: {}", migration_id);
        Ok(true)
    }

    pub async fn get(&self, migration_id: &str) -> Result<Option<Migration>> {
        self.repository.find_by_id(migration_id).await
    }

    pub async fn list(&self) -> Result<Vec<Migration>> {
        self.repository.list_all().await
    }

    pub async fn delete(&self, migration_id: &str) -> Result<()> {
        if self.running.lock().await.contains_key(migration_id) {
            return Err(Error::Operation(format!(
                "migration {} is running; cancel it before deleting",
                migration_id
            )));
        }
        self.repository.delete(migration_id).await
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Status summary enriched with live task state and a remaining-time
    /// estimate.
    pub async fn status(&self, migration_id: &str) -> Result<MigrationSummary> {
        let migration = self
            .repository
            .find_by_id(migration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("migration {}", migration_id)))?;

        let mut summary = migration.summary();
        if migration.is_running() {
            let running = self.running.lock().await;
            if let Some(entry) = running.get(migration_id) {
                summary.task_running = Some(!entry.handle.is_finished());
            }
        }
        summary.estimated_remaining_seconds = migration.estimate_remaining_secs();
        Ok(summary)
    }

    /// Static validation of a migration request; never mutates state.
    pub async fn validate_request(
        &self,
        compose_stack_path: &str,
        target_host: &HostConnection,
        target_base_path: &str,
    ) -> RequestValidation {
        let mut outcome = RequestValidation {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            requirements: Vec::new(),
        };

        match self.compose.validate_prerequisites(compose_stack_path).await {
            Ok(validation) => {
                if !validation.valid {
                    outcome.valid = false;
                    outcome.errors.push(format!(
                        "Compose validation failed: {}",
                        validation.error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                }
                if validation.complexity == crate::compose::StackComplexity::Complex {
                    outcome.warnings.push(
                        "Complex migration - consider breaking down into smaller parts".to_string(),
                    );
                }
                if validation.external_volumes {
                    outcome.warnings.push(
                        "Stack uses external volumes that may need special handling".to_string(),
                    );
                }
            }
            Err(e) => {
                outcome.valid = false;
                outcome.errors.push(format!("Compose validation failed: {}", e));
            }
        }

        if !target_base_path.starts_with('/') {
            outcome.valid = false;
            outcome
                .errors
                .push("Target base path must be an absolute path".to_string());
        }

        if !target_host.is_localhost() {
            outcome
                .requirements
                .push(format!("SSH key access to {}", target_host));
        }
        if self.config.mandatory_pre_migration_snapshots {
            outcome
                .requirements
                .push("Pre-migration snapshots are created before any transfer".to_string());
        }

        outcome
    }

    pub async fn cleanup_old_migrations(&self, keep_days: i64) -> Result<u64> {
        self.repository.cleanup_old_migrations(keep_days).await
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    async fn run_worker(self: &Arc<Self>, migration_id: &str, token: CancellationToken) {
        let global_timeout =
            Duration::from_secs(self.config.max_migration_timeout_hours.max(1) * 3600);

        enum Outcome {
            Completed,
            Cancelled,
            Failed(Error),
            TimedOut,
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(
                global_timeout,
                self.execute_migration(migration_id, &token),
            ) => match result {
                Ok(Ok(())) => Outcome::Completed,
                Ok(Err(e)) if e.is_cancelled() => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::TimedOut,
            },
        };

        match outcome {
            Outcome::Completed => {
                self.emit_final(migration_id, EventType::MigrationCompleted).await;
            }
            Outcome::Cancelled => {
                self.finalize_cancelled(migration_id).await;
                self.emit_final(migration_id, EventType::MigrationCancelled).await;
            }
            Outcome::Failed(e) => {
                error!("Migration {} failed: {}", migration_id, e);
                self.emit_final(migration_id, EventType::MigrationFailed).await;
            }
            Outcome::TimedOut => {
                self.finalize_timed_out(migration_id).await;
                self.emit_final(migration_id, EventType::MigrationFailed).await;
            }
        }

        self.running.lock().await.remove(migration_id);
    }

    /// Worker body: the step loop. Per-step failures are persisted here;
    /// cancellation is detected either cooperatively (Cancelled error) or by
    /// the select in run_worker dropping this future mid-command.
    async fn execute_migration(&self, migration_id: &str, token: &CancellationToken) -> Result<()> {
        let mut migration = self
            .repository
            .find_by_id(migration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("migration {}", migration_id)))?;

        migration.start();
        self.persist(&migration).await?;

        for index in 0..migration.steps.len() {
            check_cancelled(token)?;

            migration.steps[index].start();
            if let Some(status) = status_for_step(migration.steps[index].step_type) {
                migration.status = status;
            }
            self.persist(&migration).await?;

            let result = self.dispatch_step(&mut migration, index, token).await;

            match result {
                Ok(StepOutcome::Completed) => {
                    migration.steps[index].complete();
                    self.persist(&migration).await?;
                }
                Ok(StepOutcome::Skipped) => {
                    // skip() was already applied by the handler.
                    self.persist(&migration).await?;
                }
                Err(e) if e.is_cancelled() => {
                    // finalize_cancelled records the step state; propagate so
                    // run_worker sees the cancellation.
                    return Err(e);
                }
                Err(e) => {
                    migration.steps[index]
                        .details
                        .insert("error_kind".to_string(), serde_json::json!(e.code()));
                    migration.steps[index].fail(e.to_string());
                    migration.fail(e.to_string());
                    self.persist(&migration).await?;
                    return Err(e);
                }
            }
        }

        migration.complete();
        self.persist(&migration).await?;
        info!(
            "Migration completed successfully: {} (ID: {})",
            migration.name, migration.id
        );
        Ok(())
    }

    async fn dispatch_step(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        let step_type = migration.steps[index].step_type;
        info!(
            "Executing step {} for migration {}",
            migration.steps[index].name, migration.name
        );

        match step_type {
            MigrationStepType::Validation => self.step_validation(migration, index, token).await,
            MigrationStepType::SnapshotCreation => {
                self.step_snapshot_creation(migration, index, token).await
            }
            MigrationStepType::DataTransfer => {
                self.step_data_transfer(migration, index, token).await
            }
            MigrationStepType::ContainerRecreation => {
                self.step_container_recreation(migration, index, token).await
            }
            MigrationStepType::ServiceStart => self.step_service_start(migration, index).await,
            MigrationStepType::Verification => {
                self.step_verification(migration, index, token).await
            }
            MigrationStepType::Cleanup => self.step_cleanup(migration, index, token).await,
        }
    }

    async fn step_validation(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 10.0, "Validating compose prerequisites")
            .await?;

        if !migration.target_base_path.starts_with('/') {
            return Err(Error::validation(
                "target_base_path",
                "Target base path must be an absolute path",
            ));
        }

        let stack_validation = self
            .compose
            .validate_prerequisites(&migration.compose_stack_path)
            .await?;
        if !stack_validation.valid {
            return Err(Error::Operation(format!(
                "compose validation failed: {}",
                stack_validation
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        check_cancelled(token)?;
        self.progress(migration, index, 50.0, "Validating target host connectivity")
            .await?;

        let target = migration.target_host.clone();
        if !target.is_localhost() {
            let ssh_config = SshConfig::from_host(&target);
            let result = self
                .executor
                .execute_remote(
                    &target.hostname,
                    &["echo", "transdock-reachability"],
                    &ssh_config,
                    self.config.auto_accept_hostkeys,
                )
                .await?;
            if !result.success {
                return Err(Error::Remote {
                    host: target.hostname.clone(),
                    exit_code: Some(result.exit_code),
                    message: format!("target host unreachable: {}", result.stderr),
                });
            }
        }

        check_cancelled(token)?;
        self.progress(migration, index, 80.0, "Validating ZFS prerequisites")
            .await?;

        if migration.options.use_zfs {
            let result = self
                .executor
                .execute_zfs("list", &["-H", "-o", "name"])
                .await?;
            if !result.success {
                return Err(Error::Unavailable(format!(
                    "ZFS is not available on the source host: {}",
                    result.stderr
                )));
            }
        }

        let details = serde_json::json!({
            "compose_validation": stack_validation,
            "target_host_reachable": true,
            "zfs_available": migration.options.use_zfs,
        });
        migration.steps[index]
            .details
            .insert("validation".to_string(), details);
        self.progress(migration, index, 100.0, "Validation completed").await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_snapshot_creation(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 10.0, "Analyzing data directories")
            .await?;

        let stack = self.compose.inspect(&migration.compose_stack_path).await?;
        let data_directories = stack.data_directories();
        if data_directories.is_empty() {
            migration.steps[index].skip("No data directories found");
            return Ok(StepOutcome::Skipped);
        }

        self.progress(
            migration,
            index,
            30.0,
            &format!("Creating snapshots for {} directories", data_directories.len()),
        )
        .await?;

        // Prefer real mountpoint resolution; the path-mangling convention is
        // a lossy fallback.
        let mountpoints = match self.datasets.mountpoint_map().await {
            Ok(map) => map,
            Err(e) => {
                warn!("Could not enumerate mountpoints, using path fallback: {}", e);
                HashMap::new()
            }
        };

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let snapshot_name = format!("migration_{}_{}", migration.id, stamp);
        let total = data_directories.len();
        let mut created: Vec<String> = Vec::new();

        for (i, data_dir) in data_directories.iter().enumerate() {
            check_cancelled(token)?;

            let dataset = match mountpoints.get(data_dir) {
                Some(name) => name.clone(),
                None => {
                    let fallback = data_dir.replace('/', "_");
                    let fallback = fallback.trim_matches('_');
                    match transdock_common::values::DatasetName::from_string(fallback) {
                        Ok(name) => name,
                        Err(e) => {
                            warn!("Cannot derive dataset for {}: {}", data_dir, e);
                            continue;
                        }
                    }
                }
            };

            match self.snapshots.create(&dataset, &snapshot_name, false).await {
                Ok(snapshot) => {
                    let full_name = snapshot.full_name();
                    if let Err(e) = self.repository.record_snapshot(&migration.id, &full_name).await
                    {
                        warn!("Failed to record snapshot {}: {}", full_name, e);
                    }
                    created.push(full_name);
                }
                Err(e) => {
                    // Best effort per directory; the transfer step will fail
                    // loudly if nothing usable was produced.
                    warn!("Failed to create snapshot for {}: {}", data_dir, e);
                }
            }

            let progress = 30.0 + (i as f64 + 1.0) * 60.0 / total as f64;
            self.progress(
                migration,
                index,
                progress,
                &format!("Created snapshot for {}", data_dir),
            )
            .await?;
        }

        migration.add_metadata("snapshots", serde_json::json!(created));
        migration.steps[index]
            .details
            .insert("created_snapshots".to_string(), serde_json::json!(created));
        self.progress(
            migration,
            index,
            100.0,
            &format!("Created {} snapshots", created.len()),
        )
        .await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_data_transfer(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 10.0, "Preparing data transfer").await?;

        if migration.options.use_zfs
            && migration.options.transfer_method == TransferMethod::ZfsSend
        {
            self.zfs_send_transfer(migration, index, token).await?;
        } else {
            self.rsync_transfer(migration, index, token).await?;
        }
        Ok(StepOutcome::Completed)
    }

    async fn zfs_send_transfer(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<()> {
        let snapshots = migration.recorded_snapshots();
        if snapshots.is_empty() {
            let stack = self.compose.inspect(&migration.compose_stack_path).await?;
            if stack.data_directories().is_empty() {
                self.progress(migration, index, 100.0, "No data to transfer").await?;
                return Ok(());
            }
            return Err(Error::Operation(
                "no snapshots available for ZFS send".to_string(),
            ));
        }

        self.progress(
            migration,
            index,
            20.0,
            &format!("Transferring {} snapshots via ZFS send", snapshots.len()),
        )
        .await?;

        let target = migration.target_host.clone();
        let ssh_config = SshConfig::from_host(&target);
        let base = migration.target_base_path.trim_matches('/').to_string();
        let total = snapshots.len();

        for (i, full_name) in snapshots.iter().enumerate() {
            check_cancelled(token)?;

            let (dataset_part, _) = full_name
                .rsplit_once('@')
                .ok_or_else(|| Error::Parse(format!("bad snapshot name: {}", full_name)))?;
            let leaf = dataset_part.rsplit('/').next().unwrap_or(dataset_part);
            let target_dataset = format!("{}/{}", base, leaf);

            if self.config.require_dry_run_before_transfer {
                let dry = self
                    .executor
                    .execute_zfs("send", &["-n", "-v", full_name])
                    .await?;
                if !dry.success {
                    return Err(Error::Operation(format!(
                        "dry-run send of {} failed: {}",
                        full_name, dry.stderr
                    )));
                }
            }

            self.snapshots
                .send(
                    full_name,
                    &target.hostname,
                    &target_dataset,
                    &ssh_config,
                    self.config.auto_accept_hostkeys,
                )
                .await
                .map_err(|e| {
                    Error::Operation(format!("failed to transfer snapshot {}: {}", full_name, e))
                })?;

            let progress = 20.0 + (i as f64 + 1.0) * 70.0 / total as f64;
            self.progress(
                migration,
                index,
                progress,
                &format!("Transferred snapshot {}", full_name),
            )
            .await?;
        }

        self.progress(migration, index, 100.0, "ZFS send transfer completed")
            .await?;
        Ok(())
    }

    async fn rsync_transfer(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<()> {
        let stack = self.compose.inspect(&migration.compose_stack_path).await?;
        let data_directories = stack.data_directories();
        if data_directories.is_empty() {
            self.progress(migration, index, 100.0, "No data to transfer").await?;
            return Ok(());
        }

        self.progress(
            migration,
            index,
            20.0,
            &format!("Transferring {} directories via rsync", data_directories.len()),
        )
        .await?;

        let target = migration.target_host.clone();
        let total = data_directories.len();

        for (i, data_dir) in data_directories.iter().enumerate() {
            check_cancelled(token)?;

            let source = format!("{}/", data_dir);
            let target_path = mapped_target_path(&migration.target_base_path, data_dir);
            let result = if target.is_localhost() {
                self.executor
                    .execute_system("rsync", &["-az", "--delete", &source, &target_path])
                    .await?
            } else {
                let ssh_option = format!("ssh -p {} -o BatchMode=yes", target.port);
                let destination =
                    format!("{}@{}:{}", target.username, target.hostname, target_path);
                self.executor
                    .execute_system(
                        "rsync",
                        &["-az", "--delete", "-e", &ssh_option, &source, &destination],
                    )
                    .await?
            };

            if !result.success {
                return Err(Error::Operation(format!(
                    "failed to transfer directory {}: {}",
                    data_dir, result.stderr
                )));
            }

            let progress = 20.0 + (i as f64 + 1.0) * 70.0 / total as f64;
            self.progress(
                migration,
                index,
                progress,
                &format!("Transferred directory {}", data_dir),
            )
            .await?;
        }

        self.progress(migration, index, 100.0, "Rsync transfer completed").await?;
        Ok(())
    }

    async fn step_container_recreation(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 10.0, "Stopping source containers")
            .await?;

        let source_host = if migration.source_host.is_localhost() {
            None
        } else {
            Some(migration.source_host.clone())
        };
        self.compose
            .stop(&migration.compose_stack_path, source_host.as_ref())
            .await?;

        check_cancelled(token)?;
        self.progress(migration, index, 40.0, "Rewriting compose content for target")
            .await?;

        let stack = self.compose.inspect(&migration.compose_stack_path).await?;
        let (compose_content, env_content) = self
            .compose
            .read_compose_content(&migration.compose_stack_path)
            .await?;

        // Rewrite source-side bind paths to their target-side locations.
        let mut rewritten = compose_content.clone();
        for data_dir in stack.data_directories() {
            let target_path = mapped_target_path(&migration.target_base_path, &data_dir);
            rewritten = rewritten.replace(&data_dir, &target_path);
        }

        self.repository
            .store_compose_content(
                &migration.id,
                &rewritten,
                env_content.as_deref(),
                Some(&stack.name),
            )
            .await?;

        check_cancelled(token)?;
        self.progress(migration, index, 70.0, "Placing compose file on target")
            .await?;

        let target = migration.target_host.clone();
        let target_compose_path = target_compose_file(migration, &stack.name);
        let ssh_config = SshConfig::from_host(&target);
        self.executor
            .write_file(
                &target.hostname,
                &target_compose_path,
                &rewritten,
                &ssh_config,
                self.config.auto_accept_hostkeys,
            )
            .await?;
        if let Some(env) = &env_content {
            let env_target = format!(
                "{}/{}/.env",
                migration.target_base_path.trim_end_matches('/'),
                stack.name
            );
            self.executor
                .write_file(&target.hostname, &env_target, env, &ssh_config, self.config.auto_accept_hostkeys)
                .await?;
        }

        migration.add_metadata("target_compose_path", serde_json::json!(target_compose_path));
        migration.add_metadata("stack_name", serde_json::json!(stack.name));
        self.progress(migration, index, 100.0, "Container recreation prepared")
            .await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_service_start(
        &self,
        migration: &mut Migration,
        index: usize,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 20.0, "Starting services on target host")
            .await?;

        let target_compose_path = self.target_compose_path(migration);
        let target = migration.target_host.clone();
        let host = if target.is_localhost() { None } else { Some(&target) };
        self.compose.start(&target_compose_path, host).await?;

        self.progress(migration, index, 100.0, "Services started").await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_verification(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 10.0, "Verifying service health").await?;

        let target_compose_path = self.target_compose_path(migration);
        let target = migration.target_host.clone();
        let started = std::time::Instant::now();

        loop {
            check_cancelled(token)?;

            let host = if target.is_localhost() { None } else { Some(&target) };
            let statuses = self.compose.status(&target_compose_path, host).await?;
            let all_running =
                !statuses.is_empty() && statuses.iter().all(|s| s.state == "running");

            if all_running || statuses.is_empty() {
                migration.steps[index].details.insert(
                    "services".to_string(),
                    serde_json::json!(statuses
                        .iter()
                        .map(|s| (s.name.clone(), s.state.clone()))
                        .collect::<HashMap<_, _>>()),
                );
                break;
            }

            if started.elapsed() > VERIFY_TIMEOUT {
                let pending: Vec<String> = statuses
                    .iter()
                    .filter(|s| s.state != "running")
                    .map(|s| format!("{}={}", s.name, s.state))
                    .collect();
                return Err(Error::Timeout(format!(
                    "services did not reach running state: {}",
                    pending.join(", ")
                )));
            }

            let progress =
                10.0 + (started.elapsed().as_secs_f64() / VERIFY_TIMEOUT.as_secs_f64()) * 85.0;
            self.progress(migration, index, progress.min(95.0), "Waiting for services")
                .await?;

            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled("verification".to_string())),
                _ = tokio::time::sleep(VERIFY_POLL_INTERVAL) => {}
            }
        }

        self.progress(migration, index, 100.0, "Verification completed").await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_cleanup(
        &self,
        migration: &mut Migration,
        index: usize,
        token: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.progress(migration, index, 20.0, "Cleaning up migration snapshots")
            .await?;

        let snapshots = migration.recorded_snapshots();
        let total = snapshots.len().max(1);

        for (i, full_name) in snapshots.iter().enumerate() {
            check_cancelled(token)?;

            let parsed = full_name.rsplit_once('@').and_then(|(dataset, snap)| {
                transdock_common::values::DatasetName::from_string(dataset)
                    .ok()
                    .map(|d| (d, snap.to_string()))
            });
            match parsed {
                Some((dataset, snap)) => {
                    match self.snapshots.destroy(&dataset, &snap, true, false).await {
                        Ok(()) => {
                            if let Err(e) = self
                                .repository
                                .mark_snapshot_deleted(&migration.id, full_name)
                                .await
                            {
                                warn!("Failed to mark snapshot deleted {}: {}", full_name, e);
                            }
                        }
                        Err(e) => warn!("Failed to cleanup snapshot {}: {}", full_name, e),
                    }
                }
                None => warn!("Skipping malformed snapshot name {}", full_name),
            }

            let progress = 20.0 + (i as f64 + 1.0) * 75.0 / total as f64;
            self.progress(migration, index, progress, &format!("Removed {}", full_name))
                .await?;
        }

        self.progress(migration, index, 100.0, "Cleanup completed").await?;
        Ok(StepOutcome::Completed)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn target_compose_path(&self, migration: &Migration) -> String {
        migration
            .get_metadata("target_compose_path")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                let stack_name = migration
                    .get_metadata("stack_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("stack");
                target_compose_file(migration, stack_name)
            })
    }

    async fn progress(
        &self,
        migration: &mut Migration,
        index: usize,
        percentage: f64,
        message: &str,
    ) -> Result<()> {
        migration.steps[index].update_progress(percentage, Some(message));
        self.persist(migration).await
    }

    /// Persist first, then publish; events are ordered with respect to the
    /// state that produced them.
    async fn persist(&self, migration: &Migration) -> Result<()> {
        self.repository.update(migration).await?;

        let current = migration.current_step();
        self.broadcaster.emit_migration_progress(
            &migration.id,
            migration.progress_percentage(),
            &migration.status.to_string(),
            serde_json::json!({
                "current_step": current.map(|s| s.name.clone()),
                "step_progress": current.map(|s| s.progress_percentage),
            }),
        );
        Ok(())
    }

    /// After a cancel, reload the persisted state, fail the running step
    /// with a cancelled marker and mark the migration cancelled.
    async fn finalize_cancelled(&self, migration_id: &str) {
        let migration = match self.repository.find_by_id(migration_id).await {
            Ok(Some(migration)) => migration,
            _ => return,
        };
        let mut migration = migration;

        if let Some(index) = migration.steps.iter().position(|s| s.is_running()) {
            migration.steps[index]
                .details
                .insert("error_kind".to_string(), serde_json::json!("CANCELLED"));
            migration.steps[index].fail("migration cancelled");
        }
        migration.cancel();

        if let Err(e) = self.repository.update(&migration).await {
            error!("Failed to persist cancelled migration {}: {}", migration_id, e);
        }
        info!("Migration cancelled: {} (ID: {})", migration.name, migration_id);
    }

    async fn finalize_timed_out(&self, migration_id: &str) {
        let migration = match self.repository.find_by_id(migration_id).await {
            Ok(Some(migration)) => migration,
            _ => return,
        };
        let mut migration = migration;

        let message = format!(
            "migration exceeded the global timeout of {} hours",
            self.config.max_migration_timeout_hours
        );
        if let Some(index) = migration.steps.iter().position(|s| s.is_running()) {
            migration.steps[index]
                .details
                .insert("error_kind".to_string(), serde_json::json!("TIMEOUT"));
            migration.steps[index].fail(message.clone());
        }
        migration.fail(message);

        if let Err(e) = self.repository.update(&migration).await {
            error!("Failed to persist timed out migration {}: {}", migration_id, e);
        }
    }

    async fn emit_final(&self, migration_id: &str, event_type: EventType) {
        if let Ok(Some(migration)) = self.repository.find_by_id(migration_id).await {
            self.broadcaster.emit(
                event_type,
                serde_json::json!({
                    "migration_id": migration.id,
                    "name": migration.name,
                    "status": migration.status.to_string(),
                    "progress": migration.progress_percentage(),
                    "error": migration.error_message,
                }),
                None,
            );
        }
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled("migration worker".to_string()))
    } else {
        Ok(())
    }
}

/// Migration status mirrored from the step that is starting.
fn status_for_step(step_type: MigrationStepType) -> Option<MigrationStatus> {
    match step_type {
        MigrationStepType::Validation => Some(MigrationStatus::Preparing),
        MigrationStepType::SnapshotCreation => Some(MigrationStatus::CreatingSnapshots),
        MigrationStepType::DataTransfer => Some(MigrationStatus::TransferringData),
        MigrationStepType::ContainerRecreation => Some(MigrationStatus::RecreatingContainers),
        MigrationStepType::ServiceStart => Some(MigrationStatus::StartingServices),
        MigrationStepType::Verification => Some(MigrationStatus::Verifying),
        MigrationStepType::Cleanup => None,
    }
}

/// Source path mapped under the target base path.
fn mapped_target_path(target_base_path: &str, source_dir: &str) -> String {
    format!("{}{}", target_base_path.trim_end_matches('/'), source_dir)
}

fn target_compose_file(migration: &Migration, stack_name: &str) -> String {
    format!(
        "{}/{}/docker-compose.yml",
        migration.target_base_path.trim_end_matches('/'),
        stack_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_step_mapping() {
        assert_eq!(
            status_for_step(MigrationStepType::Validation),
            Some(MigrationStatus::Preparing)
        );
        assert_eq!(
            status_for_step(MigrationStepType::DataTransfer),
            Some(MigrationStatus::TransferringData)
        );
        assert_eq!(status_for_step(MigrationStepType::Cleanup), None);
    }

    #[test]
    fn test_mapped_target_path() {
        assert_eq!(
            mapped_target_path("/opt/docker", "/srv/app/pgdata"),
            "/opt/docker/srv/app/pgdata"
        );
        assert_eq!(
            mapped_target_path("/opt/docker/", "/srv/app/pgdata"),
            "/opt/docker/srv/app/pgdata"
        );
    }
}
