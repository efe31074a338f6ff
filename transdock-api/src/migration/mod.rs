//! Migration domain entities
//!
//! The `Migration` aggregate owns its ordered `MigrationStep` list; status
//! enums are closed and round-trip through their wire strings, which the
//! repository rejects when invalid.

pub mod orchestrator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use transdock_common::values::HostConnection;
use transdock_common::{Error, Result, TransferMethod};
use uuid::Uuid;

/// Migration lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Preparing,
    CreatingSnapshots,
    TransferringData,
    RecreatingContainers,
    StartingServices,
    Verifying,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::CreatingSnapshots => "creating_snapshots",
            Self::TransferringData => "transferring_data",
            Self::RecreatingContainers => "recreating_containers",
            Self::StartingServices => "starting_services",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "preparing" => Ok(Self::Preparing),
            "creating_snapshots" => Ok(Self::CreatingSnapshots),
            "transferring_data" => Ok(Self::TransferringData),
            "recreating_containers" => Ok(Self::RecreatingContainers),
            "starting_services" => Ok(Self::StartingServices),
            "verifying" => Ok(Self::Verifying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(Error::validation(
                "status",
                format!("unknown migration status: {}", other),
            )),
        }
    }
}

/// The seven phases a migration can be composed of
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStepType {
    Validation,
    SnapshotCreation,
    DataTransfer,
    ContainerRecreation,
    ServiceStart,
    Verification,
    Cleanup,
}

impl std::fmt::Display for MigrationStepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::SnapshotCreation => "snapshot_creation",
            Self::DataTransfer => "data_transfer",
            Self::ContainerRecreation => "container_recreation",
            Self::ServiceStart => "service_start",
            Self::Verification => "verification",
            Self::Cleanup => "cleanup",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MigrationStepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "validation" => Ok(Self::Validation),
            "snapshot_creation" => Ok(Self::SnapshotCreation),
            "data_transfer" => Ok(Self::DataTransfer),
            "container_recreation" => Ok(Self::ContainerRecreation),
            "service_start" => Ok(Self::ServiceStart),
            "verification" => Ok(Self::Verification),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(Error::validation(
                "step_type",
                format!("unknown step type: {}", other),
            )),
        }
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for MigrationStepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MigrationStepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::validation(
                "step_status",
                format!("unknown step status: {}", other),
            )),
        }
    }
}

/// One phase of a migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub name: String,
    pub step_type: MigrationStepType,
    pub status: MigrationStepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_percentage: f64,
    pub details: HashMap<String, serde_json::Value>,
}

impl MigrationStep {
    pub fn new(name: impl Into<String>, step_type: MigrationStepType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            step_type,
            status: MigrationStepStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            progress_percentage: 0.0,
            details: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = MigrationStepStatus::Running;
        self.started_at = Some(Utc::now());
        self.progress_percentage = 0.0;
    }

    pub fn complete(&mut self) {
        self.status = MigrationStepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress_percentage = 100.0;
    }

    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.status = MigrationStepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error_message.into());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = MigrationStepStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.progress_percentage = 100.0;
        self.details
            .insert("skip_reason".to_string(), serde_json::json!(reason.into()));
    }

    pub fn update_progress(&mut self, percentage: f64, message: Option<&str>) {
        self.progress_percentage = percentage.clamp(0.0, 100.0);
        if let Some(message) = message {
            self.details
                .insert("progress_message".to_string(), serde_json::json!(message));
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == MigrationStepStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        self.status == MigrationStepStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == MigrationStepStatus::Failed
    }
}

/// Options fixed at migration creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub use_zfs: bool,
    pub transfer_method: TransferMethod,
    pub cleanup_on_success: bool,
    pub verify_transfer: bool,
    pub create_backup_snapshot: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            use_zfs: true,
            transfer_method: TransferMethod::ZfsSend,
            cleanup_on_success: true,
            verify_transfer: true,
            create_backup_snapshot: true,
        }
    }
}

/// The migration aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub name: String,
    pub status: MigrationStatus,
    pub source_host: HostConnection,
    pub target_host: HostConnection,
    pub compose_stack_path: String,
    pub target_base_path: String,
    pub options: MigrationOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    pub fn new(
        name: impl Into<String>,
        source_host: HostConnection,
        target_host: HostConnection,
        compose_stack_path: impl Into<String>,
        target_base_path: impl Into<String>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: MigrationStatus::Pending,
            source_host,
            target_host,
            compose_stack_path: compose_stack_path.into(),
            target_base_path: target_base_path.into(),
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata: HashMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = MigrationStatus::Preparing;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = MigrationStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.status = MigrationStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error_message.into());
    }

    pub fn cancel(&mut self) {
        self.status = MigrationStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.status, MigrationStatus::Pending) && !self.status.is_terminal()
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.is_running()
    }

    pub fn can_be_retried(&self) -> bool {
        matches!(self.status, MigrationStatus::Failed | MigrationStatus::Cancelled)
    }

    /// Mean of step progress.
    pub fn progress_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps
            .iter()
            .map(|s| s.progress_percentage)
            .sum::<f64>()
            / self.steps.len() as f64
    }

    pub fn current_step(&self) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.is_running())
    }

    pub fn failed_step(&self) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.is_failed())
    }

    pub fn completed_steps(&self) -> Vec<&MigrationStep> {
        self.steps.iter().filter(|s| s.is_completed()).collect()
    }

    pub fn pending_steps(&self) -> Vec<&MigrationStep> {
        self.steps
            .iter()
            .filter(|s| s.status == MigrationStepStatus::Pending)
            .collect()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Mean completed-step duration times pending count, plus the prorated
    /// remainder of the running step.
    pub fn estimate_remaining_secs(&self) -> Option<f64> {
        let completed = self.completed_steps();
        if completed.is_empty() || self.started_at.is_none() {
            return None;
        }

        let total: f64 = completed.iter().filter_map(|s| s.duration_secs()).sum();
        if total <= 0.0 {
            return None;
        }
        let avg = total / completed.len() as f64;
        let remaining = self.pending_steps().len() as f64 * avg;

        if let Some(current) = self.current_step() {
            if current.progress_percentage > 0.0 {
                let current_remaining = (100.0 - current.progress_percentage) / 100.0 * avg;
                return Some(remaining + current_remaining);
            }
        }
        Some(remaining)
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Snapshot names recorded by the snapshot step.
    pub fn recorded_snapshots(&self) -> Vec<String> {
        self.get_metadata("snapshots")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Status summary exposed by GET /migrations/{id}/status.
    pub fn summary(&self) -> MigrationSummary {
        MigrationSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            progress_percentage: (self.progress_percentage() * 100.0).round() / 100.0,
            source_host: self.source_host.to_string(),
            target_host: self.target_host.to_string(),
            compose_stack_path: self.compose_stack_path.clone(),
            target_base_path: self.target_base_path.clone(),
            use_zfs: self.options.use_zfs,
            transfer_method: self.options.transfer_method,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_secs: self.duration_secs(),
            steps_completed: self.completed_steps().len(),
            total_steps: self.steps.len(),
            error_message: self.error_message.clone(),
            current_step: self.current_step().map(|s| StepSummary {
                name: s.name.clone(),
                step_type: s.step_type,
                progress: s.progress_percentage,
                error: None,
            }),
            failed_step: self.failed_step().map(|s| StepSummary {
                name: s.name.clone(),
                step_type: s.step_type,
                progress: s.progress_percentage,
                error: s.error_message.clone(),
            }),
            task_running: None,
            estimated_remaining_seconds: None,
        }
    }
}

/// Condensed step info inside a summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub step_type: MigrationStepType,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wire form of a migration's status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub id: String,
    pub name: String,
    pub status: MigrationStatus,
    pub progress_percentage: f64,
    pub source_host: String,
    pub target_host: String,
    pub compose_stack_path: String,
    pub target_base_path: String,
    pub use_zfs: bool,
    pub transfer_method: TransferMethod,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub steps_completed: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
}

/// Build the deterministic step list for a migration's options.
pub fn build_steps(options: &MigrationOptions) -> Vec<MigrationStep> {
    let mut steps = Vec::new();
    steps.push(MigrationStep::new(
        "Validate Migration Prerequisites",
        MigrationStepType::Validation,
    ));
    if options.use_zfs {
        steps.push(MigrationStep::new(
            "Create ZFS Snapshots",
            MigrationStepType::SnapshotCreation,
        ));
    }
    steps.push(MigrationStep::new("Transfer Data", MigrationStepType::DataTransfer));
    steps.push(MigrationStep::new(
        "Recreate Containers",
        MigrationStepType::ContainerRecreation,
    ));
    steps.push(MigrationStep::new("Start Services", MigrationStepType::ServiceStart));
    steps.push(MigrationStep::new(
        "Verify Migration",
        MigrationStepType::Verification,
    ));
    if options.cleanup_on_success {
        steps.push(MigrationStep::new("Cleanup", MigrationStepType::Cleanup));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration_with_defaults() -> Migration {
        Migration::new(
            "m1",
            HostConnection::localhost(),
            HostConnection::new("host2", "root", 22).unwrap(),
            "/apps/app",
            "/opt/docker",
            MigrationOptions::default(),
        )
    }

    #[test]
    fn test_status_round_trip() {
        let all = [
            "pending",
            "preparing",
            "creating_snapshots",
            "transferring_data",
            "recreating_containers",
            "starting_services",
            "verifying",
            "completed",
            "failed",
            "cancelled",
            "rolling_back",
            "rolled_back",
        ];
        for s in all {
            let status = MigrationStatus::from_str(s).unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!(MigrationStatus::from_str("exploded").is_err());
    }

    #[test]
    fn test_step_type_round_trip() {
        let all = [
            "validation",
            "snapshot_creation",
            "data_transfer",
            "container_recreation",
            "service_start",
            "verification",
            "cleanup",
        ];
        for s in all {
            let step_type = MigrationStepType::from_str(s).unwrap();
            assert_eq!(step_type.to_string(), s);
        }
    }

    #[test]
    fn test_build_steps_full() {
        let steps = build_steps(&MigrationOptions::default());
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0].step_type, MigrationStepType::Validation);
        assert_eq!(steps[1].step_type, MigrationStepType::SnapshotCreation);
        assert_eq!(steps[6].step_type, MigrationStepType::Cleanup);
    }

    #[test]
    fn test_build_steps_without_zfs_and_cleanup() {
        let options = MigrationOptions {
            use_zfs: false,
            cleanup_on_success: false,
            ..Default::default()
        };
        let steps = build_steps(&options);
        assert_eq!(steps.len(), 5);
        assert!(steps
            .iter()
            .all(|s| s.step_type != MigrationStepType::SnapshotCreation));
        assert!(steps.iter().all(|s| s.step_type != MigrationStepType::Cleanup));
    }

    #[test]
    fn test_progress_is_mean_of_steps() {
        let mut migration = migration_with_defaults();
        migration.steps = build_steps(&migration.options);

        assert_eq!(migration.progress_percentage(), 0.0);

        migration.steps[0].update_progress(100.0, None);
        migration.steps[1].update_progress(50.0, None);
        let expected = 150.0 / 7.0;
        assert!((migration.progress_percentage() - expected).abs() < 0.01);

        for step in &mut migration.steps {
            step.update_progress(100.0, None);
        }
        assert!((migration.progress_percentage() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut migration = migration_with_defaults();
        assert_eq!(migration.status, MigrationStatus::Pending);
        assert!(!migration.is_running());
        assert!(!migration.can_be_cancelled());

        migration.start();
        assert_eq!(migration.status, MigrationStatus::Preparing);
        assert!(migration.is_running());
        assert!(migration.can_be_cancelled());
        assert!(migration.started_at.is_some());

        migration.complete();
        assert!(migration.status.is_terminal());
        assert!(!migration.can_be_cancelled());
        assert!(migration.started_at.unwrap() <= migration.completed_at.unwrap());
    }

    #[test]
    fn test_failed_migration_carries_error_and_step() {
        let mut migration = migration_with_defaults();
        migration.steps = build_steps(&migration.options);
        migration.start();

        migration.steps[0].start();
        migration.steps[0].fail("validation blew up");
        migration.fail("validation blew up");

        assert_eq!(migration.status, MigrationStatus::Failed);
        assert_eq!(migration.error_message.as_deref(), Some("validation blew up"));
        let summary = migration.summary();
        let failed = summary.failed_step.unwrap();
        assert_eq!(failed.step_type, MigrationStepType::Validation);
        assert_eq!(failed.error.as_deref(), Some("validation blew up"));
    }

    #[test]
    fn test_step_skip_records_reason_and_full_progress() {
        let mut step = MigrationStep::new("Create ZFS Snapshots", MigrationStepType::SnapshotCreation);
        step.start();
        step.skip("no data dirs");
        assert_eq!(step.status, MigrationStepStatus::Skipped);
        assert_eq!(step.progress_percentage, 100.0);
        assert_eq!(
            step.details.get("skip_reason").unwrap(),
            &serde_json::json!("no data dirs")
        );
    }

    #[test]
    fn test_estimate_remaining_time() {
        let mut migration = migration_with_defaults();
        migration.steps = build_steps(&migration.options);
        migration.start();

        // No completed steps yet: no estimate.
        assert!(migration.estimate_remaining_secs().is_none());

        let now = Utc::now();
        migration.steps[0].status = MigrationStepStatus::Completed;
        migration.steps[0].started_at = Some(now - chrono::Duration::seconds(20));
        migration.steps[0].completed_at = Some(now - chrono::Duration::seconds(10));
        migration.steps[0].progress_percentage = 100.0;

        // 5 pending steps (index 2..=6), one running at 50%.
        migration.steps[1].status = MigrationStepStatus::Running;
        migration.steps[1].progress_percentage = 50.0;

        let estimate = migration.estimate_remaining_secs().unwrap();
        // avg 10s, 5 pending => 50s, plus 5s for the half-done running step.
        assert!((estimate - 55.0).abs() < 0.5, "estimate was {}", estimate);
    }

    #[test]
    fn test_recorded_snapshots() {
        let mut migration = migration_with_defaults();
        assert!(migration.recorded_snapshots().is_empty());

        migration.add_metadata(
            "snapshots",
            serde_json::json!(["tank/a@m1", "tank/b@m1"]),
        );
        assert_eq!(migration.recorded_snapshots(), vec!["tank/a@m1", "tank/b@m1"]);
    }
}
