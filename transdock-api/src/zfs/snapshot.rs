//! ZFS snapshot operations
//!
//! Covers snapshot lifecycle, incremental bookmarks, retention policy and
//! send/receive replication to a target host.

use crate::executor::CommandExecutor;
use crate::validation;
use crate::zfs::{command_error, split_row};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use transdock_common::values::{DatasetName, SizeValue, SshConfig};
use transdock_common::{Error, Result};

/// A ZFS snapshot as reported by `zfs list -t snapshot`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub dataset: DatasetName,
    pub creation_time: DateTime<Utc>,
    pub used: SizeValue,
    pub referenced: SizeValue,
    pub clones: Vec<String>,
}

impl Snapshot {
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }

    pub fn has_clones(&self) -> bool {
        !self.clones.is_empty()
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.creation_time).num_days()
    }
}

/// Outcome of a retention policy run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub dataset: String,
    pub retention_days: i64,
    pub total_snapshots: usize,
    pub to_delete: usize,
    pub to_keep: usize,
    pub deleted_count: usize,
    pub deleted: Vec<String>,
    pub failed_deletions: Vec<FailedDeletion>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDeletion {
    pub snapshot: String,
    pub error: String,
}

const SNAPSHOT_COLUMNS: &str = "name,used,referenced,creation,clones";

/// Service for snapshot-level ZFS operations.
pub struct SnapshotService {
    executor: Arc<dyn CommandExecutor>,
}

impl SnapshotService {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Create a snapshot; AlreadyExists when the name is taken.
    pub async fn create(
        &self,
        dataset: &DatasetName,
        snapshot_name: &str,
        recursive: bool,
    ) -> Result<Snapshot> {
        let full_name = self.validated_full_name(dataset, snapshot_name)?;

        if self.exists(&full_name).await? {
            return Err(Error::AlreadyExists(full_name));
        }

        let mut args = Vec::new();
        if recursive {
            args.push("-r");
        }
        args.push(full_name.as_str());

        info!("Creating snapshot: {}", full_name);
        let result = self.executor.execute_zfs("snapshot", &args).await?;
        if !result.success {
            return Err(command_error(&result, "create snapshot", &full_name));
        }

        self.get(dataset, snapshot_name).await
    }

    /// Fetch one snapshot.
    pub async fn get(&self, dataset: &DatasetName, snapshot_name: &str) -> Result<Snapshot> {
        let full_name = self.validated_full_name(dataset, snapshot_name)?;

        let result = self
            .executor
            .execute_zfs(
                "list",
                &["-H", "-t", "snapshot", "-o", SNAPSHOT_COLUMNS, &full_name],
            )
            .await?;
        if !result.success {
            return Err(command_error(&result, "get snapshot", &full_name));
        }

        let line = result
            .stdout
            .lines()
            .next()
            .ok_or_else(|| Error::Parse(format!("empty snapshot info output for {}", full_name)))?;
        parse_snapshot_row(line)
    }

    /// List snapshots, optionally scoped to one dataset.
    pub async fn list(&self, dataset: Option<&DatasetName>, recursive: bool) -> Result<Vec<Snapshot>> {
        let mut args = vec!["-H", "-t", "snapshot", "-o", SNAPSHOT_COLUMNS];
        if recursive {
            args.push("-r");
        }
        let dataset_str;
        if let Some(dataset) = dataset {
            dataset_str = dataset.to_string();
            validation::validate_dataset_name(&dataset_str)?;
            args.push(&dataset_str);
        }

        let result = self.executor.execute_zfs("list", &args).await?;
        if !result.success {
            // Listing a dataset with no snapshots exits nonzero on some
            // platforms with an empty-but-benign message.
            if result.stderr.to_lowercase().contains("no datasets available") {
                return Ok(Vec::new());
            }
            return Err(command_error(
                &result,
                "list snapshots for",
                dataset.map(|d| d.to_string()).as_deref().unwrap_or("all"),
            ));
        }

        let mut snapshots = Vec::new();
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_snapshot_row(line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping unparseable snapshot row: {} ({})", line, e),
            }
        }
        Ok(snapshots)
    }

    /// Destroy a snapshot; NotFound when absent.
    pub async fn destroy(
        &self,
        dataset: &DatasetName,
        snapshot_name: &str,
        force: bool,
        recursive: bool,
    ) -> Result<()> {
        let full_name = self.validated_full_name(dataset, snapshot_name)?;

        if !self.exists(&full_name).await? {
            return Err(Error::NotFound(full_name));
        }

        let mut args = Vec::new();
        if force {
            args.push("-f");
        }
        if recursive {
            args.push("-r");
        }
        args.push(full_name.as_str());

        info!(
            "Destroying snapshot: {} (force={}, recursive={})",
            full_name, force, recursive
        );
        let result = self.executor.execute_zfs("destroy", &args).await?;
        if !result.success {
            return Err(command_error(&result, "destroy snapshot", &full_name));
        }
        Ok(())
    }

    /// Roll a dataset back to a snapshot.
    pub async fn rollback(
        &self,
        dataset: &DatasetName,
        snapshot_name: &str,
        force: bool,
    ) -> Result<()> {
        let full_name = self.validated_full_name(dataset, snapshot_name)?;

        if !self.exists(&full_name).await? {
            return Err(Error::NotFound(full_name));
        }

        let mut args = Vec::new();
        if force {
            args.push("-f");
        }
        args.push(full_name.as_str());

        info!("Rolling back to snapshot: {}", full_name);
        let result = self.executor.execute_zfs("rollback", &args).await?;
        if !result.success {
            return Err(command_error(&result, "rollback to", &full_name));
        }
        Ok(())
    }

    /// Create a new snapshot and bookmark its base for future incremental
    /// sends. Bookmark failure is logged, not fatal.
    pub async fn create_incremental(
        &self,
        dataset: &DatasetName,
        base_snapshot: &str,
        new_snapshot: &str,
    ) -> Result<Snapshot> {
        let base_full = self.validated_full_name(dataset, base_snapshot)?;
        self.validated_full_name(dataset, new_snapshot)?;

        if !self.exists(&base_full).await? {
            return Err(Error::NotFound(base_full));
        }

        let created = self.create(dataset, new_snapshot, false).await?;

        let bookmark = format!("{}#{}_bookmark", dataset, base_snapshot);
        let result = self
            .executor
            .execute_zfs("bookmark", &[&base_full, &bookmark])
            .await?;
        if !result.success {
            warn!(
                "Failed to create bookmark {} for incremental base: {}",
                bookmark, result.stderr
            );
        }

        Ok(created)
    }

    /// Delete snapshots older than the retention window. Snapshots with
    /// clones are kept with a warning. `dry_run` reports without deleting.
    pub async fn apply_retention(
        &self,
        dataset: &DatasetName,
        retention_days: i64,
        dry_run: bool,
    ) -> Result<RetentionReport> {
        info!(
            "Applying retention policy to {} (days={}, dry_run={})",
            dataset, retention_days, dry_run
        );

        let snapshots = self.list(Some(dataset), false).await?;
        let cutoff = Utc::now() - Duration::days(retention_days);

        let mut to_delete = Vec::new();
        let mut kept = 0usize;
        for snapshot in &snapshots {
            if snapshot.creation_time < cutoff {
                if snapshot.has_clones() {
                    warn!(
                        "Snapshot {} has clones, skipping deletion",
                        snapshot.full_name()
                    );
                    kept += 1;
                } else {
                    to_delete.push(snapshot.clone());
                }
            } else {
                kept += 1;
            }
        }

        let mut deleted = Vec::new();
        let mut failed_deletions = Vec::new();
        if !dry_run {
            for snapshot in &to_delete {
                match self.destroy(&snapshot.dataset, &snapshot.name, true, false).await {
                    Ok(()) => deleted.push(snapshot.full_name()),
                    Err(e) => failed_deletions.push(FailedDeletion {
                        snapshot: snapshot.full_name(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        Ok(RetentionReport {
            dataset: dataset.to_string(),
            retention_days,
            total_snapshots: snapshots.len(),
            to_delete: to_delete.len(),
            to_keep: kept,
            deleted_count: deleted.len(),
            deleted,
            failed_deletions,
            dry_run,
        })
    }

    /// Stream a snapshot to a dataset on the target host via
    /// `zfs send | ssh … zfs receive -F`.
    pub async fn send(
        &self,
        snapshot_full_name: &str,
        target_host: &str,
        target_dataset: &str,
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<()> {
        validation::validate_snapshot_name(snapshot_full_name)?;
        validation::validate_dataset_name(target_dataset)?;
        validation::validate_hostname(target_host)?;

        info!(
            "Sending snapshot {} to {}:{}",
            snapshot_full_name, target_host, target_dataset
        );

        let result = self
            .executor
            .pipe_to_remote(
                target_host,
                &["zfs", "send", snapshot_full_name],
                &["zfs", "receive", "-F", target_dataset],
                ssh_config,
                auto_accept_hostkey,
            )
            .await?;

        if !result.success {
            return Err(Error::Operation(format!(
                "zfs send of {} to {}:{} failed: {}",
                snapshot_full_name, target_host, target_dataset, result.stderr
            )));
        }
        Ok(())
    }

    /// Space efficiency metrics for one snapshot.
    pub async fn space_efficiency(
        &self,
        dataset: &DatasetName,
        snapshot_name: &str,
    ) -> Result<serde_json::Value> {
        let snapshot = self.get(dataset, snapshot_name).await?;

        let efficiency = if snapshot.referenced.bytes() > 0 {
            (1.0 - snapshot.used.bytes() as f64 / snapshot.referenced.bytes() as f64) * 100.0
        } else {
            0.0
        };

        let compress_ratio = self.ratio_property(dataset, "compressratio").await;
        let dedup_ratio = self.ratio_property(dataset, "dedup").await;

        Ok(serde_json::json!({
            "snapshot_name": snapshot.full_name(),
            "used_bytes": snapshot.used.bytes(),
            "referenced_bytes": snapshot.referenced.bytes(),
            "space_efficiency_percent": efficiency,
            "compression_ratio": compress_ratio,
            "deduplication_ratio": dedup_ratio,
        }))
    }

    async fn ratio_property(&self, dataset: &DatasetName, property: &str) -> f64 {
        let dataset_str = dataset.to_string();
        let result = self
            .executor
            .execute_zfs("get", &["-H", "-o", "value", property, &dataset_str])
            .await;

        match result {
            Ok(r) if r.success => {
                let value = r.stdout.trim();
                value
                    .strip_suffix('x')
                    .unwrap_or(value)
                    .parse()
                    .unwrap_or(1.0)
            }
            _ => 1.0,
        }
    }

    async fn exists(&self, full_name: &str) -> Result<bool> {
        let result = self
            .executor
            .execute_zfs("list", &["-H", "-t", "snapshot", "-o", "name", full_name])
            .await?;
        Ok(result.success)
    }

    fn validated_full_name(&self, dataset: &DatasetName, snapshot_name: &str) -> Result<String> {
        let dataset_str = dataset.to_string();
        validation::validate_dataset_name(&dataset_str)?;
        validation::validate_snapshot_suffix(snapshot_name)?;
        Ok(format!("{}@{}", dataset_str, snapshot_name))
    }
}

fn parse_snapshot_row(line: &str) -> Result<Snapshot> {
    let parts = split_row(line, 5)?;

    let (dataset_str, snapshot_name) = parts[0]
        .rsplit_once('@')
        .ok_or_else(|| Error::Parse(format!("snapshot name missing '@': {}", parts[0])))?;
    let dataset = DatasetName::from_string(dataset_str)?;

    let used = SizeValue::from_zfs_string(parts[1])?;
    let referenced = SizeValue::from_zfs_string(parts[2])?;

    let creation_time = if parts[3] == "-" {
        Utc::now()
    } else {
        let epoch: i64 = parts[3]
            .trim()
            .parse()
            .map_err(|_| Error::Parse(format!("invalid creation timestamp: {}", parts[3])))?;
        Utc.timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| Error::Parse(format!("creation timestamp out of range: {}", epoch)))?
    };

    let clones = if parts[4] == "-" {
        Vec::new()
    } else {
        parts[4]
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };

    Ok(Snapshot {
        name: snapshot_name.to_string(),
        dataset,
        creation_time,
        used,
        referenced,
        clones,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_row() {
        let row = "tank/data@daily-1\t12M\t1.5G\t1754006400\t-";
        let snapshot = parse_snapshot_row(row).unwrap();
        assert_eq!(snapshot.name, "daily-1");
        assert_eq!(snapshot.dataset.to_string(), "tank/data");
        assert_eq!(snapshot.full_name(), "tank/data@daily-1");
        assert_eq!(snapshot.used.bytes(), 12 * 1024 * 1024);
        assert_eq!(snapshot.creation_time.timestamp(), 1_754_006_400);
        assert!(!snapshot.has_clones());
    }

    #[test]
    fn test_parse_snapshot_row_with_clones() {
        let row = "tank/data@base\t0\t1G\t1754006400\ttank/clone1, tank/clone2";
        let snapshot = parse_snapshot_row(row).unwrap();
        assert_eq!(snapshot.clones, vec!["tank/clone1", "tank/clone2"]);
        assert!(snapshot.has_clones());
    }

    #[test]
    fn test_parse_snapshot_row_rejects_bad_rows() {
        assert!(parse_snapshot_row("tank/data\t12M\t1G\t0\t-").is_err()); // no @
        assert!(parse_snapshot_row("tank/data@s\t12M\t1G").is_err()); // short
        assert!(parse_snapshot_row("tank/data@s\t12M\t1G\tnotanumber\t-").is_err());
    }

    #[test]
    fn test_snapshot_age() {
        let snapshot = Snapshot {
            name: "old".to_string(),
            dataset: DatasetName::from_string("tank").unwrap(),
            creation_time: Utc::now() - Duration::days(40),
            used: SizeValue::from_bytes(0),
            referenced: SizeValue::from_bytes(0),
            clones: Vec::new(),
        };
        assert_eq!(snapshot.age_days(Utc::now()), 40);
    }
}
