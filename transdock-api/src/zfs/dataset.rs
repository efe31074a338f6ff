//! ZFS dataset operations

use crate::executor::CommandExecutor;
use crate::validation;
use crate::zfs::{command_error, split_row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use transdock_common::values::{DatasetName, SizeValue};
use transdock_common::{Error, Result};

/// A ZFS dataset as reported by `zfs list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: DatasetName,
    pub used: SizeValue,
    pub available: SizeValue,
    pub referenced: SizeValue,
    pub compression: String,
    pub checksum: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Space accounting for a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetUsage {
    pub name: String,
    pub used: SizeValue,
    pub available: SizeValue,
    pub referenced: SizeValue,
    pub logical_used: SizeValue,
    pub logical_referenced: SizeValue,
    pub quota: SizeValue,
    pub reservation: SizeValue,
    pub compress_ratio: String,
    pub dedup: String,
}

/// Raw I/O counters sampled from kstat or pool iostat
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Deltas and rates over a sampling window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub dataset: String,
    pub duration_seconds: f64,
    pub first_sample: IoStats,
    pub last_sample: IoStats,
    pub read_ops_per_second: f64,
    pub write_ops_per_second: f64,
    pub read_bandwidth_bytes_per_second: f64,
    pub write_bandwidth_bytes_per_second: f64,
}

/// Service for dataset-level ZFS operations.
pub struct DatasetService {
    executor: Arc<dyn CommandExecutor>,
}

const LIST_COLUMNS: &str = "name,used,avail,refer,compression,checksum";
const USAGE_COLUMNS: &str =
    "name,used,available,referenced,logicalused,logicalreferenced,quota,reservation,compressratio,dedup";

impl DatasetService {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Fetch one dataset, enriched with its full property map.
    pub async fn get(&self, name: &DatasetName) -> Result<Dataset> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        let result = self
            .executor
            .execute_zfs("list", &["-H", "-o", LIST_COLUMNS, &name_str])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get dataset", &name_str));
        }

        let line = result
            .stdout
            .lines()
            .next()
            .ok_or_else(|| Error::Parse(format!("empty dataset info output for {}", name_str)))?;
        let mut dataset = parse_dataset_row(line)?;

        dataset.properties = self.get_properties(&name_str).await?;
        Ok(dataset)
    }

    /// List datasets, optionally restricted to one pool subtree.
    pub async fn list(&self, pool: Option<&str>) -> Result<Vec<Dataset>> {
        let mut args = vec!["-H", "-o", LIST_COLUMNS];
        if let Some(pool) = pool {
            validation::validate_dataset_name(pool)?;
            args.push("-r");
            args.push(pool);
        }

        let result = self.executor.execute_zfs("list", &args).await?;
        if !result.success {
            return Err(command_error(
                &result,
                "list datasets",
                pool.unwrap_or("all"),
            ));
        }

        let mut datasets = Vec::new();
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_dataset_row(line) {
                Ok(dataset) => datasets.push(dataset),
                Err(e) => warn!("Skipping unparseable dataset row: {} ({})", line, e),
            }
        }
        Ok(datasets)
    }

    /// Create a dataset with optional properties; AlreadyExists on conflict.
    pub async fn create(
        &self,
        name: &DatasetName,
        properties: &HashMap<String, String>,
    ) -> Result<Dataset> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        if self.exists(&name_str).await? {
            return Err(Error::AlreadyExists(name_str));
        }

        let mut prop_args: Vec<String> = Vec::new();
        for (key, value) in properties {
            validation::validate_zfs_property(key, value)?;
            prop_args.push("-o".to_string());
            prop_args.push(format!("{}={}", key, value));
        }

        let mut args: Vec<&str> = prop_args.iter().map(|s| s.as_str()).collect();
        args.push(&name_str);

        info!("Creating dataset: {}", name_str);
        let result = self.executor.execute_zfs("create", &args).await?;
        if !result.success {
            return Err(command_error(&result, "create dataset", &name_str));
        }

        self.get(name).await
    }

    /// Destroy a dataset; NotFound when absent.
    pub async fn destroy(&self, name: &DatasetName, force: bool, recursive: bool) -> Result<()> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        if !self.exists(&name_str).await? {
            return Err(Error::NotFound(name_str));
        }

        let mut args = Vec::new();
        if force {
            args.push("-f");
        }
        if recursive {
            args.push("-r");
        }
        args.push(name_str.as_str());

        info!(
            "Destroying dataset: {} (force={}, recursive={})",
            name_str, force, recursive
        );
        let result = self.executor.execute_zfs("destroy", &args).await?;
        if !result.success {
            return Err(command_error(&result, "destroy dataset", &name_str));
        }
        Ok(())
    }

    /// Validate and set one property.
    pub async fn set_property(&self, name: &DatasetName, key: &str, value: &str) -> Result<()> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;
        validation::validate_zfs_property(key, value)?;

        let assignment = format!("{}={}", key, value);
        info!("Setting {} on {}", assignment, name_str);
        let result = self
            .executor
            .execute_zfs("set", &[&assignment, &name_str])
            .await?;
        if !result.success {
            return Err(command_error(&result, "set property on", &name_str));
        }
        Ok(())
    }

    pub async fn mount(&self, name: &DatasetName) -> Result<()> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        let result = self.executor.execute_zfs("mount", &[&name_str]).await?;
        if !result.success {
            return Err(command_error(&result, "mount", &name_str));
        }
        Ok(())
    }

    pub async fn unmount(&self, name: &DatasetName, force: bool) -> Result<()> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        let mut args = Vec::new();
        if force {
            args.push("-f");
        }
        args.push(name_str.as_str());

        let result = self.executor.execute_zfs("unmount", &args).await?;
        if !result.success {
            return Err(command_error(&result, "unmount", &name_str));
        }
        Ok(())
    }

    /// Full space accounting for one dataset.
    pub async fn get_usage(&self, name: &DatasetName) -> Result<DatasetUsage> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        let result = self
            .executor
            .execute_zfs("list", &["-H", "-o", USAGE_COLUMNS, &name_str])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get usage for", &name_str));
        }

        let line = result
            .stdout
            .lines()
            .next()
            .ok_or_else(|| Error::Parse(format!("empty usage output for {}", name_str)))?;
        parse_usage_row(line)
    }

    /// Map mounted datasets to their mountpoints, for path-to-dataset
    /// resolution during snapshot planning.
    pub async fn mountpoint_map(&self) -> Result<HashMap<String, DatasetName>> {
        let result = self
            .executor
            .execute_zfs("list", &["-H", "-o", "mountpoint,name"])
            .await?;
        if !result.success {
            return Err(command_error(&result, "list mountpoints", "all"));
        }

        let mut map = HashMap::new();
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 2 {
                warn!("Skipping unparseable mountpoint row: {}", line);
                continue;
            }
            let mountpoint = parts[0];
            if !mountpoint.starts_with('/') {
                continue; // "legacy", "none", "-"
            }
            match DatasetName::from_string(parts[1]) {
                Ok(name) => {
                    map.insert(mountpoint.to_string(), name);
                }
                Err(e) => warn!("Skipping dataset with odd name {}: {}", parts[1], e),
            }
        }
        Ok(map)
    }

    /// Sample I/O counters before and after a sleep and report deltas.
    pub async fn monitor_performance(
        &self,
        name: &DatasetName,
        duration_secs: u64,
    ) -> Result<PerformanceReport> {
        let name_str = name.to_string();
        validation::validate_dataset_name(&name_str)?;

        info!(
            "Monitoring dataset performance: {} ({}s)",
            name_str, duration_secs
        );

        let first_sample = self.sample_iostats(name).await?;
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_secs(duration_secs)).await;
        let last_sample = self.sample_iostats(name).await?;
        let elapsed = started.elapsed().as_secs_f64().max(1.0);

        Ok(PerformanceReport {
            dataset: name_str,
            duration_seconds: elapsed,
            read_ops_per_second: last_sample.reads.saturating_sub(first_sample.reads) as f64
                / elapsed,
            write_ops_per_second: last_sample.writes.saturating_sub(first_sample.writes) as f64
                / elapsed,
            read_bandwidth_bytes_per_second: last_sample
                .read_bytes
                .saturating_sub(first_sample.read_bytes) as f64
                / elapsed,
            write_bandwidth_bytes_per_second: last_sample
                .write_bytes
                .saturating_sub(first_sample.write_bytes) as f64
                / elapsed,
            first_sample,
            last_sample,
        })
    }

    pub(crate) async fn exists(&self, name: &str) -> Result<bool> {
        let result = self
            .executor
            .execute_zfs("list", &["-H", "-o", "name", name])
            .await?;
        Ok(result.success)
    }

    async fn get_properties(&self, name: &str) -> Result<HashMap<String, String>> {
        let result = self
            .executor
            .execute_zfs("get", &["-H", "-o", "property,value", "all", name])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get properties of", name));
        }

        let mut properties = HashMap::new();
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 2 {
                properties.insert(parts[0].to_string(), parts[1].to_string());
            }
        }
        Ok(properties)
    }

    /// Per-dataset counters from the objset kstat, with a pool-level
    /// iostat fallback when the kstat path is unavailable.
    async fn sample_iostats(&self, name: &DatasetName) -> Result<IoStats> {
        let name_str = name.to_string();

        let result = self
            .executor
            .execute_zfs("list", &["-H", "-o", "name,objsetid", &name_str])
            .await?;
        if !result.success {
            return self.pool_iostats_fallback(name).await;
        }

        let objsetid = result
            .stdout
            .lines()
            .next()
            .and_then(|line| line.split('\t').nth(1))
            .map(|s| s.trim().to_string());
        let objsetid = match objsetid {
            Some(id) if !id.is_empty() && id != "-" => id,
            _ => return self.pool_iostats_fallback(name).await,
        };

        let kstat_name = format!("objset-{}", objsetid);
        let find_result = self
            .executor
            .execute_system("find", &["/proc/spl/kstat/zfs", "-name", &kstat_name])
            .await?;
        let kstat_file = find_result.stdout.lines().next().unwrap_or("").trim();
        if !find_result.success || kstat_file.is_empty() {
            return self.pool_iostats_fallback(name).await;
        }

        let cat_result = self.executor.execute_system("cat", &[kstat_file]).await?;
        if !cat_result.success {
            return self.pool_iostats_fallback(name).await;
        }

        Ok(parse_kstat(&cat_result.stdout))
    }

    async fn pool_iostats_fallback(&self, name: &DatasetName) -> Result<IoStats> {
        let pool = name.pool();
        let result = self
            .executor
            .execute_system("zpool", &["iostat", "-v", pool, "1", "1"])
            .await?;
        if !result.success {
            // Counters genuinely unavailable; zeros keep the delta math sane.
            return Ok(IoStats::default());
        }
        Ok(parse_pool_iostat(&result.stdout, pool))
    }
}

fn parse_dataset_row(line: &str) -> Result<Dataset> {
    let parts = split_row(line, 6)?;
    Ok(Dataset {
        name: DatasetName::from_string(parts[0])?,
        used: SizeValue::from_zfs_string(parts[1])?,
        available: SizeValue::from_zfs_string(parts[2])?,
        referenced: SizeValue::from_zfs_string(parts[3])?,
        compression: parts[4].to_string(),
        checksum: parts[5].to_string(),
        properties: HashMap::new(),
    })
}

fn parse_usage_row(line: &str) -> Result<DatasetUsage> {
    let parts = split_row(line, 10)?;
    Ok(DatasetUsage {
        name: parts[0].to_string(),
        used: SizeValue::from_zfs_string(parts[1])?,
        available: SizeValue::from_zfs_string(parts[2])?,
        referenced: SizeValue::from_zfs_string(parts[3])?,
        logical_used: SizeValue::from_zfs_string(parts[4])?,
        logical_referenced: SizeValue::from_zfs_string(parts[5])?,
        quota: SizeValue::from_zfs_string(parts[6])?,
        reservation: SizeValue::from_zfs_string(parts[7])?,
        compress_ratio: parts[8].to_string(),
        dedup: parts[9].to_string(),
    })
}

fn parse_kstat(output: &str) -> IoStats {
    let mut stats = IoStats::default();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let value: u64 = parts[2].parse().unwrap_or(0);
        match parts[0] {
            "reads" => stats.reads = value,
            "writes" => stats.writes = value,
            "nread" => stats.read_bytes = value,
            "nwritten" => stats.write_bytes = value,
            _ => {}
        }
    }
    stats
}

fn parse_pool_iostat(output: &str, pool: &str) -> IoStats {
    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with(pool) {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() >= 7 {
            return IoStats {
                reads: parse_count(parts[3]),
                writes: parse_count(parts[4]),
                read_bytes: parse_bandwidth(parts[5]),
                write_bytes: parse_bandwidth(parts[6]),
            };
        }
    }
    IoStats::default()
}

fn parse_count(value: &str) -> u64 {
    value.parse::<f64>().map(|v| v as u64).unwrap_or(0)
}

/// Parse a bandwidth cell such as `1.2M` or `500K` into bytes.
fn parse_bandwidth(value: &str) -> u64 {
    let value = value.trim();
    if value.is_empty() || value == "-" {
        return 0;
    }
    let upper = value.to_uppercase();
    let (number, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1024u64),
        Some('M') => (&upper[..upper.len() - 1], 1024u64.pow(2)),
        Some('G') => (&upper[..upper.len() - 1], 1024u64.pow(3)),
        Some('T') => (&upper[..upper.len() - 1], 1024u64.pow(4)),
        _ => (upper.as_str(), 1),
    };
    number
        .parse::<f64>()
        .map(|v| (v * multiplier as f64) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_row() {
        let row = "tank/apps\t1.5G\t50G\t800M\tlz4\ton";
        let dataset = parse_dataset_row(row).unwrap();
        assert_eq!(dataset.name.to_string(), "tank/apps");
        assert_eq!(dataset.used.bytes(), 1_610_612_736);
        assert_eq!(dataset.compression, "lz4");
        assert_eq!(dataset.checksum, "on");
    }

    #[test]
    fn test_parse_dataset_row_unset_sizes() {
        let row = "tank\t-\t-\t-\toff\ton";
        let dataset = parse_dataset_row(row).unwrap();
        assert_eq!(dataset.used.bytes(), 0);
        assert_eq!(dataset.available.bytes(), 0);
    }

    #[test]
    fn test_parse_dataset_row_short() {
        assert!(parse_dataset_row("tank\t1G").is_err());
    }

    #[test]
    fn test_parse_usage_row() {
        let row = "tank/db\t10G\t40G\t8G\t12G\t9G\t50G\t0\t1.45x\toff";
        let usage = parse_usage_row(row).unwrap();
        assert_eq!(usage.quota.bytes(), 50 * 1024u64.pow(3));
        assert_eq!(usage.reservation.bytes(), 0);
        assert_eq!(usage.compress_ratio, "1.45x");
    }

    #[test]
    fn test_parse_kstat() {
        let output = "\
12 1 0x01 7 2160 8383114270 363878937311\n\
name                            type data\n\
writes                          4    1523\n\
nwritten                        4    104857600\n\
reads                           4    9017\n\
nread                           4    734003200\n";
        let stats = parse_kstat(output);
        assert_eq!(stats.reads, 9017);
        assert_eq!(stats.writes, 1523);
        assert_eq!(stats.read_bytes, 734_003_200);
        assert_eq!(stats.write_bytes, 104_857_600);
    }

    #[test]
    fn test_parse_pool_iostat() {
        let output = "\
              capacity     operations     bandwidth\n\
pool        alloc   free   read  write   read  write\n\
----------  -----  -----  -----  -----  -----  -----\n\
tank        10.1G  89.9G     12     34  1.2M   500K\n\
  sda       10.1G  89.9G     12     34  1.2M   500K\n";
        let stats = parse_pool_iostat(output, "tank");
        assert_eq!(stats.reads, 12);
        assert_eq!(stats.writes, 34);
        assert_eq!(stats.read_bytes, (1.2 * 1024.0 * 1024.0) as u64);
        assert_eq!(stats.write_bytes, 500 * 1024);
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("0"), 0);
        assert_eq!(parse_bandwidth("-"), 0);
        assert_eq!(parse_bandwidth("1K"), 1024);
        assert_eq!(parse_bandwidth("2.5G"), (2.5 * 1024f64.powi(3)) as u64);
        assert_eq!(parse_bandwidth("garbage"), 0);
    }
}
