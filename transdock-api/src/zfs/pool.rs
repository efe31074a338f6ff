//! ZFS pool operations
//!
//! Wraps `zpool` subcommands and derives a health rating from pool state,
//! vdev error counters and capacity.

use crate::executor::CommandExecutor;
use crate::validation;
use crate::zfs::{command_error, split_row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use transdock_common::values::SizeValue;
use transdock_common::{Error, Result};

/// Pool state as reported by zpool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolState {
    Online,
    Offline,
    Degraded,
    Faulted,
    Removed,
    Unavail,
    Suspended,
}

impl FromStr for PoolState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            "DEGRADED" => Ok(Self::Degraded),
            "FAULTED" => Ok(Self::Faulted),
            "REMOVED" => Ok(Self::Removed),
            "UNAVAIL" => Ok(Self::Unavail),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(Error::Parse(format!("unknown pool state: {}", other))),
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Degraded => "DEGRADED",
            Self::Faulted => "FAULTED",
            Self::Removed => "REMOVED",
            Self::Unavail => "UNAVAIL",
            Self::Suspended => "SUSPENDED",
        };
        write!(f, "{}", s)
    }
}

/// Derived health rating
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolHealth {
    Healthy,
    Warning,
    Critical,
    Failed,
}

/// A virtual device inside a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VDev {
    pub name: String,
    pub state: String,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
    pub children: Vec<VDev>,
}

impl VDev {
    pub fn has_errors(&self) -> bool {
        self.read_errors > 0
            || self.write_errors > 0
            || self.checksum_errors > 0
            || self.children.iter().any(|c| c.has_errors())
    }

    pub fn total_errors(&self) -> u64 {
        self.read_errors
            + self.write_errors
            + self.checksum_errors
            + self.children.iter().map(|c| c.total_errors()).sum::<u64>()
    }
}

/// A ZFS pool as reported by `zpool list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub state: PoolState,
    pub size: SizeValue,
    pub allocated: SizeValue,
    pub free: SizeValue,
    pub fragmentation_percent: u32,
    pub dedup_ratio: f64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Pool {
    pub fn capacity_percent(&self) -> u32 {
        if self.size.bytes() == 0 {
            return 0;
        }
        ((self.allocated.bytes() as f64 / self.size.bytes() as f64) * 100.0) as u32
    }
}

/// Detailed status with vdev error counters and scrub progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub state: PoolState,
    pub vdevs: Vec<VDev>,
    pub scan: Option<String>,
    pub errors: Option<String>,
}

impl PoolStatus {
    pub fn total_errors(&self) -> u64 {
        self.vdevs.iter().map(|v| v.total_errors()).sum()
    }
}

/// Health check outcome combining status, errors and capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthReport {
    pub pool: String,
    pub state: PoolState,
    pub health: PoolHealth,
    pub capacity_percent: u32,
    pub total_errors: u64,
    pub scan: Option<String>,
    pub vdevs: Vec<VDev>,
}

const POOL_COLUMNS: &str = "name,size,alloc,free,expandsz,frag,health,dedup";

/// Service for pool-level ZFS operations.
pub struct PoolService {
    executor: Arc<dyn CommandExecutor>,
}

impl PoolService {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    pub async fn list(&self) -> Result<Vec<Pool>> {
        let result = self
            .executor
            .execute_system("zpool", &["list", "-H", "-o", POOL_COLUMNS])
            .await?;
        if !result.success {
            return Err(command_error(&result, "list pools", "all"));
        }

        let mut pools = Vec::new();
        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_pool_row(line) {
                Ok(pool) => pools.push(pool),
                Err(e) => warn!("Skipping unparseable pool row: {} ({})", line, e),
            }
        }
        Ok(pools)
    }

    pub async fn get(&self, name: &str) -> Result<Pool> {
        validation::validate_dataset_name(name)?;

        let result = self
            .executor
            .execute_system("zpool", &["list", "-H", "-o", POOL_COLUMNS, name])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get pool", name));
        }

        let line = result
            .stdout
            .lines()
            .next()
            .ok_or_else(|| Error::Parse(format!("empty pool list output for {}", name)))?;
        parse_pool_row(line)
    }

    /// Parsed `zpool status -v` with per-vdev error counters.
    pub async fn get_status(&self, name: &str) -> Result<PoolStatus> {
        validation::validate_dataset_name(name)?;

        let result = self
            .executor
            .execute_system("zpool", &["status", "-v", name])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get status of", name));
        }

        parse_pool_status(&result.stdout)
    }

    /// Map pool state, errors and capacity onto a health rating.
    pub async fn health_check(&self, name: &str) -> Result<PoolHealthReport> {
        let pool = self.get(name).await?;
        let status = self.get_status(name).await?;

        let capacity = pool.capacity_percent();
        let total_errors = status.total_errors();
        let vdev_errors = status.vdevs.iter().any(|v| v.has_errors());
        // The "errors:" line reports data errors distinct from per-vdev
        // counters; those warn rather than go critical.
        let data_errors = status
            .errors
            .as_deref()
            .map(|e| !e.to_lowercase().contains("no known data errors"))
            .unwrap_or(false);

        let health = match status.state {
            PoolState::Faulted => PoolHealth::Failed,
            PoolState::Offline | PoolState::Unavail | PoolState::Suspended => PoolHealth::Critical,
            PoolState::Degraded => PoolHealth::Critical,
            _ if vdev_errors || capacity >= 95 => PoolHealth::Critical,
            _ if capacity >= 85 || data_errors => PoolHealth::Warning,
            _ => PoolHealth::Healthy,
        };

        Ok(PoolHealthReport {
            pool: pool.name,
            state: status.state,
            health,
            capacity_percent: capacity,
            total_errors,
            scan: status.scan,
            vdevs: status.vdevs,
        })
    }

    pub async fn get_iostat(
        &self,
        pool: Option<&str>,
        interval: u32,
        count: u32,
    ) -> Result<String> {
        let interval = interval.max(1).to_string();
        let count = count.max(1).to_string();

        let mut args = vec!["iostat", "-v"];
        if let Some(pool) = pool {
            validation::validate_dataset_name(pool)?;
            args.push(pool);
        }
        args.push(&interval);
        args.push(&count);

        let result = self.executor.execute_system("zpool", &args).await?;
        if !result.success {
            return Err(command_error(&result, "iostat for", pool.unwrap_or("all")));
        }
        Ok(result.stdout)
    }

    pub async fn start_scrub(&self, name: &str) -> Result<()> {
        validation::validate_dataset_name(name)?;
        info!("Starting scrub on pool: {}", name);

        let result = self.executor.execute_system("zpool", &["scrub", name]).await?;
        if !result.success {
            return Err(command_error(&result, "start scrub on", name));
        }
        Ok(())
    }

    pub async fn stop_scrub(&self, name: &str) -> Result<()> {
        validation::validate_dataset_name(name)?;
        info!("Stopping scrub on pool: {}", name);

        let result = self
            .executor
            .execute_system("zpool", &["scrub", "-s", name])
            .await?;
        if !result.success {
            return Err(command_error(&result, "stop scrub on", name));
        }
        Ok(())
    }

    /// The scan line from `zpool status`, if any scrub/resilver has run.
    pub async fn get_scrub_status(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get_status(name).await?.scan)
    }

    pub async fn export(&self, name: &str, force: bool) -> Result<()> {
        validation::validate_dataset_name(name)?;
        info!("Exporting pool: {} (force={})", name, force);

        let mut args = vec!["export"];
        if force {
            args.push("-f");
        }
        args.push(name);

        let result = self.executor.execute_system("zpool", &args).await?;
        if !result.success {
            return Err(command_error(&result, "export pool", name));
        }
        Ok(())
    }

    pub async fn import(&self, name: &str, new_name: Option<&str>, force: bool) -> Result<()> {
        validation::validate_dataset_name(name)?;
        if let Some(new_name) = new_name {
            validation::validate_dataset_name(new_name)?;
        }
        info!("Importing pool: {} (as {:?})", name, new_name);

        let mut args = vec!["import"];
        if force {
            args.push("-f");
        }
        args.push(name);
        if let Some(new_name) = new_name {
            args.push(new_name);
        }

        let result = self.executor.execute_system("zpool", &args).await?;
        if !result.success {
            return Err(command_error(&result, "import pool", name));
        }
        Ok(())
    }

    /// Command history entries for a pool.
    pub async fn get_pool_history(&self, name: &str) -> Result<Vec<String>> {
        validation::validate_dataset_name(name)?;

        let result = self
            .executor
            .execute_system("zpool", &["history", name])
            .await?;
        if !result.success {
            return Err(command_error(&result, "get history of", name));
        }

        Ok(result
            .stdout
            .lines()
            .skip(1) // "History for 'tank':" header
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect())
    }
}

fn parse_pool_row(line: &str) -> Result<Pool> {
    let parts = split_row(line, 8)?;

    let frag = parts[5].trim_end_matches('%');
    let dedup = parts[7].trim_end_matches('x');

    Ok(Pool {
        name: parts[0].to_string(),
        size: SizeValue::from_zfs_string(parts[1])?,
        allocated: SizeValue::from_zfs_string(parts[2])?,
        free: SizeValue::from_zfs_string(parts[3])?,
        fragmentation_percent: if frag == "-" { 0 } else { frag.parse().unwrap_or(0) },
        state: parts[6].parse()?,
        dedup_ratio: dedup.parse().unwrap_or(1.0),
        properties: HashMap::new(),
    })
}

/// Parse `zpool status -v` output: pool/state/scan/errors lines plus the
/// indented vdev config table.
fn parse_pool_status(output: &str) -> Result<PoolStatus> {
    let mut name = None;
    let mut state = None;
    let mut scan = None;
    let mut errors = None;
    let mut vdevs: Vec<VDev> = Vec::new();
    let mut in_config = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("pool:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("state:") {
            state = Some(PoolState::from_str(value.trim())?);
        } else if let Some(value) = trimmed.strip_prefix("scan:") {
            scan = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("errors:") {
            errors = Some(value.trim().to_string());
        } else if trimmed.starts_with("config:") {
            in_config = true;
        } else if in_config {
            if trimmed.is_empty() || trimmed.starts_with("NAME") {
                continue;
            }
            // Depth comes from indentation below the pool row: the pool
            // itself sits at depth 0, groups at 1, leaves deeper.
            let stripped = line.trim_start_matches('\t');
            let indent = stripped.len() - stripped.trim_start().len();
            let depth = indent / 2;

            let parts: Vec<&str> = trimmed.split_whitespace().collect();
            if parts.len() < 5 {
                warn!("Skipping unparseable vdev row: {}", line);
                continue;
            }
            let vdev = VDev {
                name: parts[0].to_string(),
                state: parts[1].to_string(),
                read_errors: parts[2].parse().unwrap_or(0),
                write_errors: parts[3].parse().unwrap_or(0),
                checksum_errors: parts[4].parse().unwrap_or(0),
                children: Vec::new(),
            };

            if depth == 0 {
                // Pool summary row; counters belong to the pool aggregate.
                continue;
            }
            insert_vdev(&mut vdevs, vdev, depth - 1);
        }
    }

    Ok(PoolStatus {
        name: name.ok_or_else(|| Error::Parse("zpool status missing pool name".to_string()))?,
        state: state.ok_or_else(|| Error::Parse("zpool status missing state".to_string()))?,
        vdevs,
        scan,
        errors,
    })
}

fn insert_vdev(level: &mut Vec<VDev>, vdev: VDev, depth: usize) {
    if depth == 0 || level.is_empty() {
        level.push(vdev);
    } else {
        let last = level.len() - 1;
        insert_vdev(&mut level[last].children, vdev, depth - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_FIXTURE: &str = "  pool: tank\n state: ONLINE\n  scan: scrub repaired 0B in 00:10:23 with 0 errors on Sun Jul 27 00:34:24 2025\nconfig:\n\n\tNAME        STATE     READ WRITE CKSUM\n\ttank        ONLINE       0     0     0\n\t  mirror-0  ONLINE       0     0     0\n\t    sda     ONLINE       0     0     0\n\t    sdb     ONLINE       0     0     2\n\nerrors: No known data errors\n";

    #[test]
    fn test_parse_pool_row() {
        let row = "tank\t100G\t45G\t55G\t-\t12%\tONLINE\t1.00x";
        let pool = parse_pool_row(row).unwrap();
        assert_eq!(pool.name, "tank");
        assert_eq!(pool.state, PoolState::Online);
        assert_eq!(pool.fragmentation_percent, 12);
        assert_eq!(pool.capacity_percent(), 45);
    }

    #[test]
    fn test_parse_pool_row_short() {
        assert!(parse_pool_row("tank\t100G\t45G").is_err());
    }

    #[test]
    fn test_parse_pool_status() {
        let status = parse_pool_status(STATUS_FIXTURE).unwrap();
        assert_eq!(status.name, "tank");
        assert_eq!(status.state, PoolState::Online);
        assert!(status.scan.as_ref().unwrap().starts_with("scrub repaired"));
        assert_eq!(status.vdevs.len(), 1);
        assert_eq!(status.vdevs[0].name, "mirror-0");
        assert_eq!(status.vdevs[0].children.len(), 2);
        assert_eq!(status.total_errors(), 2);
    }

    #[test]
    fn test_health_derivation_rules() {
        // The rating logic lives in health_check; exercise the same rules
        // through synthetic inputs.
        fn derive(state: PoolState, capacity: u32, vdev_errors: bool, data_errors: bool) -> PoolHealth {
            match state {
                PoolState::Faulted => PoolHealth::Failed,
                PoolState::Offline | PoolState::Unavail | PoolState::Suspended => {
                    PoolHealth::Critical
                }
                PoolState::Degraded => PoolHealth::Critical,
                _ if vdev_errors || capacity >= 95 => PoolHealth::Critical,
                _ if capacity >= 85 || data_errors => PoolHealth::Warning,
                _ => PoolHealth::Healthy,
            }
        }

        assert_eq!(derive(PoolState::Faulted, 10, false, false), PoolHealth::Failed);
        assert_eq!(derive(PoolState::Offline, 10, false, false), PoolHealth::Critical);
        assert_eq!(derive(PoolState::Degraded, 10, false, false), PoolHealth::Critical);
        // Capacity >=95 is critical even when ONLINE.
        assert_eq!(derive(PoolState::Online, 95, false, false), PoolHealth::Critical);
        assert_eq!(derive(PoolState::Online, 85, false, false), PoolHealth::Warning);
        assert_eq!(derive(PoolState::Online, 84, false, false), PoolHealth::Healthy);
        assert_eq!(derive(PoolState::Online, 10, true, false), PoolHealth::Critical);
        assert_eq!(derive(PoolState::Online, 10, false, true), PoolHealth::Warning);
    }

    #[test]
    fn test_pool_state_round_trip() {
        for s in ["ONLINE", "OFFLINE", "DEGRADED", "FAULTED", "REMOVED", "UNAVAIL", "SUSPENDED"] {
            let state = PoolState::from_str(s).unwrap();
            assert_eq!(state.to_string(), s);
        }
        assert!(PoolState::from_str("BROKEN").is_err());
    }
}
