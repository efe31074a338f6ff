//! Typed services over the `zfs` and `zpool` command line tools
//!
//! Output parsing is tolerant at row granularity (bad rows are skipped with
//! a warning) and strict at cell granularity (a missing expected cell fails
//! the call with a Parse error).

pub mod dataset;
pub mod pool;
pub mod snapshot;

pub use dataset::{Dataset, DatasetService, DatasetUsage};
pub use pool::{Pool, PoolHealth, PoolService, PoolState, VDev};
pub use snapshot::{RetentionReport, Snapshot, SnapshotService};

use crate::executor::CommandResult;
use transdock_common::{Error, Result};

/// Map a failed command result onto the error taxonomy, folding the common
/// "does not exist" stderr into NotFound.
pub(crate) fn command_error(result: &CommandResult, what: &str, subject: &str) -> Error {
    let stderr = result.stderr.to_lowercase();
    if stderr.contains("does not exist") || stderr.contains("no such") {
        Error::NotFound(subject.to_string())
    } else if result.exit_code == 124 {
        Error::Timeout(format!("{} {}", what, subject))
    } else {
        Error::Operation(format!("{} {} failed: {}", what, subject, result.stderr))
    }
}

/// Split one `zfs list -H` row into its tab-separated cells, requiring at
/// least `expected` columns.
pub(crate) fn split_row(line: &str, expected: usize) -> Result<Vec<&str>> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < expected {
        return Err(Error::Parse(format!(
            "expected {} columns, got {}: {}",
            expected,
            parts.len(),
            line
        )));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_classification() {
        let result = CommandResult::failure(1, "cannot open 'tank/gone': dataset does not exist");
        assert!(matches!(
            command_error(&result, "get", "tank/gone"),
            Error::NotFound(_)
        ));

        let result = CommandResult::failure(124, "command timed out after 30 seconds");
        assert!(matches!(
            command_error(&result, "list", "tank"),
            Error::Timeout(_)
        ));

        let result = CommandResult::failure(2, "invalid option");
        assert!(matches!(
            command_error(&result, "list", "tank"),
            Error::Operation(_)
        ));
    }

    #[test]
    fn test_split_row() {
        assert_eq!(split_row("a\tb\tc", 3).unwrap(), vec!["a", "b", "c"]);
        assert!(split_row("a\tb", 3).is_err());
    }
}
