//! ZFS service scenarios: retention policy, size parsing, executor
//! allow-lists and host-key handling.

mod common;

use chrono::Utc;
use common::StubExecutor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use transdock_api::executor::{CommandExecutor, CommandResult, SystemCommandExecutor};
use transdock_api::zfs::SnapshotService;
use transdock_common::values::{DatasetName, SizeValue, SshConfig};
use transdock_common::Error;

/// In-memory snapshot store exposed through the executor interface, enough
/// for list/exists/destroy to behave like a real pool.
#[derive(Clone)]
struct SnapshotStore {
    snapshots: Arc<Mutex<Vec<(String, i64, String)>>>, // (full_name, creation, clones)
}

impl SnapshotStore {
    fn new(entries: Vec<(String, i64, String)>) -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(entries)),
        }
    }

    fn names(&self) -> HashSet<String> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    fn into_executor(self) -> StubExecutor {
        StubExecutor::with_handler(move |call| {
            let ok = |stdout: String| CommandResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
                success: true,
            };
            let joined = call.join(" ");

            if call[0] == "zfs" && call[1] == "destroy" {
                let target = call.last().map(String::as_str).unwrap_or("");
                let mut snapshots = self.snapshots.lock().unwrap();
                let before = snapshots.len();
                snapshots.retain(|(name, _, _)| name != target);
                if snapshots.len() == before {
                    return CommandResult {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: "dataset does not exist".to_string(),
                        success: false,
                    };
                }
                return ok(String::new());
            }

            if joined.starts_with("zfs list -H -t snapshot -o name ") {
                let target = call.last().map(String::as_str).unwrap_or("");
                let known = self
                    .snapshots
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(name, _, _)| name == target);
                return CommandResult {
                    exit_code: if known { 0 } else { 1 },
                    stdout: if known { target.to_string() } else { String::new() },
                    stderr: if known {
                        String::new()
                    } else {
                        "dataset does not exist".to_string()
                    },
                    success: known,
                };
            }

            if joined.starts_with("zfs list -H -t snapshot -o name,used") {
                let filter = call
                    .last()
                    .filter(|a| !a.starts_with('-') && !a.contains(','))
                    .cloned();
                let rows: Vec<String> = self
                    .snapshots
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(name, _, _)| match &filter {
                        Some(dataset) => name.starts_with(&format!("{}@", dataset)),
                        None => true,
                    })
                    .map(|(name, creation, clones)| {
                        format!("{}\t12M\t1G\t{}\t{}", name, creation, clones)
                    })
                    .collect();
                return ok(rows.join("\n"));
            }

            ok(String::new())
        })
    }
}

fn days_ago(days: i64) -> i64 {
    (Utc::now() - chrono::Duration::days(days)).timestamp()
}

fn aged_store() -> SnapshotStore {
    SnapshotStore::new(vec![
        ("tank/data@age-1".to_string(), days_ago(1), "-".to_string()),
        ("tank/data@age-3".to_string(), days_ago(3), "-".to_string()),
        ("tank/data@age-10".to_string(), days_ago(10), "-".to_string()),
        ("tank/data@age-40".to_string(), days_ago(40), "-".to_string()),
        ("tank/data@age-90".to_string(), days_ago(90), "-".to_string()),
    ])
}

#[tokio::test]
async fn retention_dry_run_then_apply() {
    // S4: ages {1,3,10,40,90}, keep 7 days.
    let store = aged_store();
    let before = store.names();
    let service = SnapshotService::new(Arc::new(store.clone().into_executor()));
    let dataset = DatasetName::from_string("tank/data").unwrap();

    let dry = service.apply_retention(&dataset, 7, true).await.unwrap();
    assert_eq!(dry.total_snapshots, 5);
    assert_eq!(dry.to_delete, 3);
    assert_eq!(dry.to_keep, 2);
    assert_eq!(dry.deleted_count, 0);
    assert!(dry.dry_run);
    // Dry run leaves the on-disk set untouched.
    assert_eq!(store.names(), before);

    let applied = service.apply_retention(&dataset, 7, false).await.unwrap();
    assert_eq!(applied.to_delete, 3);
    assert_eq!(applied.deleted_count, 3);
    assert!(applied.failed_deletions.is_empty());

    let remaining = store.names();
    assert_eq!(
        remaining,
        HashSet::from([
            "tank/data@age-1".to_string(),
            "tank/data@age-3".to_string()
        ])
    );

    // Idempotence: a second apply with the same window deletes nothing.
    let again = service.apply_retention(&dataset, 7, false).await.unwrap();
    assert_eq!(again.to_delete, 0);
    assert_eq!(again.deleted_count, 0);
}

#[tokio::test]
async fn retention_keeps_cloned_snapshots() {
    let store = SnapshotStore::new(vec![
        (
            "tank/data@base".to_string(),
            days_ago(60),
            "tank/clone1".to_string(),
        ),
        ("tank/data@old".to_string(), days_ago(60), "-".to_string()),
    ]);
    let service = SnapshotService::new(Arc::new(store.clone().into_executor()));
    let dataset = DatasetName::from_string("tank/data").unwrap();

    let report = service.apply_retention(&dataset, 7, false).await.unwrap();
    assert_eq!(report.to_delete, 1);
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.to_keep, 1);

    // The cloned snapshot survives.
    assert_eq!(store.names(), HashSet::from(["tank/data@base".to_string()]));
}

#[test]
fn size_parse_table() {
    // S5: the literal parse table.
    let cases = [
        ("0", 0u64),
        ("-", 0),
        ("0B", 0),
        ("1K", 1024),
        ("1.5G", 1_610_612_736),
        ("1T", 1_099_511_627_776),
    ];
    for (input, expected) in cases {
        assert_eq!(
            SizeValue::from_zfs_string(input).unwrap().bytes(),
            expected,
            "parsing {:?}",
            input
        );
    }
}

#[tokio::test]
async fn unknown_host_refused_before_spawn() {
    // S6: unknown host with auto_accept disabled fails with a Remote error
    // naming the known_hosts file, without running ssh.
    let dir = tempfile::TempDir::new().unwrap();
    let known_hosts = dir.path().join("known_hosts");
    let executor = SystemCommandExecutor::new(5, known_hosts.clone()).unwrap();

    let err = executor
        .execute_remote(
            "new.example",
            &["zfs", "list"],
            &SshConfig::default(),
            false,
        )
        .await
        .unwrap_err();

    match err {
        Error::Remote { host, exit_code, message } => {
            assert_eq!(host, "new.example");
            assert_eq!(exit_code, None);
            assert!(message.contains(&known_hosts.display().to_string()));
        }
        other => panic!("expected Remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn zfs_subcommand_allow_list_is_closed() {
    let dir = tempfile::TempDir::new().unwrap();
    let executor = SystemCommandExecutor::new(5, dir.path().join("known_hosts")).unwrap();

    for forbidden in ["version", "upgrade", "load-key", "change-key", "jail"] {
        let result = executor.execute_zfs(forbidden, &[]).await.unwrap();
        assert!(!result.success, "{} should be rejected", forbidden);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("not allowed"));
    }
}

#[tokio::test]
async fn send_uses_pipe_with_target_host() {
    let store = SnapshotStore::new(vec![(
        "tank/data@mig".to_string(),
        days_ago(0),
        "-".to_string(),
    )]);
    let executor = Arc::new(store.into_executor());
    let service = SnapshotService::new(executor.clone());

    service
        .send(
            "tank/data@mig",
            "host2",
            "backup/data",
            &SshConfig::default(),
            false,
        )
        .await
        .unwrap();

    let pipes = executor.calls_starting_with("pipe");
    assert_eq!(pipes.len(), 1);
    assert_eq!(
        pipes[0],
        vec![
            "pipe",
            "host2",
            "zfs",
            "send",
            "tank/data@mig",
            "|",
            "zfs",
            "receive",
            "-F",
            "backup/data"
        ]
    );
}
