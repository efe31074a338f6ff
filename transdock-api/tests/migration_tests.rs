//! Migration orchestration scenarios
//!
//! Drives the orchestrator end to end over an in-memory repository with
//! stubbed executor and compose collaborators.

mod common;

use common::{harness, wait_for_terminal, StubComposeClient, StubExecutor};
use std::sync::Arc;
use transdock_api::migration::orchestrator::CreateMigrationRequest;
use transdock_api::migration::{
    MigrationOptions, MigrationStatus, MigrationStepStatus, MigrationStepType,
};
use transdock_common::values::HostConnection;
use transdock_common::TransferMethod;

fn request(name: &str, options: MigrationOptions) -> CreateMigrationRequest {
    CreateMigrationRequest {
        name: name.to_string(),
        compose_stack_path: "/apps/app".to_string(),
        target_host: HostConnection::new("host2", "root", 22).unwrap(),
        target_base_path: "/opt/docker".to_string(),
        source_host: None,
        options,
    }
}

#[tokio::test]
async fn happy_path_with_zfs_and_no_data_dirs() {
    // S1: stack reports zero data directories; snapshot creation skips,
    // everything else completes.
    let h = harness(
        StubExecutor::all_ok(),
        StubComposeClient::with_data_dirs("/apps/app", &[]),
    )
    .await;

    let migration = h
        .orchestrator
        .create(request("m1", MigrationOptions::default()))
        .await
        .unwrap();
    assert_eq!(migration.steps.len(), 7);
    assert_eq!(migration.status, MigrationStatus::Pending);

    h.orchestrator.start(&migration.id).await.unwrap();
    let finished = wait_for_terminal(&h.repository, &migration.id).await;

    assert_eq!(finished.status, MigrationStatus::Completed);
    assert!((finished.progress_percentage() - 100.0).abs() < 0.01);

    for step in &finished.steps {
        match step.step_type {
            MigrationStepType::SnapshotCreation => {
                assert_eq!(step.status, MigrationStepStatus::Skipped);
                assert_eq!(
                    step.details.get("skip_reason").unwrap(),
                    &serde_json::json!("No data directories found")
                );
            }
            _ => assert_eq!(
                step.status,
                MigrationStepStatus::Completed,
                "step {} should be completed",
                step.name
            ),
        }
    }

    // Terminal migrations have no running step and no worker task.
    assert!(finished.steps.iter().all(|s| !s.is_running()));
    assert_eq!(h.orchestrator.running_count().await, 0);

    // Source stack was stopped, target stack started.
    assert_eq!(h.compose.stopped.lock().unwrap().len(), 1);
    assert_eq!(h.compose.started.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn validation_failure_blocks_start_but_not_create() {
    // S2: relative target path passes create, fails validate_request and
    // fails the validation step at run time.
    let h = harness(
        StubExecutor::all_ok(),
        StubComposeClient::with_data_dirs("/apps/app", &[]),
    )
    .await;

    let target = HostConnection::new("host2", "root", 22).unwrap();
    let outcome = h
        .orchestrator
        .validate_request("/apps/app", &target, "opt/docker")
        .await;
    assert!(!outcome.valid);
    assert!(outcome
        .errors
        .contains(&"Target base path must be an absolute path".to_string()));

    let mut bad_request = request("m2", MigrationOptions::default());
    bad_request.target_base_path = "opt/docker".to_string();
    let migration = h.orchestrator.create(bad_request).await.unwrap();

    h.orchestrator.start(&migration.id).await.unwrap();
    let finished = wait_for_terminal(&h.repository, &migration.id).await;

    assert_eq!(finished.status, MigrationStatus::Failed);
    let failed_step = finished.failed_step().unwrap();
    assert_eq!(failed_step.step_type, MigrationStepType::Validation);
    assert!(finished
        .error_message
        .as_deref()
        .unwrap()
        .contains("absolute path"));
}

#[tokio::test]
async fn cancel_mid_transfer_leaves_consistent_state() {
    // S3: three data directories over rsync; the third transfer parks, the
    // caller cancels, and the persisted state shows a failed transfer step
    // with a cancelled marker while later steps stay pending.
    let (executor, mut reached) = StubExecutor::all_ok().block_on(2, |call| {
        call.first().map(|c| c == "rsync").unwrap_or(false)
    });
    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a", "/srv/b", "/srv/c"]),
    )
    .await;

    let options = MigrationOptions {
        use_zfs: false,
        transfer_method: TransferMethod::Rsync,
        ..Default::default()
    };
    let migration = h.orchestrator.create(request("m3", options)).await.unwrap();
    h.orchestrator.start(&migration.id).await.unwrap();

    // Wait until the worker is parked inside the third rsync.
    tokio::time::timeout(std::time::Duration::from_secs(5), reached.recv())
        .await
        .expect("worker never reached the third transfer");

    // Two of three directories are recorded as transferred.
    let snapshot = h
        .repository
        .find_by_id(&migration.id)
        .await
        .unwrap()
        .unwrap();
    let transfer_step = snapshot
        .steps
        .iter()
        .find(|s| s.step_type == MigrationStepType::DataTransfer)
        .unwrap();
    assert!(transfer_step.is_running());
    let two_thirds = 20.0 + 2.0 * 70.0 / 3.0;
    assert!(
        (transfer_step.progress_percentage - two_thirds).abs() < 0.1,
        "expected 2/3 progress, got {}",
        transfer_step.progress_percentage
    );

    h.orchestrator.cancel(&migration.id).await.unwrap();

    let finished = wait_for_terminal(&h.repository, &migration.id).await;
    assert_eq!(finished.status, MigrationStatus::Cancelled);

    let transfer_step = finished
        .steps
        .iter()
        .find(|s| s.step_type == MigrationStepType::DataTransfer)
        .unwrap();
    assert_eq!(transfer_step.status, MigrationStepStatus::Failed);
    assert_eq!(
        transfer_step.details.get("error_kind").unwrap(),
        &serde_json::json!("CANCELLED")
    );

    for step in &finished.steps {
        match step.step_type {
            MigrationStepType::Validation | MigrationStepType::DataTransfer => {}
            _ => assert_eq!(
                step.status,
                MigrationStepStatus::Pending,
                "step {} should remain pending",
                step.name
            ),
        }
    }

    assert_eq!(h.orchestrator.running_count().await, 0);
}

#[tokio::test]
async fn cancel_of_non_running_migration_fails() {
    let h = harness(
        StubExecutor::all_ok(),
        StubComposeClient::with_data_dirs("/apps/app", &[]),
    )
    .await;

    let migration = h
        .orchestrator
        .create(request("m4", MigrationOptions::default()))
        .await
        .unwrap();

    let err = h.orchestrator.cancel(&migration.id).await.unwrap_err();
    assert_eq!(err.code(), "OPERATION_FAILED");

    assert!(h.orchestrator.cancel("missing").await.is_err());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (executor, mut reached) = StubExecutor::all_ok().block_on(0, |call| {
        call.first().map(|c| c == "rsync").unwrap_or(false)
    });
    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a"]),
    )
    .await;

    let options = MigrationOptions {
        use_zfs: false,
        transfer_method: TransferMethod::Rsync,
        ..Default::default()
    };
    let migration = h.orchestrator.create(request("m5", options)).await.unwrap();

    h.orchestrator.start(&migration.id).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), reached.recv())
        .await
        .expect("worker never reached transfer");

    let err = h.orchestrator.start(&migration.id).await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    h.orchestrator.cancel(&migration.id).await.unwrap();
}

#[tokio::test]
async fn start_of_missing_migration_is_not_found() {
    let h = harness(
        StubExecutor::all_ok(),
        StubComposeClient::with_data_dirs("/apps/app", &[]),
    )
    .await;
    let err = h.orchestrator.start("no-such-id").await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn zfs_send_transfers_each_recorded_snapshot() {
    // Snapshots created for two directories are streamed to the target and
    // cleaned up afterwards. The handler tracks which snapshots exist so the
    // create/destroy pre-checks behave like a real zfs.
    let existing = Arc::new(std::sync::Mutex::new(
        std::collections::HashSet::<String>::new(),
    ));
    let state = existing.clone();
    let executor = StubExecutor::with_handler(move |call| {
        let ok = |stdout: String| transdock_api::executor::CommandResult {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            success: true,
        };
        let joined = call.join(" ");

        if call[0] == "zfs" && call[1] == "snapshot" {
            state
                .lock()
                .unwrap()
                .insert(call.last().cloned().unwrap_or_default());
            return ok(String::new());
        }
        if call[0] == "zfs" && call[1] == "destroy" {
            state
                .lock()
                .unwrap()
                .remove(call.last().map(String::as_str).unwrap_or(""));
            return ok(String::new());
        }
        // Existence pre-check: zfs list -H -t snapshot -o name <full>
        if joined.starts_with("zfs list -H -t snapshot -o name ") {
            let target = call.last().map(String::as_str).unwrap_or("");
            let known = state.lock().unwrap().contains(target);
            return transdock_api::executor::CommandResult {
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
        // Fetch after create returns a parseable snapshot row.
        if joined.starts_with("zfs list -H -t snapshot -o name,used") {
            let target = call.last().cloned().unwrap_or_default();
            return ok(format!("{}\t0\t1G\t1754006400\t-", target));
        }
        // Mountpoint resolution maps each bind directory to a dataset.
        if joined.starts_with("zfs list -H -o mountpoint,name") {
            return ok("/srv/a\ttank/a\n/srv/b\ttank/b\n".to_string());
        }
        ok(String::new())
    });

    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a", "/srv/b"]),
    )
    .await;

    let migration = h
        .orchestrator
        .create(request("m6", MigrationOptions::default()))
        .await
        .unwrap();
    h.orchestrator.start(&migration.id).await.unwrap();
    let finished = wait_for_terminal(&h.repository, &migration.id).await;

    assert_eq!(finished.status, MigrationStatus::Completed);
    assert_eq!(finished.recorded_snapshots().len(), 2);

    // One zfs send pipeline per snapshot, addressed to the target host.
    let pipes = h.executor.calls_starting_with("pipe");
    assert_eq!(pipes.len(), 2);
    for pipe in &pipes {
        assert_eq!(pipe[1], "host2");
        assert!(pipe.iter().any(|a| a == "send"));
        assert!(pipe.iter().any(|a| a == "receive"));
        // Derived target datasets live under the target base path.
        assert!(pipe.iter().any(|a| a.starts_with("opt/docker/")));
    }

    // Cleanup destroyed both snapshots.
    let destroys: Vec<_> = h
        .executor
        .calls_starting_with("zfs")
        .into_iter()
        .filter(|c| c.get(1).map(|s| s == "destroy").unwrap_or(false))
        .collect();
    assert_eq!(destroys.len(), 2);
}

#[tokio::test]
async fn at_most_one_step_running_at_any_instant() {
    // Sample the persisted state while a migration runs and verify the
    // single-running-step invariant plus the progress mean.
    let (executor, mut reached) = StubExecutor::all_ok().block_on(1, |call| {
        call.first().map(|c| c == "rsync").unwrap_or(false)
    });
    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a", "/srv/b"]),
    )
    .await;

    let options = MigrationOptions {
        use_zfs: false,
        transfer_method: TransferMethod::Rsync,
        ..Default::default()
    };
    let migration = h.orchestrator.create(request("m7", options)).await.unwrap();
    h.orchestrator.start(&migration.id).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), reached.recv())
        .await
        .expect("worker never reached the second transfer");

    let snapshot = h
        .repository
        .find_by_id(&migration.id)
        .await
        .unwrap()
        .unwrap();
    let running = snapshot.steps.iter().filter(|s| s.is_running()).count();
    assert_eq!(running, 1);

    let mean: f64 = snapshot
        .steps
        .iter()
        .map(|s| s.progress_percentage)
        .sum::<f64>()
        / snapshot.steps.len() as f64;
    assert!((snapshot.progress_percentage() - mean).abs() < 0.01);

    h.orchestrator.cancel(&migration.id).await.unwrap();
}

#[tokio::test]
async fn delete_is_rejected_while_running() {
    let (executor, mut reached) = StubExecutor::all_ok().block_on(0, |call| {
        call.first().map(|c| c == "rsync").unwrap_or(false)
    });
    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a"]),
    )
    .await;

    let options = MigrationOptions {
        use_zfs: false,
        transfer_method: TransferMethod::Rsync,
        ..Default::default()
    };
    let migration = h.orchestrator.create(request("m8", options)).await.unwrap();
    h.orchestrator.start(&migration.id).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), reached.recv())
        .await
        .expect("worker never reached transfer");

    assert!(h.orchestrator.delete(&migration.id).await.is_err());

    h.orchestrator.cancel(&migration.id).await.unwrap();
    wait_for_terminal(&h.repository, &migration.id).await;
    h.orchestrator.delete(&migration.id).await.unwrap();
    assert!(h.orchestrator.get(&migration.id).await.unwrap().is_none());
}

#[tokio::test]
async fn status_reports_estimate_and_task_liveness() {
    let (executor, mut reached) = StubExecutor::all_ok().block_on(0, |call| {
        call.first().map(|c| c == "rsync").unwrap_or(false)
    });
    let h = harness(
        executor,
        StubComposeClient::with_data_dirs("/apps/app", &["/srv/a"]),
    )
    .await;

    let options = MigrationOptions {
        use_zfs: false,
        transfer_method: TransferMethod::Rsync,
        ..Default::default()
    };
    let migration = h.orchestrator.create(request("m9", options)).await.unwrap();
    h.orchestrator.start(&migration.id).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), reached.recv())
        .await
        .expect("worker never reached transfer");

    let status = h.orchestrator.status(&migration.id).await.unwrap();
    assert_eq!(status.task_running, Some(true));
    assert_eq!(
        status.current_step.as_ref().unwrap().step_type,
        MigrationStepType::DataTransfer
    );

    h.orchestrator.cancel(&migration.id).await.unwrap();
}

#[tokio::test]
async fn repeated_get_returns_identical_state_between_mutations() {
    let h = harness(
        StubExecutor::all_ok(),
        StubComposeClient::with_data_dirs("/apps/app", &[]),
    )
    .await;

    let migration = h
        .orchestrator
        .create(request("m10", MigrationOptions::default()))
        .await
        .unwrap();

    let first = h.orchestrator.get(&migration.id).await.unwrap().unwrap();
    let second = h.orchestrator.get(&migration.id).await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn concurrent_migrations_run_independently() {
    let h = Arc::new(
        harness(
            StubExecutor::all_ok(),
            StubComposeClient::with_data_dirs("/apps/app", &[]),
        )
        .await,
    );

    let a = h
        .orchestrator
        .create(request("ma", MigrationOptions::default()))
        .await
        .unwrap();
    let b = h
        .orchestrator
        .create(request("mb", MigrationOptions::default()))
        .await
        .unwrap();

    h.orchestrator.start(&a.id).await.unwrap();
    h.orchestrator.start(&b.id).await.unwrap();

    let finished_a = wait_for_terminal(&h.repository, &a.id).await;
    let finished_b = wait_for_terminal(&h.repository, &b.id).await;
    assert_eq!(finished_a.status, MigrationStatus::Completed);
    assert_eq!(finished_b.status, MigrationStatus::Completed);
}
