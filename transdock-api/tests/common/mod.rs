//! Shared test doubles: a scriptable command executor, a canned compose
//! client, and a harness that wires the orchestrator over an in-memory
//! SQLite repository.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use transdock_api::compose::{
    ComposeClient, ComposeService, ComposeStack, ServiceStatus, StackComplexity, StackSummary,
    StackValidation, VolumeBinding,
};
use transdock_api::db::{Database, MigrationRepository, SqliteMigrationRepository};
use transdock_api::executor::{CommandExecutor, CommandResult};
use transdock_api::migration::orchestrator::{MigrationOrchestrator, OrchestratorConfig};
use transdock_api::websocket::{ConnectionManager, EventBroadcaster};
use transdock_api::zfs::{DatasetService, SnapshotService};
use transdock_common::values::{HostConnection, SshConfig};
use transdock_common::Result;

pub type Handler = Arc<dyn Fn(&[String]) -> CommandResult + Send + Sync>;

/// Command executor double: records every call, answers via a handler
/// closure, and can park forever on a chosen call to let tests cancel
/// mid-operation.
pub struct StubExecutor {
    calls: Mutex<Vec<Vec<String>>>,
    handler: Handler,
    block_on: Option<BlockRule>,
    block_hits: AtomicUsize,
}

struct BlockRule {
    predicate: Arc<dyn Fn(&[String]) -> bool + Send + Sync>,
    after_matches: usize,
    reached: tokio::sync::mpsc::UnboundedSender<()>,
}

impl StubExecutor {
    pub fn with_handler(handler: impl Fn(&[String]) -> CommandResult + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Arc::new(handler),
            block_on: None,
            block_hits: AtomicUsize::new(0),
        }
    }

    /// Everything succeeds with empty output.
    pub fn all_ok() -> Self {
        Self::with_handler(|_| CommandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            success: true,
        })
    }

    /// Park (never return) on the Nth call matching the predicate,
    /// signalling the returned receiver first.
    pub fn block_on(
        mut self,
        after_matches: usize,
        predicate: impl Fn(&[String]) -> bool + Send + Sync + 'static,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.block_on = Some(BlockRule {
            predicate: Arc::new(predicate),
            after_matches,
            reached: tx,
        });
        (self, rx)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(|s| s == prefix).unwrap_or(false))
            .collect()
    }

    async fn dispatch(&self, call: Vec<String>) -> CommandResult {
        self.calls.lock().unwrap().push(call.clone());

        if let Some(rule) = &self.block_on {
            if (rule.predicate)(&call) {
                let hit = self.block_hits.fetch_add(1, Ordering::SeqCst) + 1;
                if hit > rule.after_matches {
                    let _ = rule.reached.send(());
                    // Park until the worker future is dropped by a cancel.
                    std::future::pending::<()>().await;
                }
            }
        }

        (self.handler)(&call)
    }
}

#[async_trait]
impl CommandExecutor for StubExecutor {
    async fn execute_zfs(&self, subcmd: &str, args: &[&str]) -> Result<CommandResult> {
        let mut call = vec!["zfs".to_string(), subcmd.to_string()];
        call.extend(args.iter().map(|s| s.to_string()));
        Ok(self.dispatch(call).await)
    }

    async fn execute_system(&self, cmd: &str, args: &[&str]) -> Result<CommandResult> {
        let mut call = vec![cmd.to_string()];
        call.extend(args.iter().map(|s| s.to_string()));
        Ok(self.dispatch(call).await)
    }

    async fn execute_remote(
        &self,
        host: &str,
        command: &[&str],
        _ssh_config: &SshConfig,
        _auto_accept_hostkey: bool,
    ) -> Result<CommandResult> {
        let mut call = vec!["remote".to_string(), host.to_string()];
        call.extend(command.iter().map(|s| s.to_string()));
        Ok(self.dispatch(call).await)
    }

    async fn pipe_to_remote(
        &self,
        host: &str,
        producer: &[&str],
        remote_cmd: &[&str],
        _ssh_config: &SshConfig,
        _auto_accept_hostkey: bool,
    ) -> Result<CommandResult> {
        let mut call = vec!["pipe".to_string(), host.to_string()];
        call.extend(producer.iter().map(|s| s.to_string()));
        call.push("|".to_string());
        call.extend(remote_cmd.iter().map(|s| s.to_string()));
        Ok(self.dispatch(call).await)
    }

    async fn write_file(
        &self,
        host: &str,
        path: &str,
        _content: &str,
        _ssh_config: &SshConfig,
        _auto_accept_hostkey: bool,
    ) -> Result<()> {
        let call = vec!["write_file".to_string(), host.to_string(), path.to_string()];
        self.dispatch(call).await;
        Ok(())
    }
}

/// Compose client double serving a canned stack.
pub struct StubComposeClient {
    pub stack: ComposeStack,
    pub compose_text: String,
    pub statuses: Mutex<Vec<ServiceStatus>>,
    pub stopped: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
}

impl StubComposeClient {
    pub fn with_data_dirs(compose_path: &str, dirs: &[&str]) -> Self {
        let volumes: Vec<VolumeBinding> = dirs
            .iter()
            .map(|dir| VolumeBinding {
                source: dir.to_string(),
                target: "/data".to_string(),
                read_only: false,
                is_bind: true,
            })
            .collect();

        let stack = ComposeStack {
            name: "app".to_string(),
            path: compose_path.to_string(),
            services: vec![ComposeService {
                name: "web".to_string(),
                image: Some("nginx:1.27".to_string()),
                volumes,
                depends_on: Vec::new(),
            }],
            volumes: Vec::new(),
            external_volumes: Vec::new(),
            networks: Vec::new(),
        };

        Self {
            stack,
            compose_text: "services:\n  web:\n    image: nginx:1.27\n".to_string(),
            statuses: Mutex::new(vec![ServiceStatus {
                name: "web".to_string(),
                state: "running".to_string(),
            }]),
            stopped: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ComposeClient for StubComposeClient {
    async fn inspect(&self, _compose_path: &str) -> Result<ComposeStack> {
        Ok(self.stack.clone())
    }

    async fn read_compose_content(&self, _compose_path: &str) -> Result<(String, Option<String>)> {
        Ok((self.compose_text.clone(), None))
    }

    async fn validate_prerequisites(&self, _compose_path: &str) -> Result<StackValidation> {
        Ok(StackValidation {
            valid: true,
            complexity: StackComplexity::Simple,
            external_volumes: false,
            error: None,
        })
    }

    async fn stop(&self, compose_path: &str, _host: Option<&HostConnection>) -> Result<()> {
        self.stopped.lock().unwrap().push(compose_path.to_string());
        Ok(())
    }

    async fn start(&self, compose_path: &str, _host: Option<&HostConnection>) -> Result<()> {
        self.started.lock().unwrap().push(compose_path.to_string());
        Ok(())
    }

    async fn down(
        &self,
        _compose_path: &str,
        _remove_volumes: bool,
        _host: Option<&HostConnection>,
    ) -> Result<()> {
        Ok(())
    }

    async fn status(
        &self,
        _compose_path: &str,
        _host: Option<&HostConnection>,
    ) -> Result<Vec<ServiceStatus>> {
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn list_stacks(&self, _host: Option<&HostConnection>) -> Result<Vec<StackSummary>> {
        Ok(Vec::new())
    }
}

/// Orchestrator over in-memory SQLite plus the given doubles.
pub struct Harness {
    pub orchestrator: Arc<MigrationOrchestrator>,
    pub repository: Arc<dyn MigrationRepository>,
    pub executor: Arc<StubExecutor>,
    pub compose: Arc<StubComposeClient>,
    // Keeps the pool alive for the duration of the test.
    pub database: Arc<Database>,
}

pub async fn harness(executor: StubExecutor, compose: StubComposeClient) -> Harness {
    let database = Arc::new(Database::new("sqlite::memory:", 1).await.unwrap());
    database.migrate().await.unwrap();
    let repository: Arc<dyn MigrationRepository> =
        Arc::new(SqliteMigrationRepository::new(database.pool().clone()));

    let executor = Arc::new(executor);
    let compose = Arc::new(compose);
    let exec_dyn: Arc<dyn CommandExecutor> = executor.clone();
    let snapshots = Arc::new(SnapshotService::new(exec_dyn.clone()));
    let datasets = Arc::new(DatasetService::new(exec_dyn.clone()));

    let connections = Arc::new(ConnectionManager::new());
    let broadcaster = Arc::new(EventBroadcaster::new(connections));
    broadcaster.start().await;

    let orchestrator = Arc::new(MigrationOrchestrator::new(
        repository.clone(),
        snapshots,
        datasets,
        compose.clone(),
        exec_dyn,
        broadcaster,
        OrchestratorConfig::default(),
    ));

    Harness {
        orchestrator,
        repository,
        executor,
        compose,
        database,
    }
}

/// Poll until the migration reaches a terminal status.
pub async fn wait_for_terminal(
    repository: &Arc<dyn MigrationRepository>,
    migration_id: &str,
) -> transdock_api::migration::Migration {
    for _ in 0..500 {
        if let Some(migration) = repository.find_by_id(migration_id).await.unwrap() {
            if migration.status.is_terminal() {
                return migration;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("migration {} did not reach a terminal status", migration_id);
}
