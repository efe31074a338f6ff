//! Application State
//!
//! Shared state for the TransDock API server

use std::sync::Arc;

use crate::auth::AuthService;
use crate::compose::ComposeClient;
use crate::config::TransdockConfig;
use crate::db::{Database, MigrationRepository};
use crate::migration::orchestrator::MigrationOrchestrator;
use crate::websocket::{ConnectionManager, EventBroadcaster};
use crate::zfs::{DatasetService, PoolService, SnapshotService};

/// Shared application state
pub struct AppState {
    pub config: Arc<TransdockConfig>,
    pub database: Arc<Database>,
    pub repository: Arc<dyn MigrationRepository>,
    pub orchestrator: Arc<MigrationOrchestrator>,
    pub datasets: Arc<DatasetService>,
    pub snapshots: Arc<SnapshotService>,
    pub pools: Arc<PoolService>,
    pub compose: Arc<dyn ComposeClient>,
    pub auth: Arc<AuthService>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Arc<EventBroadcaster>,
}
