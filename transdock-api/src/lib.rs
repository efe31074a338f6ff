//! TransDock API Library
//!
//! Exposes the migration engine, ZFS services and supporting modules for
//! tests and external integrations.

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

// Application state
pub mod state;
pub use state::AppState;

// Subprocess execution
pub mod executor;

// ZFS services
pub mod zfs;

// Container stacks
pub mod compose;

// Migration engine
pub mod migration;

// Database
pub mod db;

// Authentication
pub mod auth;

// WebSocket
pub mod websocket;
