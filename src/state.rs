//! Application state
//!
//! Holds all shared components and state

use crate::event_hub::EventHub;
use crate::store::DongleStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL for the dongle index
    pub database_url: String,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// Directory holding device nodes and the alias symlinks
    pub dev_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8090),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            dev_dir: std::env::var("DEV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/dev")),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Dongle index
    pub store: DongleStore,
    /// EventHub (websocket fan-out)
    pub events: Arc<EventHub>,
}
