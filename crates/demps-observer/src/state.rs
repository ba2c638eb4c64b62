//! Shared application state for the HTTP server.
//!
//! [`AppState`] holds the resource pool shared by every run and the
//! service configuration each run reads its settings from.

use std::path::PathBuf;
use std::sync::Arc;

use demps_core::config::ServiceConfig;
use demps_core::pool::ResourcePool;

/// State shared by all handlers.
#[derive(Debug)]
pub struct AppState {
    /// Singleton resources (watchers, simulator) shared across runs.
    pub pool: Arc<ResourcePool>,
    /// Service configuration.
    pub config: Arc<ServiceConfig>,
    files_root: PathBuf,
}

impl AppState {
    /// Create state with a fresh, empty pool.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_pool(config, Arc::new(ResourcePool::new()))
    }

    /// Create state around an existing pool.
    pub fn with_pool(config: ServiceConfig, pool: Arc<ResourcePool>) -> Self {
        let files_root = config.files_root();
        Self {
            pool,
            config: Arc::new(config),
            files_root,
        }
    }

    /// Root the directory endpoints are confined to.
    pub fn files_root(&self) -> &std::path::Path {
        &self.files_root
    }
}
