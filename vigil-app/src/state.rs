//! Shared host state handed to the console and background tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use vigil_core::VigilEngine;

use crate::settings::AppSettings;
use crate::storage::SqliteStore;

pub struct AppState {
    /// The core engine. Wrapped in `Arc` so it can be cloned into forwarding tasks.
    pub engine: Arc<VigilEngine>,
    /// Same database the engine writes history into.
    pub store: Arc<SqliteStore>,
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<VigilEngine>,
        store: Arc<SqliteStore>,
        settings: AppSettings,
        settings_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            store,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
