pub mod cache;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod extractor;
pub mod locales;
pub mod monitor;
pub mod reviews;
pub mod targets;
pub mod view;
pub mod warmup;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{AppConfig, PublicAppConfig};
use crate::coordinator::RefreshCoordinator;
use crate::db::{bootstrap, DatabaseContext};
use crate::errors::{AppError, AppResult};
use crate::extractor::{BrowserlessExtractor, ReviewExtractor};
use crate::monitor::{MonitorLoop, MonitorState};
use crate::warmup::WarmupQueue;

pub use crate::commands::CommandResult;
pub use crate::errors::ErrorEnvelope;
pub use crate::view::{ReviewQuery, ReviewsView, SortOrder, StatsSummary};

/// Shared state behind every request handler and background task.
pub struct AppState {
    db: Arc<Mutex<SqlConnection>>,
    db_path: PathBuf,
    config: AppConfig,
    coordinator: Arc<RefreshCoordinator>,
    monitor: Arc<MonitorLoop>,
    warmup: WarmupQueue,
    warmup_jobs: Mutex<Option<mpsc::Receiver<i64>>>,
    shutdown: broadcast::Sender<()>,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
    pub version: &'static str,
    pub db_path: String,
    pub monitor_state: MonitorState,
    pub supported_locales: Vec<String>,
    pub config: PublicAppConfig,
}

/// Handles of the spawned monitor loop and warmup worker.
pub struct BackgroundTasks {
    monitor: JoinHandle<()>,
    warmup: JoinHandle<()>,
}

impl BackgroundTasks {
    pub async fn join(self) {
        if let Err(err) = self.monitor.await {
            warn!(target: "monitor", ?err, "monitor task ended abnormally");
        }
        if let Err(err) = self.warmup.await {
            warn!(target: "warmup", ?err, "warmup task ended abnormally");
        }
    }
}

impl AppState {
    /// Opens the store under the configured data directory and wires the
    /// rendering-service extractor.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let extractor = Arc::new(BrowserlessExtractor::new(&config)?);
        Self::with_extractor(config, extractor)
    }

    pub fn with_extractor(
        config: AppConfig,
        extractor: Arc<dyn ReviewExtractor>,
    ) -> AppResult<Self> {
        let DatabaseContext { connection, path } =
            bootstrap(&config.data_dir, &config.database_file_name)?;
        let backfilled = cache::backfill_missing_timestamps(&connection, db::now())?;
        if backfilled > 0 {
            info!(target: "database_bootstrap", backfilled, "stamped markers without refresh time");
        }

        let db = Arc::new(Mutex::new(connection));
        let coordinator = Arc::new(RefreshCoordinator::new(db.clone(), extractor, &config));
        let monitor = Arc::new(MonitorLoop::new(
            db.clone(),
            coordinator.clone(),
            config.monitor_poll_interval(),
        ));
        let (warmup, warmup_jobs) = WarmupQueue::new();
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            db,
            db_path: path,
            config,
            coordinator,
            monitor,
            warmup,
            warmup_jobs: Mutex::new(Some(warmup_jobs)),
            shutdown,
        })
    }

    /// Spawns the monitor loop and the warmup worker. Both stop on `shutdown`.
    pub fn start_background(&self) -> AppResult<BackgroundTasks> {
        let jobs = self
            .warmup_jobs
            .lock()
            .take()
            .ok_or_else(|| AppError::Config("background tasks already started".into()))?;

        let monitor = {
            let monitor = self.monitor.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };
        let warmup = tokio::spawn(warmup::run_worker(
            self.db.clone(),
            self.coordinator.clone(),
            jobs,
            self.shutdown.subscribe(),
        ));
        Ok(BackgroundTasks { monitor, warmup })
    }

    pub fn shutdown(&self) {
        if self.shutdown.send(()).is_err() {
            warn!("shutdown requested with no background tasks listening");
        }
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            db_path: self.db_path.to_string_lossy().to_string(),
            monitor_state: self.monitor.state(),
            supported_locales: locales::all(),
            config: self.config.public_profile(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Arc<RefreshCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn monitor(&self) -> Arc<MonitorLoop> {
        Arc::clone(&self.monitor)
    }

    pub fn connection(&self) -> Arc<Mutex<SqlConnection>> {
        Arc::clone(&self.db)
    }

    pub(crate) fn warmup(&self) -> &WarmupQueue {
        &self.warmup
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_reviews=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
