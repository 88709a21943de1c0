use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::db;
use crate::errors::AppResult;
use crate::targets::{self, ScheduledTarget};
use crate::view::ReviewQuery;

pub use crate::targets::is_due;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Sleeping,
    Scanning,
    Refreshing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub due: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Periodically force-refreshes monitored places and active review instances
/// whose interval has elapsed.
pub struct MonitorLoop {
    db: Arc<Mutex<Connection>>,
    coordinator: Arc<RefreshCoordinator>,
    poll_interval: Duration,
    state: Mutex<MonitorState>,
}

impl MonitorLoop {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        coordinator: Arc<RefreshCoordinator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            coordinator,
            poll_interval,
            state: Mutex::new(MonitorState::Sleeping),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.lock() = state;
    }

    /// Scans on every tick until `shutdown` fires or its sender is dropped.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            target: "monitor",
            poll_seconds = self.poll_interval.as_secs(),
            "monitor loop started"
        );
        loop {
            match self.scan_once(db::now()).await {
                Ok(report) if report.due > 0 => info!(
                    target: "monitor",
                    due = report.due,
                    refreshed = report.refreshed,
                    failed = report.failed,
                    "monitor scan finished"
                ),
                Ok(_) => debug!(target: "monitor", "no targets due"),
                Err(err) => warn!(target: "monitor", ?err, "monitor scan failed"),
            }
            self.set_state(MonitorState::Sleeping);

            tokio::select! {
                _ = shutdown.recv() => {
                    info!(target: "monitor", "monitor loop stopping");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Refreshes every target due at `now`. A failing target is logged and still
    /// gets its `last_run` stamped so it waits a full interval before retrying.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> AppResult<ScanReport> {
        self.set_state(MonitorState::Scanning);
        let due: Vec<ScheduledTarget> = {
            let conn = self.db.lock();
            targets::scheduled_targets(&conn)?
        }
        .into_iter()
        .filter(|target| target.is_due(now))
        .collect();

        let mut report = ScanReport {
            due: due.len(),
            ..ScanReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        self.set_state(MonitorState::Refreshing);
        for target in due {
            let locales = targets::normalize_locales(&target.locales);
            let outcome = self
                .coordinator
                .resolve_locales(&target.place_url, &locales, true, &ReviewQuery::BROADEST)
                .await;
            match outcome {
                Ok(_) => {
                    report.refreshed += 1;
                    debug!(
                        target: "monitor",
                        kind = ?target.kind,
                        id = target.id,
                        place = %target.place_url,
                        "target refreshed"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "monitor",
                        kind = ?target.kind,
                        id = target.id,
                        place = %target.place_url,
                        ?err,
                        "target refresh failed"
                    );
                }
            }

            let recorded = {
                let conn = self.db.lock();
                targets::record_run(&conn, target.kind, target.id, db::now())
            };
            if let Err(err) = recorded {
                warn!(target: "monitor", id = target.id, ?err, "failed to record target run");
            }
        }
        Ok(report)
    }
}

/// Keeps retrying a forced refresh of `locales` every `delay` until one attempt
/// succeeds. The first attempt also waits `delay`.
pub fn schedule_retry(
    coordinator: Arc<RefreshCoordinator>,
    place_url: String,
    locales: Vec<String>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(delay).await;
            attempt += 1;
            match coordinator
                .resolve_locales(&place_url, &locales, true, &ReviewQuery::BROADEST)
                .await
            {
                Ok(_) => {
                    info!(target: "monitor", place = %place_url, attempt, "retry succeeded");
                    break;
                }
                Err(err) => {
                    warn!(target: "monitor", place = %place_url, attempt, ?err, "retry failed");
                }
            }
        }
    })
}
