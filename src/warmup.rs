use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::coordinator::RefreshCoordinator;
use crate::db;
use crate::errors::AppResult;
use crate::targets::{self, TargetKind};
use crate::view::ReviewQuery;

const QUEUE_CAPACITY: usize = 64;

/// Fire-and-forget refresh requests for review instances. A submitted id is
/// attempted at most once and never retried.
#[derive(Clone)]
pub struct WarmupQueue {
    sender: mpsc::Sender<i64>,
}

impl WarmupQueue {
    pub fn new() -> (Self, mpsc::Receiver<i64>) {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Returns false when the job was dropped because the queue is full or the
    /// worker is gone.
    pub fn submit(&self, instance_id: i64) -> bool {
        match self.sender.try_send(instance_id) {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "warmup", instance_id, %err, "warmup job dropped");
                false
            }
        }
    }
}

/// Force-refreshes an active instance's locales and stamps its `last_run`.
/// Returns false for inactive instances.
pub async fn warm_instance(
    db: &Arc<Mutex<Connection>>,
    coordinator: &RefreshCoordinator,
    instance_id: i64,
) -> AppResult<bool> {
    let instance = {
        let conn = db.lock();
        targets::instance_by_id(&conn, instance_id)?
    };
    if !instance.active {
        return Ok(false);
    }

    let locales = targets::normalize_locales(&instance.locales);
    coordinator
        .resolve_locales(&instance.place_url, &locales, true, &ReviewQuery::BROADEST)
        .await?;
    {
        let conn = db.lock();
        targets::record_run(&conn, TargetKind::ReviewInstance, instance.id, db::now())?;
    }
    Ok(true)
}

/// Drains the queue until shutdown or until every sender is dropped.
pub async fn run_worker(
    db: Arc<Mutex<Connection>>,
    coordinator: Arc<RefreshCoordinator>,
    mut jobs: mpsc::Receiver<i64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(target: "warmup", "warmup worker started");
    loop {
        let instance_id = tokio::select! {
            _ = shutdown.recv() => break,
            job = jobs.recv() => match job {
                Some(instance_id) => instance_id,
                None => break,
            },
        };
        match warm_instance(&db, &coordinator, instance_id).await {
            Ok(true) => debug!(target: "warmup", instance_id, "instance warmed"),
            Ok(false) => debug!(target: "warmup", instance_id, "instance inactive; skipped"),
            Err(err) => debug!(target: "warmup", instance_id, ?err, "warmup failed"),
        }
    }
    info!(target: "warmup", "warmup worker stopped");
}
