//! Simulated step executor: consumes work notifications and runs chunks.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use stepgate_channel::{JobWorkNotification, Subscription};
use stepgate_core::{InstanceStatus, StepId, WorkChunk, WorkChunkStatus};
use stepgate_infra::{InMemoryJobPersistence, JobPersistence, PersistenceError};

/// Handle for the executor thread.
pub struct StepExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl StepExecutorHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a worker thread executing every chunk announced on `subscription`.
///
/// `find` chunks emit one `delete` chunk each; every other step just completes.
pub fn spawn(
    store: Arc<InMemoryJobPersistence>,
    subscription: Subscription<JobWorkNotification>,
) -> std::io::Result<StepExecutorHandle> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("step-executor".to_string())
        .spawn(move || {
            while shutdown_rx.try_recv().is_err() {
                let Ok(notification) = subscription.recv_timeout(Duration::from_millis(50)) else {
                    continue;
                };
                if let Err(e) = execute(&store, &notification) {
                    warn!(chunk_id = %notification.chunk_id, error = %e, "chunk execution failed");
                }
            }
        })?;

    Ok(StepExecutorHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn execute(
    store: &InMemoryJobPersistence,
    notification: &JobWorkNotification,
) -> Result<(), PersistenceError> {
    let chunk_id = &notification.chunk_id;

    // Delivery is at-least-once; the chunk row decides whether there is work left.
    if store.transition_chunk(chunk_id, WorkChunkStatus::Queued, WorkChunkStatus::InProgress, None)? == 0 {
        debug!(chunk_id = %chunk_id, "duplicate notification ignored");
        return Ok(());
    }
    store.update_instance(&notification.instance_id, &mut |row| {
        row.update_status(InstanceStatus::InProgress)
    })?;

    thread::sleep(Duration::from_millis(5));

    if notification.target_step_id.as_str() == "find" {
        let Some(chunk) = store.fetch_work_chunk(chunk_id)? else {
            return Ok(());
        };
        store.store_work_chunk(WorkChunk::ready(
            notification.instance_id.clone(),
            StepId::from("delete"),
            chunk.sequence,
            Some(json!({ "matched": chunk.sequence + 1 })),
        ))?;
    }

    store.transition_chunk(chunk_id, WorkChunkStatus::InProgress, WorkChunkStatus::Completed, None)?;
    info!(
        instance_id = %notification.instance_id,
        step_id = %notification.target_step_id,
        chunk_id = %chunk_id,
        "chunk executed"
    );
    Ok(())
}
