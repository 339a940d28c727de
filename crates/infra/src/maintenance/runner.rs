use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use stepgate_channel::{JobWorkNotification, WorkChannel};

use super::processor::JobInstanceProcessor;
use crate::persistence::JobPersistence;
use crate::reduction::ReductionStepExecutor;

/// Runner statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunnerStats {
    pub passes: u64,
    pub instances_processed: u64,
    pub instance_failures: u64,
    pub listing_failures: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

/// Handle for the running maintenance runner (shutdown + trigger hook).
#[derive(Debug)]
pub struct MaintenanceRunnerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl MaintenanceRunnerHandle {
    /// Request a pass ahead of schedule.
    ///
    /// Triggers are coalesced: if a pass is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Gracefully stop the runner thread. An in-flight pass finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Background driver running a maintenance pass over every instance on a timer.
pub struct MaintenanceRunner;

impl MaintenanceRunner {
    /// Spawn the runner thread.
    ///
    /// - Schedule: one pass on startup, then every `maintenance_interval`
    /// - Trigger: `handle.trigger()` requests an extra pass
    /// - Failures: logged per instance; never stop the runner
    pub fn spawn<P, C, R>(
        processor: Arc<JobInstanceProcessor<P, C, R>>,
    ) -> std::io::Result<MaintenanceRunnerHandle>
    where
        P: JobPersistence + Clone + 'static,
        C: WorkChannel<JobWorkNotification> + 'static,
        R: ReductionStepExecutor + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let stats = Arc::new(Mutex::new(RunnerStats::default()));

        let name = processor.config().name.clone();
        let loop_stats = Arc::clone(&stats);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || runner_loop(processor, shutdown_rx, trigger_rx, loop_stats))?;

        Ok(MaintenanceRunnerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
            stats,
        })
    }
}

fn runner_loop<P, C, R>(
    processor: Arc<JobInstanceProcessor<P, C, R>>,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) where
    P: JobPersistence + Clone,
    C: WorkChannel<JobWorkNotification>,
    R: ReductionStepExecutor,
{
    let name = processor.config().name.clone();
    let interval = processor.config().maintenance_interval;
    info!(runner = %name, interval_ms = interval.as_millis() as u64, "maintenance runner started");

    let mut next_tick = Instant::now() + interval;
    let mut pending = true; // run once on startup

    loop {
        // Shutdown has priority.
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if a pass overran.
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(50));
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        let outcome = processor.process_all();
        let Ok(mut stats) = stats.lock() else {
            error!(runner = %name, "runner stats lock poisoned; stopping");
            break;
        };
        stats.passes += 1;
        stats.last_pass_at = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                stats.instances_processed += summary.processed as u64;
                stats.instance_failures += summary.failed as u64;
                if summary.failed > 0 {
                    warn!(
                        runner = %name,
                        processed = summary.processed,
                        failed = summary.failed,
                        "maintenance pass finished with failures"
                    );
                }
            }
            Err(e) => {
                stats.listing_failures += 1;
                error!(runner = %name, error = %e, "failed to list job instances");
            }
        }
    }

    info!(runner = %name, "maintenance runner stopped");
}
