//! Demo worker: the in-memory stack driven by the maintenance runner.
//!
//! Submits a plain bulk-delete job and a gated bulk-export job with a reduction
//! step, then waits for both to finish.

mod executor;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde_json::json;
use tracing::info;

use stepgate_channel::{InMemoryWorkChannel, JobWorkNotification, WorkChannel};
use stepgate_core::{InstanceId, InstanceStatus, JobDefinition, JobInstance, StepId, WorkChunk};
use stepgate_infra::config::MAINTENANCE_INTERVAL_ENV;
use stepgate_infra::{
    InMemoryJobPersistence, JobDefinitionRegistry, JobInstanceProcessor, JobPersistence,
    LocalReductionExecutor, MaintenanceConfig, MaintenanceRunner,
};

const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    stepgate_observability::init();

    let mut config = MaintenanceConfig::from_env()?.with_name("demo-maintenance");
    if std::env::var(MAINTENANCE_INTERVAL_ENV).is_err() {
        config = config.with_maintenance_interval(Duration::from_millis(200));
    }

    let bulk_delete = JobDefinition::builder("bulk-delete", 1)
        .add_step("find")
        .add_step("delete")
        .build()?;
    let bulk_export = JobDefinition::builder("bulk-export", 1)
        .gated_execution()
        .add_step("generate")
        .add_reduction_step("report")
        .build()?;

    let registry = Arc::new(JobDefinitionRegistry::new());
    registry.register(bulk_delete.clone())?;
    registry.register(bulk_export.clone())?;

    let store = InMemoryJobPersistence::arc();
    let channel = Arc::new(InMemoryWorkChannel::<JobWorkNotification>::new());

    let mut reduction = LocalReductionExecutor::new(Arc::clone(&store));
    reduction.register_reducer("bulk-export", |instance, chunks| {
        let rows: i64 = chunks
            .iter()
            .filter_map(|c| c.data.as_ref()?.get("rows")?.as_i64())
            .sum();
        Ok(json!({ "instance": instance.instance_id, "files": chunks.len(), "rows": rows }))
    });

    let processor = Arc::new(JobInstanceProcessor::new(
        Arc::clone(&store),
        Arc::clone(&channel),
        registry,
        reduction,
        config,
    ));

    let step_executor = executor::spawn(Arc::clone(&store), channel.subscribe())
        .context("failed to spawn step executor")?;

    let delete_id = submit_bulk_delete(&store, &bulk_delete)?;
    let export_id = submit_bulk_export(&store, &bulk_export)?;

    let runner = MaintenanceRunner::spawn(processor).context("failed to spawn maintenance runner")?;

    let outcome = wait_for(&store, &[&delete_id, &export_id]);
    let stats = runner.stats();
    runner.shutdown();
    step_executor.shutdown();
    let finished = outcome?;

    for instance in finished {
        info!(
            instance_id = %instance.instance_id,
            job = %instance.job_definition_id,
            status = %instance.status,
            progress = instance.progress,
            report = instance.report.as_deref().unwrap_or("-"),
            "job finished"
        );
    }
    info!(
        passes = stats.passes,
        instances_processed = stats.instances_processed,
        notifications = channel.published_count(),
        "demo complete"
    );
    Ok(())
}

fn submit_bulk_delete(
    store: &InMemoryJobPersistence,
    definition: &JobDefinition,
) -> anyhow::Result<InstanceId> {
    let id = store.store_new_instance(JobInstance::new(definition))?;
    for seq in 0..3 {
        store.store_work_chunk(WorkChunk::ready(
            id.clone(),
            StepId::from("find"),
            seq,
            Some(json!({ "query": format!("Patient?_lastUpdated=lt2020&_page={seq}") })),
        ))?;
    }
    info!(instance_id = %id, "bulk delete submitted");
    Ok(id)
}

fn submit_bulk_export(
    store: &InMemoryJobPersistence,
    definition: &JobDefinition,
) -> anyhow::Result<InstanceId> {
    let mut instance = JobInstance::new(definition);
    instance.update_status(InstanceStatus::InProgress);
    let id = store.store_new_instance(instance)?;
    for (seq, rows) in [120, 80, 45, 300].into_iter().enumerate() {
        store.store_work_chunk(WorkChunk::ready(
            id.clone(),
            StepId::from("report"),
            seq as u32,
            Some(json!({ "rows": rows })),
        ))?;
    }
    info!(instance_id = %id, "bulk export submitted");
    Ok(id)
}

fn wait_for(
    store: &InMemoryJobPersistence,
    ids: &[&InstanceId],
) -> anyhow::Result<Vec<JobInstance>> {
    let deadline = Instant::now() + DEMO_TIMEOUT;
    loop {
        let mut finished = Vec::with_capacity(ids.len());
        for id in ids {
            match store.fetch_instance(id)? {
                Some(instance) if instance.is_finished() => finished.push(instance),
                Some(_) => {}
                None => bail!("job instance {id} vanished before finishing"),
            }
        }
        if finished.len() == ids.len() {
            return Ok(finished);
        }
        if Instant::now() >= deadline {
            bail!("jobs did not finish within {DEMO_TIMEOUT:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}
