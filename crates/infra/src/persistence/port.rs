use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use stepgate_core::{
    ChunkId, ExpectedVersion, InstanceId, JobInstance, StepId, WorkChunk, WorkChunkStatus,
};

/// Number of read-mutate-swap rounds `update_instance` attempts before giving up.
pub const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Chunks read inside one storage transaction.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = WorkChunk> + Send + 'a>;

/// Persistence operation error.
///
/// Infrastructure errors (storage, concurrency, integrity) as opposed to domain
/// errors. Connectivity failures surface as `Storage` and propagate out of the
/// maintenance pass unchanged.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("job instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("work chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("illegal work chunk transition {from} -> {to} for chunk {chunk_id}")]
    IllegalChunkTransition {
        chunk_id: ChunkId,
        from: WorkChunkStatus,
        to: WorkChunkStatus,
    },

    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable store for job instances and their work chunks.
///
/// ## Atomicity contract
///
/// - `replace_instance` is a compare-and-swap on the row version: exactly one of
///   several writers holding the same version succeeds.
/// - `transition_chunk` is a single conditional update keyed by chunk id and
///   expected prior status; it never reads and then writes separately.
/// - Purges are idempotent; purging something already gone is not an error.
pub trait JobPersistence: Send + Sync {
    /// Insert a new instance. The stored row starts at version 0.
    fn store_new_instance(&self, instance: JobInstance) -> Result<InstanceId, PersistenceError>;

    fn fetch_instance(&self, instance_id: &InstanceId)
    -> Result<Option<JobInstance>, PersistenceError>;

    /// Ids of every stored instance, oldest first.
    fn fetch_instance_ids(&self) -> Result<Vec<InstanceId>, PersistenceError>;

    /// Write `instance` if the stored row is still at `expected`.
    ///
    /// Returns `false` (writing nothing) when the version moved or the row is gone.
    /// On success the stored version is bumped by one.
    fn replace_instance(
        &self,
        instance: &JobInstance,
        expected: ExpectedVersion,
    ) -> Result<bool, PersistenceError>;

    /// Insert a new chunk for an existing instance.
    fn store_work_chunk(&self, chunk: WorkChunk) -> Result<ChunkId, PersistenceError>;

    fn fetch_work_chunk(&self, chunk_id: &ChunkId) -> Result<Option<WorkChunk>, PersistenceError>;

    /// Stream the instance's chunks whose status is in `states`, in creation order.
    fn fetch_chunks_in_states<'a>(
        &'a self,
        instance_id: &InstanceId,
        states: &[WorkChunkStatus],
    ) -> Result<ChunkStream<'a>, PersistenceError>;

    fn fetch_all_chunks(&self, instance_id: &InstanceId) -> Result<Vec<WorkChunk>, PersistenceError>;

    /// Atomically move one chunk from `from` to `to`. Returns rows affected (0 or 1).
    ///
    /// Zero means the chunk is gone or no longer in `from`. A transition outside the
    /// chunk transition table is an error.
    fn transition_chunk(
        &self,
        chunk_id: &ChunkId,
        from: WorkChunkStatus,
        to: WorkChunkStatus,
        error_message: Option<String>,
    ) -> Result<usize, PersistenceError>;

    fn distinct_chunk_statuses(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<BTreeSet<WorkChunkStatus>, PersistenceError>;

    /// Delete every chunk of the instance and mark the instance as purged.
    fn purge_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError>;

    /// Delete the instance row and all of its chunks.
    fn purge_instance_and_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError>;

    fn fetch_ready_chunks<'a>(
        &'a self,
        instance_id: &InstanceId,
    ) -> Result<ChunkStream<'a>, PersistenceError> {
        self.fetch_chunks_in_states(instance_id, &[WorkChunkStatus::Ready])
    }

    /// Claim a chunk: atomic `Ready -> Queued`.
    fn claim_chunk(&self, chunk_id: &ChunkId) -> Result<usize, PersistenceError> {
        self.transition_chunk(chunk_id, WorkChunkStatus::Ready, WorkChunkStatus::Queued, None)
    }

    /// Apply `mutate` to the currently persisted row and write it back conditionally.
    ///
    /// `mutate` returns whether it changed anything; when it returns `false` nothing
    /// is written. If another writer got in between the read and the write, the row
    /// is re-read and `mutate` re-applied to the fresh state, so a racing caller sees
    /// the winner's write and typically decides there is nothing left to change.
    ///
    /// Returns `Ok(false)` for a vanished instance.
    fn update_instance(
        &self,
        instance_id: &InstanceId,
        mutate: &mut dyn FnMut(&mut JobInstance) -> bool,
    ) -> Result<bool, PersistenceError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.fetch_instance(instance_id)? else {
                return Ok(false);
            };

            let expected = ExpectedVersion::Exact(current.version);
            let mut candidate = current;
            if !mutate(&mut candidate) {
                return Ok(false);
            }

            if self.replace_instance(&candidate, expected)? {
                return Ok(true);
            }

            debug!(
                instance_id = %instance_id,
                attempt,
                "instance version moved during update; retrying"
            );
        }

        Err(PersistenceError::Conflict(format!(
            "instance {instance_id} still contended after {MAX_UPDATE_ATTEMPTS} attempts"
        )))
    }
}

impl<S> JobPersistence for Arc<S>
where
    S: JobPersistence + ?Sized,
{
    fn store_new_instance(&self, instance: JobInstance) -> Result<InstanceId, PersistenceError> {
        (**self).store_new_instance(instance)
    }

    fn fetch_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<JobInstance>, PersistenceError> {
        (**self).fetch_instance(instance_id)
    }

    fn fetch_instance_ids(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        (**self).fetch_instance_ids()
    }

    fn replace_instance(
        &self,
        instance: &JobInstance,
        expected: ExpectedVersion,
    ) -> Result<bool, PersistenceError> {
        (**self).replace_instance(instance, expected)
    }

    fn store_work_chunk(&self, chunk: WorkChunk) -> Result<ChunkId, PersistenceError> {
        (**self).store_work_chunk(chunk)
    }

    fn fetch_work_chunk(&self, chunk_id: &ChunkId) -> Result<Option<WorkChunk>, PersistenceError> {
        (**self).fetch_work_chunk(chunk_id)
    }

    fn fetch_chunks_in_states<'a>(
        &'a self,
        instance_id: &InstanceId,
        states: &[WorkChunkStatus],
    ) -> Result<ChunkStream<'a>, PersistenceError> {
        (**self).fetch_chunks_in_states(instance_id, states)
    }

    fn fetch_all_chunks(&self, instance_id: &InstanceId) -> Result<Vec<WorkChunk>, PersistenceError> {
        (**self).fetch_all_chunks(instance_id)
    }

    fn transition_chunk(
        &self,
        chunk_id: &ChunkId,
        from: WorkChunkStatus,
        to: WorkChunkStatus,
        error_message: Option<String>,
    ) -> Result<usize, PersistenceError> {
        (**self).transition_chunk(chunk_id, from, to, error_message)
    }

    fn distinct_chunk_statuses(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<BTreeSet<WorkChunkStatus>, PersistenceError> {
        (**self).distinct_chunk_statuses(instance_id, step_id)
    }

    fn purge_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        (**self).purge_chunks(instance_id)
    }

    fn purge_instance_and_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        (**self).purge_instance_and_chunks(instance_id)
    }

    fn claim_chunk(&self, chunk_id: &ChunkId) -> Result<usize, PersistenceError> {
        (**self).claim_chunk(chunk_id)
    }

    fn update_instance(
        &self,
        instance_id: &InstanceId,
        mutate: &mut dyn FnMut(&mut JobInstance) -> bool,
    ) -> Result<bool, PersistenceError> {
        (**self).update_instance(instance_id, mutate)
    }
}
