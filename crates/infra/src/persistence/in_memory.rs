use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use stepgate_core::{
    ChunkId, ExpectedVersion, InstanceId, JobInstance, StepId, WorkChunk, WorkChunkStatus,
};

use super::port::{ChunkStream, JobPersistence, PersistenceError};

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<InstanceId, JobInstance>,
    /// Chunk rows keyed by id, tagged with their insertion position.
    chunks: HashMap<ChunkId, (u64, WorkChunk)>,
    next_position: u64,
}

impl Tables {
    fn chunks_of<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> impl Iterator<Item = &'a (u64, WorkChunk)> + 'a {
        self.chunks
            .values()
            .filter(move |(_, chunk)| &chunk.instance_id == instance_id)
    }

    fn sorted_chunks<F>(&self, instance_id: &InstanceId, keep: F) -> Vec<WorkChunk>
    where
        F: Fn(&WorkChunk) -> bool,
    {
        let mut rows: Vec<_> = self
            .chunks_of(instance_id)
            .filter(|(_, chunk)| keep(chunk))
            .collect();
        rows.sort_by_key(|(position, _)| *position);
        rows.into_iter().map(|(_, chunk)| chunk.clone()).collect()
    }
}

/// In-memory job persistence.
///
/// Intended for tests/dev and single-process deployments. A single lock guards both
/// tables, so every operation is atomic with respect to every other.
#[derive(Debug, Default)]
pub struct InMemoryJobPersistence {
    tables: RwLock<Tables>,
}

impl InMemoryJobPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn instance_count(&self) -> usize {
        self.read().map(|t| t.instances.len()).unwrap_or(0)
    }

    pub fn chunk_count(&self, instance_id: &InstanceId) -> usize {
        self.read()
            .map(|t| t.chunks_of(instance_id).count())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, PersistenceError> {
        self.tables
            .read()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, PersistenceError> {
        self.tables
            .write()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))
    }
}

impl JobPersistence for InMemoryJobPersistence {
    fn store_new_instance(&self, mut instance: JobInstance) -> Result<InstanceId, PersistenceError> {
        let mut tables = self.write()?;
        if tables.instances.contains_key(&instance.instance_id) {
            return Err(PersistenceError::AlreadyExists(format!(
                "job instance {}",
                instance.instance_id
            )));
        }
        instance.version = 0;
        let id = instance.instance_id.clone();
        tables.instances.insert(id.clone(), instance);
        Ok(id)
    }

    fn fetch_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<JobInstance>, PersistenceError> {
        Ok(self.read()?.instances.get(instance_id).cloned())
    }

    fn fetch_instance_ids(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let tables = self.read()?;
        let mut rows: Vec<_> = tables.instances.values().collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(rows.into_iter().map(|i| i.instance_id.clone()).collect())
    }

    fn replace_instance(
        &self,
        instance: &JobInstance,
        expected: ExpectedVersion,
    ) -> Result<bool, PersistenceError> {
        let mut tables = self.write()?;
        let Some(row) = tables.instances.get_mut(&instance.instance_id) else {
            return Ok(false);
        };
        if !expected.matches(row.version) {
            return Ok(false);
        }

        let next_version = row.version + 1;
        *row = instance.clone();
        row.version = next_version;
        Ok(true)
    }

    fn store_work_chunk(&self, mut chunk: WorkChunk) -> Result<ChunkId, PersistenceError> {
        let mut tables = self.write()?;
        if !tables.instances.contains_key(&chunk.instance_id) {
            return Err(PersistenceError::InstanceNotFound(chunk.instance_id));
        }
        if tables.chunks.contains_key(&chunk.id) {
            return Err(PersistenceError::AlreadyExists(format!("work chunk {}", chunk.id)));
        }

        chunk.updated_at = Utc::now();
        let id = chunk.id.clone();
        let position = tables.next_position;
        tables.next_position += 1;
        tables.chunks.insert(id.clone(), (position, chunk));
        Ok(id)
    }

    fn fetch_work_chunk(&self, chunk_id: &ChunkId) -> Result<Option<WorkChunk>, PersistenceError> {
        Ok(self.read()?.chunks.get(chunk_id).map(|(_, c)| c.clone()))
    }

    fn fetch_chunks_in_states<'a>(
        &'a self,
        instance_id: &InstanceId,
        states: &[WorkChunkStatus],
    ) -> Result<ChunkStream<'a>, PersistenceError> {
        // Snapshot under the read lock; the caller may write while iterating.
        let rows = self
            .read()?
            .sorted_chunks(instance_id, |chunk| states.contains(&chunk.status));
        Ok(Box::new(rows.into_iter()))
    }

    fn fetch_all_chunks(&self, instance_id: &InstanceId) -> Result<Vec<WorkChunk>, PersistenceError> {
        Ok(self.read()?.sorted_chunks(instance_id, |_| true))
    }

    fn transition_chunk(
        &self,
        chunk_id: &ChunkId,
        from: WorkChunkStatus,
        to: WorkChunkStatus,
        error_message: Option<String>,
    ) -> Result<usize, PersistenceError> {
        if !from.can_transition_to(to) {
            return Err(PersistenceError::IllegalChunkTransition {
                chunk_id: chunk_id.clone(),
                from,
                to,
            });
        }

        let mut tables = self.write()?;
        let Some((_, chunk)) = tables.chunks.get_mut(chunk_id) else {
            return Ok(0);
        };
        if chunk.status != from {
            return Ok(0);
        }

        chunk.status = to;
        chunk.updated_at = Utc::now();
        if error_message.is_some() {
            chunk.error_message = error_message;
        }
        Ok(1)
    }

    fn distinct_chunk_statuses(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<BTreeSet<WorkChunkStatus>, PersistenceError> {
        let tables = self.read()?;
        Ok(tables
            .chunks_of(instance_id)
            .filter(|(_, chunk)| &chunk.target_step_id == step_id)
            .map(|(_, chunk)| chunk.status)
            .collect())
    }

    fn purge_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        let mut tables = self.write()?;
        tables
            .chunks
            .retain(|_, (_, chunk)| &chunk.instance_id != instance_id);
        if let Some(instance) = tables.instances.get_mut(instance_id) {
            if !instance.work_chunks_purged {
                instance.work_chunks_purged = true;
                instance.version += 1;
            }
        }
        Ok(())
    }

    fn purge_instance_and_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        let mut tables = self.write()?;
        tables
            .chunks
            .retain(|_, (_, chunk)| &chunk.instance_id != instance_id);
        tables.instances.remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgate_core::{InstanceStatus, JobDefinition};

    fn definition() -> JobDefinition {
        JobDefinition::builder("bulk-export", 1)
            .add_step("generate")
            .add_step("export")
            .build()
            .unwrap()
    }

    fn seeded() -> (InMemoryJobPersistence, InstanceId) {
        let store = InMemoryJobPersistence::new();
        let id = store.store_new_instance(JobInstance::new(&definition())).unwrap();
        (store, id)
    }

    fn ready_chunk(instance_id: &InstanceId, step: &str, sequence: u32) -> WorkChunk {
        WorkChunk::ready(instance_id.clone(), StepId::from(step), sequence, None)
    }

    #[test]
    fn claim_succeeds_once() {
        let (store, id) = seeded();
        let chunk_id = store.store_work_chunk(ready_chunk(&id, "export", 0)).unwrap();

        assert_eq!(store.claim_chunk(&chunk_id).unwrap(), 1);
        assert_eq!(store.claim_chunk(&chunk_id).unwrap(), 0);
        assert_eq!(
            store.fetch_work_chunk(&chunk_id).unwrap().unwrap().status,
            WorkChunkStatus::Queued
        );
    }

    #[test]
    fn claim_of_missing_chunk_affects_nothing() {
        let (store, _) = seeded();
        assert_eq!(store.claim_chunk(&ChunkId::from("gone")).unwrap(), 0);
    }

    #[test]
    fn backward_transition_is_rejected() {
        let (store, id) = seeded();
        let chunk_id = store.store_work_chunk(ready_chunk(&id, "export", 0)).unwrap();

        let err = store
            .transition_chunk(&chunk_id, WorkChunkStatus::Queued, WorkChunkStatus::Ready, None)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalChunkTransition { .. }));
    }

    #[test]
    fn chunks_require_an_instance() {
        let store = InMemoryJobPersistence::new();
        let err = store
            .store_work_chunk(ready_chunk(&InstanceId::from("nope"), "export", 0))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InstanceNotFound(_)));
    }

    #[test]
    fn stale_version_is_refused() {
        let (store, id) = seeded();
        let mut stale = store.fetch_instance(&id).unwrap().unwrap();

        assert!(
            store
                .update_instance(&id, &mut |row| row.update_status(InstanceStatus::InProgress))
                .unwrap()
        );

        stale.error_message = Some("stale write".to_string());
        assert!(!store.replace_instance(&stale, ExpectedVersion::Exact(0)).unwrap());

        let row = store.fetch_instance(&id).unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.status, InstanceStatus::InProgress);
        assert!(row.error_message.is_none());
    }

    #[test]
    fn update_reports_unchanged_when_mutation_declines() {
        let (store, id) = seeded();
        assert!(!store.update_instance(&id, &mut |_| false).unwrap());
        assert!(!store.update_instance(&InstanceId::from("gone"), &mut |_| true).unwrap());
        assert_eq!(store.fetch_instance(&id).unwrap().unwrap().version, 0);
    }

    #[test]
    fn distinct_statuses_are_scoped_to_step() {
        let (store, id) = seeded();
        let a = store.store_work_chunk(ready_chunk(&id, "generate", 0)).unwrap();
        store.store_work_chunk(ready_chunk(&id, "generate", 1)).unwrap();
        store.store_work_chunk(ready_chunk(&id, "export", 0)).unwrap();
        store.claim_chunk(&a).unwrap();

        let statuses = store
            .distinct_chunk_statuses(&id, &StepId::from("generate"))
            .unwrap();
        assert_eq!(
            statuses,
            BTreeSet::from([WorkChunkStatus::Ready, WorkChunkStatus::Queued])
        );
        assert!(
            store
                .distinct_chunk_statuses(&id, &StepId::from("other"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn ready_chunks_stream_in_creation_order() {
        let (store, id) = seeded();
        for seq in 0..5 {
            store.store_work_chunk(ready_chunk(&id, "export", seq)).unwrap();
        }

        let sequences: Vec<_> = store.fetch_ready_chunks(&id).unwrap().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn purges_are_idempotent() {
        let (store, id) = seeded();
        store.store_work_chunk(ready_chunk(&id, "export", 0)).unwrap();

        store.purge_chunks(&id).unwrap();
        store.purge_chunks(&id).unwrap();
        let row = store.fetch_instance(&id).unwrap().unwrap();
        assert!(row.work_chunks_purged);
        assert_eq!(row.version, 1);
        assert_eq!(store.chunk_count(&id), 0);

        store.purge_instance_and_chunks(&id).unwrap();
        store.purge_instance_and_chunks(&id).unwrap();
        assert!(store.fetch_instance(&id).unwrap().is_none());
        assert_eq!(store.instance_count(), 0);
    }
}
