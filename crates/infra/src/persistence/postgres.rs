//! Postgres-backed job persistence.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | PersistenceError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `InstanceNotFound` (chunk inserts only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! ## Concurrency
//!
//! Instance writes are conditional on `version`; chunk transitions are a single
//! `UPDATE .. WHERE id = $1 AND status = $2`. Neither reads before writing.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};

use stepgate_core::{
    ChunkId, ExpectedVersion, InstanceId, InstanceStatus, JobInstance, StepId, WorkChunk,
    WorkChunkStatus,
};

use super::port::{ChunkStream, JobPersistence, PersistenceError};

/// Table definitions expected by [`PostgresJobPersistence`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_job_instance (
    instance_id                   TEXT PRIMARY KEY,
    job_definition_id             TEXT NOT NULL,
    job_definition_version        INTEGER NOT NULL,
    status                        TEXT NOT NULL,
    current_gated_step_id         TEXT,
    pending_cancellation_request  BOOLEAN NOT NULL DEFAULT FALSE,
    error_message                 TEXT,
    created_at                    TIMESTAMPTZ NOT NULL,
    start_time                    TIMESTAMPTZ,
    end_time                      TIMESTAMPTZ,
    work_chunks_purged            BOOLEAN NOT NULL DEFAULT FALSE,
    progress                      DOUBLE PRECISION NOT NULL DEFAULT 0,
    error_count                   INTEGER NOT NULL DEFAULT 0,
    report                        TEXT,
    version                       BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS batch_work_chunk (
    id              TEXT PRIMARY KEY,
    instance_id     TEXT NOT NULL REFERENCES batch_job_instance (instance_id) ON DELETE CASCADE,
    target_step_id  TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    status          TEXT NOT NULL,
    data            JSONB,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    position        BIGSERIAL
);

CREATE INDEX IF NOT EXISTS batch_work_chunk_instance_step_status
    ON batch_work_chunk (instance_id, target_step_id, status);
"#;

const INSTANCE_COLUMNS: &str = "instance_id, job_definition_id, job_definition_version, status, \
     current_gated_step_id, pending_cancellation_request, error_message, created_at, start_time, \
     end_time, work_chunks_purged, progress, error_count, report, version";

/// Rows per keyset page when streaming chunks.
const CHUNK_PAGE_SIZE: i64 = 256;

const CHUNK_COLUMNS: &str =
    "id, instance_id, target_step_id, sequence, status, data, error_message, created_at, updated_at";

/// Postgres-backed [`JobPersistence`].
///
/// The port is synchronous; every call blocks on the ambient tokio runtime, so it
/// must be invoked from a thread that can enter one (e.g. inside `spawn_blocking`).
#[derive(Debug, Clone)]
pub struct PostgresJobPersistence {
    pool: Arc<PgPool>,
}

impl PostgresJobPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the tables if they are missing.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, PersistenceError>
    where
        F: std::future::Future<Output = Result<T, PersistenceError>>,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            PersistenceError::Storage(
                "PostgresJobPersistence requires a tokio runtime context".to_string(),
            )
        })?;
        handle.block_on(fut)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id), err)]
    async fn insert_instance(&self, instance: &JobInstance) -> Result<(), PersistenceError> {
        sqlx::query(&format!(
            "INSERT INTO batch_job_instance ({INSTANCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0)"
        ))
        .bind(instance.instance_id.as_str())
        .bind(&instance.job_definition_id)
        .bind(instance.job_definition_version as i32)
        .bind(instance.status.as_str())
        .bind(instance.current_gated_step_id.as_ref().map(|s| s.as_str()))
        .bind(instance.pending_cancellation_request)
        .bind(instance.error_message.as_deref())
        .bind(instance.created_at)
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.work_chunks_purged)
        .bind(instance.progress)
        .bind(instance.error_count as i32)
        .bind(instance.report.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_instance", e))?;
        Ok(())
    }

    async fn select_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<JobInstance>, PersistenceError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM batch_job_instance WHERE instance_id = $1"
        ))
        .bind(instance_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_instance", e))?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn select_instance_ids(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT instance_id FROM batch_job_instance ORDER BY created_at ASC, instance_id ASC",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_instance_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("instance_id")
                    .map(InstanceId::from)
                    .map_err(|e| map_sqlx_error("fetch_instance_ids", e))
            })
            .collect()
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id), err)]
    async fn update_instance_row(
        &self,
        instance: &JobInstance,
        expected: ExpectedVersion,
    ) -> Result<bool, PersistenceError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let result = sqlx::query(
            r#"
            UPDATE batch_job_instance SET
                status = $2,
                current_gated_step_id = $3,
                pending_cancellation_request = $4,
                error_message = $5,
                start_time = $6,
                end_time = $7,
                work_chunks_purged = $8,
                progress = $9,
                error_count = $10,
                report = $11,
                version = version + 1
            WHERE instance_id = $1 AND ($12::bigint IS NULL OR version = $12)
            "#,
        )
        .bind(instance.instance_id.as_str())
        .bind(instance.status.as_str())
        .bind(instance.current_gated_step_id.as_ref().map(|s| s.as_str()))
        .bind(instance.pending_cancellation_request)
        .bind(instance.error_message.as_deref())
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.work_chunks_purged)
        .bind(instance.progress)
        .bind(instance.error_count as i32)
        .bind(instance.report.as_deref())
        .bind(expected_version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("replace_instance", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_chunk(&self, chunk: &WorkChunk) -> Result<(), PersistenceError> {
        sqlx::query(&format!(
            "INSERT INTO batch_work_chunk ({CHUNK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())"
        ))
        .bind(chunk.id.as_str())
        .bind(chunk.instance_id.as_str())
        .bind(chunk.target_step_id.as_str())
        .bind(chunk.sequence as i32)
        .bind(chunk.status.as_str())
        .bind(chunk.data.clone())
        .bind(chunk.error_message.as_deref())
        .bind(chunk.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match foreign_key_violation(&e) {
            true => PersistenceError::InstanceNotFound(chunk.instance_id.clone()),
            false => map_sqlx_error("store_work_chunk", e),
        })?;
        Ok(())
    }

    async fn select_chunk(&self, chunk_id: &ChunkId) -> Result<Option<WorkChunk>, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM batch_work_chunk WHERE id = $1"))
            .bind(chunk_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_work_chunk", e))?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn select_chunk_page(
        &self,
        instance_id: &InstanceId,
        states: &[String],
        after: i64,
    ) -> Result<Vec<(i64, WorkChunk)>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS}, position FROM batch_work_chunk \
             WHERE instance_id = $1 AND status = ANY($2) AND position > $3 \
             ORDER BY position ASC LIMIT $4"
        ))
        .bind(instance_id.as_str())
        .bind(states)
        .bind(after)
        .bind(CHUNK_PAGE_SIZE)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_chunk_page", e))?;

        rows.iter()
            .map(|row| {
                let position: i64 = row
                    .try_get("position")
                    .map_err(|e| map_sqlx_error("decode_chunk", e))?;
                Ok((position, chunk_from_row(row)?))
            })
            .collect()
    }

    async fn select_chunks(&self, instance_id: &InstanceId) -> Result<Vec<WorkChunk>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM batch_work_chunk \
             WHERE instance_id = $1 ORDER BY position ASC"
        ))
        .bind(instance_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_chunks", e))?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn update_chunk_status(
        &self,
        chunk_id: &ChunkId,
        from: WorkChunkStatus,
        to: WorkChunkStatus,
        error_message: Option<String>,
    ) -> Result<usize, PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_work_chunk
            SET status = $3, updated_at = NOW(), error_message = COALESCE($4, error_message)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(chunk_id.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_chunk", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn select_distinct_statuses(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<BTreeSet<WorkChunkStatus>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT DISTINCT status FROM batch_work_chunk WHERE instance_id = $1 AND target_step_id = $2",
        )
        .bind(instance_id.as_str())
        .bind(step_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("distinct_chunk_statuses", e))?;

        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("distinct_chunk_statuses", e))?;
                parse_column(&raw)
            })
            .collect()
    }

    async fn delete_chunks(&self, instance_id: &InstanceId, drop_instance: bool) -> Result<(), PersistenceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM batch_work_chunk WHERE instance_id = $1")
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_chunks", e))?;

        let instance_sql = if drop_instance {
            "DELETE FROM batch_job_instance WHERE instance_id = $1"
        } else {
            "UPDATE batch_job_instance SET work_chunks_purged = TRUE, version = version + 1 \
             WHERE instance_id = $1 AND NOT work_chunks_purged"
        };
        sqlx::query(instance_sql)
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_instance", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

impl JobPersistence for PostgresJobPersistence {
    fn store_new_instance(&self, instance: JobInstance) -> Result<InstanceId, PersistenceError> {
        self.block_on(self.insert_instance(&instance))?;
        Ok(instance.instance_id)
    }

    fn fetch_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<JobInstance>, PersistenceError> {
        self.block_on(self.select_instance(instance_id))
    }

    fn fetch_instance_ids(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        self.block_on(self.select_instance_ids())
    }

    fn replace_instance(
        &self,
        instance: &JobInstance,
        expected: ExpectedVersion,
    ) -> Result<bool, PersistenceError> {
        self.block_on(self.update_instance_row(instance, expected))
    }

    fn store_work_chunk(&self, chunk: WorkChunk) -> Result<ChunkId, PersistenceError> {
        self.block_on(self.insert_chunk(&chunk))?;
        Ok(chunk.id)
    }

    fn fetch_work_chunk(&self, chunk_id: &ChunkId) -> Result<Option<WorkChunk>, PersistenceError> {
        self.block_on(self.select_chunk(chunk_id))
    }

    fn fetch_chunks_in_states<'a>(
        &'a self,
        instance_id: &InstanceId,
        states: &[WorkChunkStatus],
    ) -> Result<ChunkStream<'a>, PersistenceError> {
        let mut pages = ChunkPages {
            store: self,
            instance_id: instance_id.clone(),
            states: states.iter().map(|s| s.as_str().to_string()).collect(),
            after: 0,
            page: Vec::new().into_iter(),
            exhausted: false,
        };
        // The first page is read up front so a failing query fails the caller.
        let first = self.block_on(self.select_chunk_page(instance_id, &pages.states, 0))?;
        pages.load(first);
        Ok(Box::new(pages))
    }

    fn fetch_all_chunks(&self, instance_id: &InstanceId) -> Result<Vec<WorkChunk>, PersistenceError> {
        self.block_on(self.select_chunks(instance_id))
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
        self.block_on(self.update_chunk_status(chunk_id, from, to, error_message))
    }

    fn distinct_chunk_statuses(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<BTreeSet<WorkChunkStatus>, PersistenceError> {
        self.block_on(self.select_distinct_statuses(instance_id, step_id))
    }

    fn purge_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        self.block_on(self.delete_chunks(instance_id, false))
    }

    fn purge_instance_and_chunks(&self, instance_id: &InstanceId) -> Result<(), PersistenceError> {
        self.block_on(self.delete_chunks(instance_id, true))
    }
}

fn parse_column<T>(raw: &str) -> Result<T, PersistenceError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| PersistenceError::Storage(format!("corrupt column value '{raw}': {e}")))
}

fn instance_from_row(row: &PgRow) -> Result<JobInstance, PersistenceError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_instance", e);

    let status: String = row.try_get("status").map_err(get)?;
    let status: InstanceStatus = parse_column(&status)?;
    let gated: Option<String> = row.try_get("current_gated_step_id").map_err(get)?;
    let definition_version: i32 = row.try_get("job_definition_version").map_err(get)?;
    let error_count: i32 = row.try_get("error_count").map_err(get)?;
    let version: i64 = row.try_get("version").map_err(get)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(get)?;

    Ok(JobInstance {
        instance_id: InstanceId::from(row.try_get::<String, _>("instance_id").map_err(get)?),
        job_definition_id: row.try_get("job_definition_id").map_err(get)?,
        job_definition_version: definition_version as u32,
        status,
        current_gated_step_id: gated.map(StepId::from),
        pending_cancellation_request: row.try_get("pending_cancellation_request").map_err(get)?,
        error_message: row.try_get("error_message").map_err(get)?,
        created_at,
        start_time: row.try_get("start_time").map_err(get)?,
        end_time: row.try_get("end_time").map_err(get)?,
        work_chunks_purged: row.try_get("work_chunks_purged").map_err(get)?,
        progress: row.try_get("progress").map_err(get)?,
        error_count: error_count as u32,
        report: row.try_get("report").map_err(get)?,
        version: version as u64,
    })
}

/// Chunks streamed page by page in `position` order.
///
/// A page that fails to load after the first ends the stream early; the rows it
/// would have held are picked up by the next maintenance pass.
struct ChunkPages<'a> {
    store: &'a PostgresJobPersistence,
    instance_id: InstanceId,
    states: Vec<String>,
    after: i64,
    page: std::vec::IntoIter<WorkChunk>,
    exhausted: bool,
}

impl ChunkPages<'_> {
    fn load(&mut self, rows: Vec<(i64, WorkChunk)>) {
        let (after, exhausted) = next_page_cursor(&rows, self.after);
        self.after = after;
        self.exhausted = exhausted;
        self.page = rows
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect::<Vec<_>>()
            .into_iter();
    }
}

impl Iterator for ChunkPages<'_> {
    type Item = WorkChunk;

    fn next(&mut self) -> Option<WorkChunk> {
        loop {
            if let Some(chunk) = self.page.next() {
                return Some(chunk);
            }
            if self.exhausted {
                return None;
            }
            let page = self.store.block_on(self.store.select_chunk_page(
                &self.instance_id,
                &self.states,
                self.after,
            ));
            match page {
                Ok(rows) => self.load(rows),
                Err(e) => {
                    error!(instance_id = %self.instance_id, error = %e, "chunk page fetch failed; stream ends early");
                    self.exhausted = true;
                }
            }
        }
    }
}

/// Keyset position after `rows`, and whether this was the last page.
fn next_page_cursor(rows: &[(i64, WorkChunk)], after: i64) -> (i64, bool) {
    let last = rows.last().map_or(after, |(position, _)| *position);
    (last, (rows.len() as i64) < CHUNK_PAGE_SIZE)
}

fn chunk_from_row(row: &PgRow) -> Result<WorkChunk, PersistenceError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_chunk", e);

    let status: String = row.try_get("status").map_err(get)?;
    let sequence: i32 = row.try_get("sequence").map_err(get)?;

    Ok(WorkChunk {
        id: ChunkId::from(row.try_get::<String, _>("id").map_err(get)?),
        instance_id: InstanceId::from(row.try_get::<String, _>("instance_id").map_err(get)?),
        target_step_id: StepId::from(row.try_get::<String, _>("target_step_id").map_err(get)?),
        sequence: sequence as u32,
        status: parse_column(&status)?,
        data: row.try_get("data").map_err(get)?,
        error_message: row.try_get("error_message").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23503";
        }
    }
    false
}

/// Map SQLx errors to PersistenceError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => PersistenceError::AlreadyExists(msg),
                _ => PersistenceError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            PersistenceError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => PersistenceError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(positions: impl IntoIterator<Item = i64>) -> Vec<(i64, WorkChunk)> {
        let instance_id = InstanceId::from("instance");
        positions
            .into_iter()
            .map(|p| (p, WorkChunk::ready(instance_id.clone(), StepId::from("s"), p as u32, None)))
            .collect()
    }

    #[test]
    fn full_page_moves_the_cursor_and_asks_for_more() {
        let page = rows(101..101 + CHUNK_PAGE_SIZE);
        assert_eq!(next_page_cursor(&page, 100), (100 + CHUNK_PAGE_SIZE, false));
    }

    #[test]
    fn short_or_empty_page_ends_the_stream() {
        assert_eq!(next_page_cursor(&rows([7, 9]), 3), (9, true));
        assert_eq!(next_page_cursor(&[], 42), (42, true));
    }
}
