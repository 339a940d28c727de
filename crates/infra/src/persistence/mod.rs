//! Job persistence: the storage port plus its backends.

pub mod in_memory;
pub mod port;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryJobPersistence;
pub use port::{ChunkStream, JobPersistence, MAX_UPDATE_ATTEMPTS, PersistenceError};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobPersistence;
