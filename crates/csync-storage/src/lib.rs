//! Storage capability used by the reconciler, with Postgres and in-memory backends.

use std::collections::HashMap;

use async_trait::async_trait;
use csync_core::{ChangedRow, EntityKind, ExternalId, NewRow, StorageError, StoredRow};

mod memory;
mod postgres;

pub use memory::{MemoryStore, WriteCall, WriteOp};
pub use postgres::PgStore;

/// Postgres refuses statements carrying more bind parameters than this.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Largest write chunk that fits every kind under [`MAX_BIND_PARAMS`]: one key plus each column.
pub const MAX_ROWS_PER_WRITE: usize = MAX_BIND_PARAMS / (csync_core::MAX_COLUMNS + 1);

/// Entry point to storage: every read and write happens inside a transaction.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError>;
}

/// An open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// One lookup for the whole id set; ids with no row are simply absent from the map.
    async fn find_by_external_ids(
        &mut self,
        kind: EntityKind,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, StoredRow>, StorageError>;

    async fn insert_many(&mut self, kind: EntityKind, rows: &[NewRow]) -> Result<(), StorageError>;

    /// Overwrites `fields` on every row (matched by local id) and bumps `updated_at`.
    async fn update_many(
        &mut self,
        kind: EntityKind,
        rows: &[ChangedRow],
        fields: &[&'static str],
    ) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
