//! Chunked bulk writes inside a caller-owned transaction.

use async_trait::async_trait;
use csync_core::{ChangedRow, EntityKind, NewRow, StagedRow, StorageError};
use csync_storage::StoreTransaction;
use tracing::{debug, error};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Largest chunk a single bulk statement can carry.
pub const MAX_CHUNK_SIZE: usize = csync_storage::MAX_ROWS_PER_WRITE;

/// Pins a requested chunk size into `1..=MAX_CHUNK_SIZE`.
pub fn clamp_chunk_size(chunk_size: usize) -> usize {
    chunk_size.clamp(1, MAX_CHUNK_SIZE)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitTotals {
    pub total_inserted: usize,
    pub total_updated: usize,
    /// Chunks committed successfully.
    pub chunks: usize,
}

/// The storage call a committer issues for each chunk.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    type Row: StagedRow;

    fn kind(&self) -> EntityKind;

    fn operation(&self) -> &'static str;

    async fn write_chunk(
        &self,
        tx: &mut dyn StoreTransaction,
        rows: &[Self::Row],
    ) -> Result<(), StorageError>;

    fn tally(&self, totals: &mut CommitTotals, rows: usize);
}

#[derive(Debug, Clone, Copy)]
pub struct InsertWriter {
    kind: EntityKind,
}

impl InsertWriter {
    pub fn new(kind: EntityKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ChunkWriter for InsertWriter {
    type Row = NewRow;

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn operation(&self) -> &'static str {
        "insert"
    }

    async fn write_chunk(
        &self,
        tx: &mut dyn StoreTransaction,
        rows: &[NewRow],
    ) -> Result<(), StorageError> {
        tx.insert_many(self.kind, rows).await
    }

    fn tally(&self, totals: &mut CommitTotals, rows: usize) {
        totals.total_inserted += rows;
    }
}

#[derive(Debug, Clone)]
pub struct UpdateWriter {
    kind: EntityKind,
    fields: Vec<&'static str>,
}

impl UpdateWriter {
    /// Writes every tracked field of the kind.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: kind.tracked_fields(),
        }
    }
}

#[async_trait]
impl ChunkWriter for UpdateWriter {
    type Row = ChangedRow;

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn operation(&self) -> &'static str {
        "update"
    }

    async fn write_chunk(
        &self,
        tx: &mut dyn StoreTransaction,
        rows: &[ChangedRow],
    ) -> Result<(), StorageError> {
        tx.update_many(self.kind, rows, &self.fields).await
    }

    fn tally(&self, totals: &mut CommitTotals, rows: usize) {
        totals.total_updated += rows;
    }
}

/// Buffers staged rows and flushes them in chunks of at most `chunk_size`.
///
/// Every row passed to [`add`](Self::add) reaches exactly one `write_chunk` call, in order,
/// once [`done`](Self::done) has run. A chunk leaves the buffer before it is written, so a
/// failed chunk is not retried; the caller is expected to roll back its transaction.
pub struct BatchCommitter<'tx, W: ChunkWriter> {
    tx: &'tx mut dyn StoreTransaction,
    writer: W,
    chunk_size: usize,
    staged: Vec<W::Row>,
    totals: CommitTotals,
}

pub type BulkCreate<'tx> = BatchCommitter<'tx, InsertWriter>;
pub type BulkUpdate<'tx> = BatchCommitter<'tx, UpdateWriter>;

impl<'tx, W: ChunkWriter> BatchCommitter<'tx, W> {
    pub fn new(tx: &'tx mut dyn StoreTransaction, writer: W, chunk_size: usize) -> Self {
        let chunk_size = clamp_chunk_size(chunk_size);
        Self {
            tx,
            writer,
            chunk_size,
            staged: Vec::with_capacity(chunk_size),
            totals: CommitTotals::default(),
        }
    }

    pub async fn add(&mut self, row: W::Row) -> Result<(), StorageError> {
        self.staged.push(row);
        if self.staged.len() >= self.chunk_size {
            self.commit().await?;
        }
        Ok(())
    }

    /// Flush the trailing partial chunk, if any.
    pub async fn done(&mut self) -> Result<CommitTotals, StorageError> {
        if !self.staged.is_empty() {
            self.commit().await?;
        }
        Ok(self.totals)
    }

    pub fn totals(&self) -> CommitTotals {
        self.totals
    }

    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let chunk = std::mem::replace(&mut self.staged, Vec::with_capacity(self.chunk_size));
        let index = self.totals.chunks;

        match self.writer.write_chunk(&mut *self.tx, &chunk).await {
            Ok(()) => {
                self.writer.tally(&mut self.totals, chunk.len());
                self.totals.chunks += 1;
                debug!(
                    entity = %self.writer.kind(),
                    operation = self.writer.operation(),
                    chunk = index,
                    size = chunk.len(),
                    "chunk committed"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    entity = %self.writer.kind(),
                    operation = self.writer.operation(),
                    chunk = index,
                    size = chunk.len(),
                    first_external_id = chunk.first().map(|r| r.external_id()),
                    last_external_id = chunk.last().map(|r| r.external_id()),
                    error = %err,
                    "chunk commit failed"
                );
                Err(err)
            }
        }
    }
}
