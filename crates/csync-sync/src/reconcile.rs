//! Batch reconciliation: validate, diff against storage, stage, write in one transaction.

use csync_core::{
    ChangedRow, EntityKind, ExternalId, NewRow, StorageError, ValidatedRecord, ValidationError,
};
use csync_sources::SourceError;
use csync_storage::{EntityStore, StoreTransaction};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::committer::{
    clamp_chunk_size, BulkCreate, BulkUpdate, InsertWriter, UpdateWriter, DEFAULT_CHUNK_SIZE,
};
use crate::processor::{RecordProcessor, ReferenceIndex, UnresolvedReference};

/// Outcome of reconciling one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_unresolved: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid {entity} payload: {source}")]
    InvalidPayload {
        entity: EntityKind,
        #[source]
        source: ValidationError,
    },
    #[error("{entity} storage failure: {source}")]
    Storage {
        entity: EntityKind,
        #[source]
        source: StorageError,
    },
    #[error("{entity} source failure: {source}")]
    Source {
        entity: EntityKind,
        #[source]
        source: SourceError,
    },
}

/// What a batch would do to storage, before anything is written.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncPlan {
    pub creates: Vec<NewRow>,
    pub updates: Vec<ChangedRow>,
    pub unchanged: usize,
    pub skipped: Vec<UnresolvedReference>,
}

pub struct Reconciler<'a> {
    store: &'a dyn EntityStore,
    processor: &'a dyn RecordProcessor,
    chunk_size: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn EntityStore, processor: &'a dyn RecordProcessor) -> Self {
        Self {
            store,
            processor,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = clamp_chunk_size(chunk_size);
        self
    }

    /// Bring storage in line with `payload`.
    ///
    /// The payload is validated as a whole before storage is touched. All writes for the batch
    /// share one transaction: either every chunk lands, or the transaction is rolled back and
    /// the storage error is returned.
    pub async fn synchronize(&self, payload: &JsonValue) -> Result<SyncCounts, SyncError> {
        let entity = self.processor.kind();
        let records = entity
            .schema()
            .validate(payload)
            .map_err(|source| SyncError::InvalidPayload { entity, source })?;

        if records.is_empty() {
            debug!(%entity, "empty batch, nothing to reconcile");
            return Ok(SyncCounts::default());
        }

        let storage = |source| SyncError::Storage { entity, source };
        let mut tx = self.store.begin().await.map_err(storage)?;

        match self.apply(tx.as_mut(), &records).await {
            Ok(counts) => {
                tx.commit().await.map_err(storage)?;
                info!(
                    %entity,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    unchanged = counts.unchanged,
                    skipped = counts.skipped_unresolved,
                    "batch reconciled"
                );
                Ok(counts)
            }
            Err(err) => {
                error!(%entity, error = %err, "reconciliation failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(%entity, error = %rollback_err, "rollback failed");
                }
                Err(storage(err))
            }
        }
    }

    /// Partition `records` into creates, updates and skips, in batch order.
    ///
    /// Issues one lookup for existing rows and, for kinds with a parent reference, one more for
    /// the parents named in the batch.
    pub async fn plan(
        &self,
        tx: &mut dyn StoreTransaction,
        records: &[ValidatedRecord],
    ) -> Result<SyncPlan, StorageError> {
        let entity = self.processor.kind();
        let ids: Vec<ExternalId> = records.iter().map(|r| r.external_id).collect();
        let existing = tx.find_by_external_ids(entity, &ids).await?;

        let refs = match self.processor.reference() {
            Some(reference) => {
                let mut parent_ids: Vec<ExternalId> = records
                    .iter()
                    .filter_map(|r| r.int(reference.source_key))
                    .collect();
                parent_ids.sort_unstable();
                parent_ids.dedup();
                let parents = tx.find_by_external_ids(reference.target, &parent_ids).await?;
                let refs = ReferenceIndex::from_rows(parents.into_values());
                debug!(
                    %entity,
                    wanted = parent_ids.len(),
                    found = refs.len(),
                    "resolved parent references"
                );
                refs
            }
            None => ReferenceIndex::default(),
        };

        let mut plan = SyncPlan::default();
        for record in records {
            match existing.get(&record.external_id) {
                None => match self.processor.process_insert(record, &refs) {
                    Ok(row) => plan.creates.push(row),
                    Err(unresolved) => plan.skipped.push(unresolved),
                },
                Some(row) => match self.processor.process_update(record, row, &refs) {
                    Ok(Some(changed)) => plan.updates.push(changed),
                    Ok(None) => plan.unchanged += 1,
                    Err(unresolved) => plan.skipped.push(unresolved),
                },
            }
        }
        Ok(plan)
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        records: &[ValidatedRecord],
    ) -> Result<SyncCounts, StorageError> {
        let entity = self.processor.kind();
        let plan = self.plan(&mut *tx, records).await?;
        report_skipped(entity, &plan.skipped);

        let mut counts = SyncCounts {
            fetched: records.len(),
            unchanged: plan.unchanged,
            skipped_unresolved: plan.skipped.len(),
            ..SyncCounts::default()
        };

        let mut creates = BulkCreate::new(&mut *tx, InsertWriter::new(entity), self.chunk_size);
        for row in plan.creates {
            creates.add(row).await?;
        }
        counts.inserted = creates.done().await?.total_inserted;

        let mut updates = BulkUpdate::new(&mut *tx, UpdateWriter::new(entity), self.chunk_size);
        for row in plan.updates {
            debug!(
                %entity,
                external_id = row.external_id,
                changed = ?row.changes.keys().collect::<Vec<_>>(),
                "staging update"
            );
            updates.add(row).await?;
        }
        counts.updated = updates.done().await?.total_updated;

        Ok(counts)
    }
}

fn report_skipped(entity: EntityKind, skipped: &[UnresolvedReference]) {
    if skipped.is_empty() {
        return;
    }
    warn!(%entity, skipped = skipped.len(), "records skipped, referenced rows not stored locally");
    for unresolved in skipped {
        debug!(%entity, external_id = unresolved.external_id, "{unresolved}");
    }
}
