use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use csync_core::{
    ChangedRow, EntityKind, ExternalId, FieldValue, LocalId, NewRow, StorageError, StoredRow,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{EntityStore, StoreTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
}

impl WriteOp {
    fn as_str(self) -> &'static str {
        match self {
            WriteOp::Insert => "insert",
            WriteOp::Update => "update",
        }
    }
}

/// One chunk write as seen by storage, recorded even when the transaction later rolls back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub op: WriteOp,
    pub kind: EntityKind,
    pub external_ids: Vec<ExternalId>,
}

impl WriteCall {
    pub fn len(&self) -> usize {
        self.external_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.external_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<EntityKind, BTreeMap<LocalId, StoredRow>>,
    next_id: LocalId,
}

impl Tables {
    fn find_external(&self, kind: EntityKind, external_id: ExternalId) -> Option<&StoredRow> {
        self.rows
            .get(&kind)
            .and_then(|t| t.values().find(|r| r.external_id == external_id))
    }

    fn contains(&self, kind: EntityKind, id: LocalId) -> bool {
        self.rows.get(&kind).is_some_and(|t| t.contains_key(&id))
    }
}

#[derive(Debug, Default)]
struct Shared {
    committed: Tables,
    calls: Vec<WriteCall>,
    lookups: usize,
    fail_on: Option<(WriteOp, usize)>,
}

impl Shared {
    /// Records the call and reports an injected failure if this is the targeted one.
    fn record(
        &mut self,
        op: WriteOp,
        kind: EntityKind,
        external_ids: Vec<ExternalId>,
    ) -> Result<(), StorageError> {
        self.calls.push(WriteCall {
            op,
            kind,
            external_ids,
        });
        let call = self.calls.iter().filter(|c| c.op == op).count();
        match self.fail_on {
            Some((target, n)) if target == op && n == call => Err(StorageError::Injected {
                operation: op.as_str(),
                table: kind.table(),
                call,
            }),
            _ => Ok(()),
        }
    }
}

/// Process-local store with snapshot transactions.
///
/// Enforces unique external ids and reference integrity like the Postgres schema does, and
/// keeps a log of every chunk write so callers can inspect how work was split.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `call`-th (1-based, counted across the store's lifetime) write of `op` fail.
    pub async fn fail_on_call(&self, op: WriteOp, call: usize) {
        self.shared.lock().await.fail_on = Some((op, call));
    }

    pub async fn calls(&self) -> Vec<WriteCall> {
        self.shared.lock().await.calls.clone()
    }

    pub async fn lookups(&self) -> usize {
        self.shared.lock().await.lookups
    }

    /// Committed rows ordered by local id.
    pub async fn rows(&self, kind: EntityKind) -> Vec<StoredRow> {
        self.shared
            .lock()
            .await
            .committed
            .rows
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, kind: EntityKind) -> usize {
        self.shared
            .lock()
            .await
            .committed
            .rows
            .get(&kind)
            .map_or(0, BTreeMap::len)
    }

    pub async fn find(&self, kind: EntityKind, external_id: ExternalId) -> Option<StoredRow> {
        self.shared
            .lock()
            .await
            .committed
            .find_external(kind, external_id)
            .cloned()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let working = self.shared.lock().await.committed.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
        }))
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    working: Tables,
}

impl MemoryTransaction {
    fn check_references(&self, kind: EntityKind, row: &NewRow) -> Result<(), StorageError> {
        for value in row.fields.values() {
            if let FieldValue::Ref(target) = value {
                if !self.working.contains(target.kind, target.id) {
                    return Err(StorageError::Constraint {
                        table: kind.table(),
                        detail: format!(
                            "external id {} references missing {} row {}",
                            row.external_id, target.kind, target.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_by_external_ids(
        &mut self,
        kind: EntityKind,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, StoredRow>, StorageError> {
        self.shared.lock().await.lookups += 1;
        let wanted: HashSet<_> = ids.iter().copied().collect();
        Ok(self
            .working
            .rows
            .get(&kind)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|r| wanted.contains(&r.external_id))
            .map(|r| (r.external_id, r.clone()))
            .collect())
    }

    async fn insert_many(&mut self, kind: EntityKind, rows: &[NewRow]) -> Result<(), StorageError> {
        self.shared.lock().await.record(
            WriteOp::Insert,
            kind,
            rows.iter().map(|r| r.external_id).collect(),
        )?;

        let mut chunk_ids = HashSet::with_capacity(rows.len());
        for row in rows {
            if !chunk_ids.insert(row.external_id)
                || self.working.find_external(kind, row.external_id).is_some()
            {
                return Err(StorageError::Constraint {
                    table: kind.table(),
                    detail: format!("duplicate external id {}", row.external_id),
                });
            }
            self.check_references(kind, row)?;
        }

        let now = Utc::now();
        for row in rows {
            self.working.next_id += 1;
            let id = self.working.next_id;
            self.working.rows.entry(kind).or_default().insert(
                id,
                StoredRow {
                    kind,
                    id,
                    external_id: row.external_id,
                    fields: row.fields.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        debug!(table = kind.table(), rows = rows.len(), "inserted chunk");
        Ok(())
    }

    async fn update_many(
        &mut self,
        kind: EntityKind,
        rows: &[ChangedRow],
        fields: &[&'static str],
    ) -> Result<(), StorageError> {
        self.shared.lock().await.record(
            WriteOp::Update,
            kind,
            rows.iter().map(|r| r.external_id).collect(),
        )?;

        for row in rows {
            if !self.working.contains(kind, row.id) {
                return Err(StorageError::Constraint {
                    table: kind.table(),
                    detail: format!("no row with id {}", row.id),
                });
            }
        }

        let now = Utc::now();
        let table = self.working.rows.entry(kind).or_default();
        for row in rows {
            if let Some(stored) = table.get_mut(&row.id) {
                for field in fields {
                    if let Some(value) = row.fields.get(field) {
                        stored.fields.insert(*field, value.clone());
                    }
                }
                stored.updated_at = now;
            }
        }
        debug!(table = kind.table(), rows = rows.len(), "updated chunk");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction { shared, working } = *self;
        shared.lock().await.committed = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csync_core::{EntityRef, FieldMap};

    fn new_post(external_id: ExternalId, title: &str) -> NewRow {
        NewRow {
            external_id,
            fields: FieldMap::from([
                ("user_id", FieldValue::Int(1)),
                ("title", FieldValue::text(title)),
                ("body", FieldValue::text("body")),
            ]),
        }
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_many(EntityKind::Post, &[new_post(1, "a")]).await.unwrap();
        assert_eq!(store.row_count(EntityKind::Post).await, 0);
        tx.commit().await.unwrap();
        assert_eq!(store.row_count(EntityKind::Post).await, 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes_but_keeps_call_log() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_many(EntityKind::Post, &[new_post(1, "a")]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.row_count(EntityKind::Post).await, 0);
        assert_eq!(store.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_external_ids_violate_uniqueness() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_many(EntityKind::Post, &[new_post(1, "a")]).await.unwrap();
        let err = tx
            .insert_many(EntityKind::Post, &[new_post(1, "again")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
    }

    #[tokio::test]
    async fn comments_must_reference_existing_posts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let orphan = NewRow {
            external_id: 1,
            fields: FieldMap::from([(
                "post_id",
                FieldValue::Ref(EntityRef { kind: EntityKind::Post, id: 99 }),
            )]),
        };
        let err = tx.insert_many(EntityKind::Comment, &[orphan]).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
    }

    #[tokio::test]
    async fn injected_failure_hits_only_the_targeted_call() {
        let store = MemoryStore::new();
        store.fail_on_call(WriteOp::Insert, 2).await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_many(EntityKind::Post, &[new_post(1, "a")]).await.unwrap();
        let err = tx.insert_many(EntityKind::Post, &[new_post(2, "b")]).await.unwrap_err();
        assert!(matches!(err, StorageError::Injected { call: 2, .. }));
    }

    #[tokio::test]
    async fn lookup_returns_only_requested_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_many(EntityKind::Post, &[new_post(1, "a"), new_post(2, "b")])
            .await
            .unwrap();
        let found = tx.find_by_external_ids(EntityKind::Post, &[2, 3]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&2].fields["title"], FieldValue::text("b"));
    }
}
