//! Per-entity mapping from remote records to local rows.

use std::collections::HashMap;

use csync_core::{
    difference, ChangedRow, EntityKind, EntityRef, ExternalId, FieldMap, FieldValue, NewRow,
    StoredRow, ValidatedRecord,
};
use thiserror::Error;

/// A record whose parent is not stored locally yet. Such records are skipped, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {external_id} references {target} {target_external_id}, which is not stored locally")]
pub struct UnresolvedReference {
    pub kind: EntityKind,
    pub external_id: ExternalId,
    pub target: EntityKind,
    pub target_external_id: ExternalId,
}

/// How a remote record points at a row of another kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSpec {
    /// Remote key carrying the parent's external id, e.g. `postId`.
    pub source_key: &'static str,
    pub target: EntityKind,
}

/// Parent rows available to one batch, keyed by the parent's external id.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    refs: HashMap<ExternalId, EntityRef>,
}

impl ReferenceIndex {
    pub fn from_rows(rows: impl IntoIterator<Item = StoredRow>) -> Self {
        Self {
            refs: rows
                .into_iter()
                .map(|row| (row.external_id, row.entity_ref()))
                .collect(),
        }
    }

    pub fn resolve(&self, external_id: ExternalId) -> Option<EntityRef> {
        self.refs.get(&external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Entity-specific behavior plugged into the reconciler.
///
/// Implementors only provide [`RecordProcessor::map_fields`]; the insert and update paths are
/// derived from it so both treat unresolved references the same way.
pub trait RecordProcessor: Send + Sync {
    fn kind(&self) -> EntityKind;

    fn reference(&self) -> Option<ReferenceSpec> {
        None
    }

    /// Pure mapping from remote keys to local columns. Unknown remote keys are dropped.
    fn map_fields(
        &self,
        record: &ValidatedRecord,
        refs: &ReferenceIndex,
    ) -> Result<FieldMap, UnresolvedReference>;

    fn process_insert(
        &self,
        record: &ValidatedRecord,
        refs: &ReferenceIndex,
    ) -> Result<NewRow, UnresolvedReference> {
        Ok(NewRow {
            external_id: record.external_id,
            fields: self.map_fields(record, refs)?,
        })
    }

    /// `Ok(None)` when nothing tracked changed.
    fn process_update(
        &self,
        record: &ValidatedRecord,
        existing: &StoredRow,
        refs: &ReferenceIndex,
    ) -> Result<Option<ChangedRow>, UnresolvedReference> {
        let fields = self.map_fields(record, refs)?;
        let changes = difference(&existing.project(&fields), &fields);
        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangedRow {
            id: existing.id,
            external_id: existing.external_id,
            fields,
            changes,
        }))
    }
}

pub fn processor_for(kind: EntityKind) -> Box<dyn RecordProcessor> {
    match kind {
        EntityKind::Post => Box::new(PostProcessor),
        EntityKind::Comment => Box::new(CommentProcessor),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostProcessor;

impl RecordProcessor for PostProcessor {
    fn kind(&self) -> EntityKind {
        EntityKind::Post
    }

    fn map_fields(
        &self,
        record: &ValidatedRecord,
        _refs: &ReferenceIndex,
    ) -> Result<FieldMap, UnresolvedReference> {
        Ok(FieldMap::from([
            ("user_id", FieldValue::Int(record.int("userId").unwrap_or_default())),
            ("title", FieldValue::text(record.text("title").unwrap_or_default())),
            ("body", FieldValue::text(record.text("body").unwrap_or_default())),
        ]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommentProcessor;

impl RecordProcessor for CommentProcessor {
    fn kind(&self) -> EntityKind {
        EntityKind::Comment
    }

    fn reference(&self) -> Option<ReferenceSpec> {
        Some(ReferenceSpec {
            source_key: "postId",
            target: EntityKind::Post,
        })
    }

    fn map_fields(
        &self,
        record: &ValidatedRecord,
        refs: &ReferenceIndex,
    ) -> Result<FieldMap, UnresolvedReference> {
        let post_external_id = record.int("postId").unwrap_or_default();
        let post = refs
            .resolve(post_external_id)
            .ok_or(UnresolvedReference {
                kind: EntityKind::Comment,
                external_id: record.external_id,
                target: EntityKind::Post,
                target_external_id: post_external_id,
            })?;

        Ok(FieldMap::from([
            ("post_id", FieldValue::Ref(post)),
            ("name", FieldValue::text(record.text("name").unwrap_or_default())),
            ("email", FieldValue::text(record.text("email").unwrap_or_default())),
            ("body", FieldValue::text(record.text("body").unwrap_or_default())),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn validated(kind: EntityKind, payload: serde_json::Value) -> ValidatedRecord {
        kind.schema().validate(&json!([payload])).unwrap().remove(0)
    }

    fn stored(kind: EntityKind, id: i64, external_id: i64, fields: FieldMap) -> StoredRow {
        StoredRow {
            kind,
            id,
            external_id,
            fields,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn post_mapping_renames_keys_and_drops_unknown_ones() {
        let record = validated(
            EntityKind::Post,
            json!({"userId": 3, "id": 9, "title": "t", "body": "b", "likes": 4}),
        );
        let row = PostProcessor.process_insert(&record, &ReferenceIndex::default()).unwrap();
        assert_eq!(row.external_id, 9);
        assert_eq!(row.fields.len(), 3);
        for field in EntityKind::Post.tracked_fields() {
            assert!(row.fields.contains_key(field), "missing {field}");
        }
        assert_eq!(row.fields["user_id"], FieldValue::Int(3));
    }

    #[test]
    fn comment_reference_resolves_to_local_id_not_external_id() {
        let refs = ReferenceIndex::from_rows([stored(EntityKind::Post, 41, 1, FieldMap::new())]);
        let record = validated(
            EntityKind::Comment,
            json!({"postId": 1, "id": 5, "name": "n", "email": "a@b.io", "body": "b"}),
        );
        let row = CommentProcessor.process_insert(&record, &refs).unwrap();
        assert_eq!(
            row.fields["post_id"],
            FieldValue::Ref(EntityRef { kind: EntityKind::Post, id: 41 })
        );
    }

    #[test]
    fn unresolved_reference_is_reported_on_both_paths() {
        let refs = ReferenceIndex::default();
        let record = validated(
            EntityKind::Comment,
            json!({"postId": 77, "id": 5, "name": "n", "email": "a@b.io", "body": "b"}),
        );
        let expected = UnresolvedReference {
            kind: EntityKind::Comment,
            external_id: 5,
            target: EntityKind::Post,
            target_external_id: 77,
        };
        assert_eq!(CommentProcessor.process_insert(&record, &refs).unwrap_err(), expected);

        let existing = stored(EntityKind::Comment, 1, 5, FieldMap::new());
        assert_eq!(
            CommentProcessor.process_update(&record, &existing, &refs).unwrap_err(),
            expected
        );
    }

    #[test]
    fn update_is_skipped_when_nothing_changed() {
        let record = validated(
            EntityKind::Post,
            json!({"userId": 1, "id": 2, "title": "t", "body": "b"}),
        );
        let fields = PostProcessor.map_fields(&record, &ReferenceIndex::default()).unwrap();
        let existing = stored(EntityKind::Post, 10, 2, fields);
        assert_eq!(
            PostProcessor.process_update(&record, &existing, &ReferenceIndex::default()),
            Ok(None)
        );
    }

    #[test]
    fn update_carries_local_id_and_changes() {
        let record = validated(
            EntityKind::Post,
            json!({"userId": 1, "id": 2, "title": "new", "body": "b"}),
        );
        let existing = stored(
            EntityKind::Post,
            10,
            2,
            FieldMap::from([
                ("user_id", FieldValue::Int(1)),
                ("title", FieldValue::text("old")),
                ("body", FieldValue::text("b")),
            ]),
        );
        let changed = PostProcessor
            .process_update(&record, &existing, &ReferenceIndex::default())
            .unwrap()
            .expect("title changed");
        assert_eq!(changed.id, 10);
        assert_eq!(changed.changes.keys().copied().collect::<Vec<_>>(), vec!["title"]);
    }
}
