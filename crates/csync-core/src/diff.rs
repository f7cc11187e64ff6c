//! Field-level change detection between a stored row and a freshly mapped candidate.

use std::collections::BTreeMap;

use crate::{FieldMap, FieldValue};

/// Field -> (stored value, incoming value).
pub type FieldDiff = BTreeMap<&'static str, (FieldValue, FieldValue)>;

/// Fields present in both maps whose values differ.
///
/// Keys only on `existing` are ignored, so untouched columns never produce a diff.
/// References compare by `(kind, id)` through [`crate::EntityRef`]'s equality.
pub fn difference(existing: &FieldMap, candidate: &FieldMap) -> FieldDiff {
    candidate
        .iter()
        .filter_map(|(key, new)| {
            let old = existing.get(key)?;
            (old != new).then(|| (*key, (old.clone(), new.clone())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityKind, EntityRef};

    fn post_fields(title: &str, body: &str) -> FieldMap {
        FieldMap::from([
            ("user_id", FieldValue::Int(1)),
            ("title", FieldValue::text(title)),
            ("body", FieldValue::text(body)),
        ])
    }

    #[test]
    fn identical_maps_have_no_difference() {
        assert!(difference(&post_fields("a", "b"), &post_fields("a", "b")).is_empty());
    }

    #[test]
    fn reports_old_and_new_values_for_changed_keys_only() {
        let diff = difference(&post_fields("a", "b"), &post_fields("a", "c"));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["body"], (FieldValue::text("b"), FieldValue::text("c")));
    }

    #[test]
    fn keys_missing_from_candidate_are_ignored() {
        let existing = post_fields("a", "b");
        let candidate = FieldMap::from([("title", FieldValue::text("a"))]);
        assert!(difference(&existing, &candidate).is_empty());
    }

    #[test]
    fn keys_missing_from_existing_are_ignored() {
        let existing = FieldMap::from([("title", FieldValue::text("a"))]);
        assert!(difference(&existing, &post_fields("a", "b")).is_empty());
    }

    #[test]
    fn references_compare_by_resolved_identity() {
        let to = |id| FieldValue::Ref(EntityRef { kind: EntityKind::Post, id });
        let existing = FieldMap::from([("post_id", to(4))]);
        assert!(difference(&existing, &FieldMap::from([("post_id", to(4))])).is_empty());
        assert_eq!(difference(&existing, &FieldMap::from([("post_id", to(5))])).len(), 1);
        // Same numeric value, different kind of value: still a change.
        assert_eq!(
            difference(&existing, &FieldMap::from([("post_id", FieldValue::Int(4))])).len(),
            1
        );
    }
}
