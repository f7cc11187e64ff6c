//! Whole-batch shape validation for remote payloads.
//!
//! A batch is accepted or rejected as a unit. Accepted records come back as
//! [`ValidatedRecord`]s so later stages never re-check the external id.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::ExternalId;

pub type RawRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Integer `>= 0`, used for identifiers.
    NonNegativeInteger,
    String,
    /// Non-blank string of at most [`SHORT_TEXT_MAX_CHARS`] characters.
    ShortString,
    Email,
}

/// Column width of `title` and `name` in storage.
pub const SHORT_TEXT_MAX_CHARS: usize = 255;

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::NonNegativeInteger => f.write_str("a non-negative integer"),
            FieldType::String => f.write_str("a non-blank string"),
            FieldType::ShortString => {
                write!(f, "a non-blank string of at most {SHORT_TEXT_MAX_CHARS} characters")
            }
            FieldType::Email => f.write_str("an email address"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSchema {
    pub entity: &'static str,
    /// Key carrying the external id; must also appear in `fields` as an integer.
    pub id_field: &'static str,
    pub fields: &'static [FieldSpec],
}

pub const POST_SCHEMA: RecordSchema = RecordSchema {
    entity: "Post",
    id_field: "id",
    fields: &[
        FieldSpec { name: "userId", ty: FieldType::NonNegativeInteger },
        FieldSpec { name: "id", ty: FieldType::NonNegativeInteger },
        FieldSpec { name: "title", ty: FieldType::ShortString },
        FieldSpec { name: "body", ty: FieldType::String },
    ],
};

pub const COMMENT_SCHEMA: RecordSchema = RecordSchema {
    entity: "Comment",
    id_field: "id",
    fields: &[
        FieldSpec { name: "postId", ty: FieldType::NonNegativeInteger },
        FieldSpec { name: "id", ty: FieldType::NonNegativeInteger },
        FieldSpec { name: "name", ty: FieldType::ShortString },
        FieldSpec { name: "email", ty: FieldType::Email },
        FieldSpec { name: "body", ty: FieldType::String },
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("expected a list of records, got {found}")]
    NotASequence { found: &'static str },
    #[error("record #{index} is not an object (got {found})")]
    NotAnObject { index: usize, found: &'static str },
    #[error("record #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("record #{index} field `{field}` must be {expected}")]
    WrongType {
        index: usize,
        field: &'static str,
        expected: FieldType,
    },
    #[error("record #{index} repeats id {id}")]
    DuplicateId { index: usize, id: ExternalId },
}

/// A record that passed schema validation, keyed by its external id.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub external_id: ExternalId,
    pub raw: RawRecord,
}

impl ValidatedRecord {
    pub fn int(&self, key: &str) -> Option<i64> {
        self.raw.get(key).and_then(JsonValue::as_i64)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(JsonValue::as_str)
    }
}

impl RecordSchema {
    pub fn validate(&self, payload: &JsonValue) -> Result<Vec<ValidatedRecord>, ValidationError> {
        let items = payload.as_array().ok_or(ValidationError::NotASequence {
            found: json_kind(payload),
        })?;

        let mut seen = HashSet::with_capacity(items.len());
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let object = item.as_object().ok_or(ValidationError::NotAnObject {
                index,
                found: json_kind(item),
            })?;

            for field_spec in self.fields {
                check_field(index, field_spec, object.get(field_spec.name))?;
            }

            let external_id = object
                .get(self.id_field)
                .and_then(JsonValue::as_i64)
                .ok_or(ValidationError::WrongType {
                    index,
                    field: self.id_field,
                    expected: FieldType::NonNegativeInteger,
                })?;
            if !seen.insert(external_id) {
                return Err(ValidationError::DuplicateId {
                    index,
                    id: external_id,
                });
            }

            records.push(ValidatedRecord {
                external_id,
                raw: object.clone(),
            });
        }
        Ok(records)
    }
}

fn check_field(
    index: usize,
    field_spec: &FieldSpec,
    value: Option<&JsonValue>,
) -> Result<(), ValidationError> {
    let value = match value {
        None | Some(JsonValue::Null) => {
            return Err(ValidationError::MissingField {
                index,
                field: field_spec.name,
            })
        }
        Some(value) => value,
    };

    let ok = match field_spec.ty {
        FieldType::NonNegativeInteger => value.as_i64().is_some_and(|n| n >= 0),
        FieldType::String => value.as_str().is_some_and(|s| !s.trim().is_empty()),
        FieldType::ShortString => value
            .as_str()
            .is_some_and(|s| !s.trim().is_empty() && s.chars().count() <= SHORT_TEXT_MAX_CHARS),
        FieldType::Email => value.as_str().is_some_and(looks_like_email),
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::WrongType {
            index,
            field: field_spec.name,
            expected: field_spec.ty,
        })
    }
}

fn looks_like_email(input: &str) -> bool {
    let input = input.trim();
    if input.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = input.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && domain.split('.').all(|part| !part.is_empty())
}

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}
