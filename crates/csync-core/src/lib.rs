//! Core domain model for csync: entity kinds, field values, storage rows and errors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod diff;
pub mod validate;

pub use diff::{difference, FieldDiff};
pub use validate::{RawRecord, RecordSchema, ValidatedRecord, ValidationError};

/// Identifier assigned by the remote source system.
pub type ExternalId = i64;

/// Primary key assigned by local storage.
pub type LocalId = i64;

/// Local column name -> value, restricted to tracked fields.
pub type FieldMap = BTreeMap<&'static str, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Text,
    /// Local id of a row of another entity kind.
    Reference(EntityKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

/// Upper bound on `columns().len()` across every kind.
pub const MAX_COLUMNS: usize = 4;

const POST_COLUMNS: &[Column] = &[
    Column { name: "user_id", ty: ColumnType::BigInt },
    Column { name: "title", ty: ColumnType::Text },
    Column { name: "body", ty: ColumnType::Text },
];

const COMMENT_COLUMNS: &[Column] = &[
    Column { name: "post_id", ty: ColumnType::Reference(EntityKind::Post) },
    Column { name: "name", ty: ColumnType::Text },
    Column { name: "email", ty: ColumnType::Text },
    Column { name: "body", ty: ColumnType::Text },
];

impl EntityKind {
    /// Parents before children: comments resolve their post against rows synced first.
    pub const SYNC_ORDER: [EntityKind; 2] = [EntityKind::Post, EntityKind::Comment];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Post => "Post",
            EntityKind::Comment => "Comment",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Comment => "comments",
        }
    }

    /// Remote endpoint path relative to the API base url.
    pub fn default_path(self) -> &'static str {
        self.table()
    }

    /// Tracked columns, in the order storage reads and writes them.
    pub fn columns(self) -> &'static [Column] {
        match self {
            EntityKind::Post => POST_COLUMNS,
            EntityKind::Comment => COMMENT_COLUMNS,
        }
    }

    pub fn tracked_fields(self) -> Vec<&'static str> {
        self.columns().iter().map(|c| c.name).collect()
    }

    pub fn schema(self) -> &'static RecordSchema {
        match self {
            EntityKind::Post => &validate::POST_SCHEMA,
            EntityKind::Comment => &validate::COMMENT_SCHEMA,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolved pointer to a local row. Equality is identity, never contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: LocalId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Ref(EntityRef),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn as_ref_id(&self) -> Option<LocalId> {
        match self {
            FieldValue::Ref(r) => Some(r.id),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            FieldValue::Ref(r) => write!(f, "{}#{}", r.kind, r.id),
        }
    }
}

/// A persisted row as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub kind: EntityKind,
    pub id: LocalId,
    pub external_id: ExternalId,
    pub fields: FieldMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRow {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            id: self.id,
        }
    }

    /// Existing values restricted to the keys of `candidate`.
    pub fn project(&self, candidate: &FieldMap) -> FieldMap {
        candidate
            .keys()
            .filter_map(|key| self.fields.get(key).map(|v| (*key, v.clone())))
            .collect()
    }
}

/// A row staged for creation; storage assigns `id` and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub external_id: ExternalId,
    pub fields: FieldMap,
}

/// A row staged for update, carrying the full mapped field set plus what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedRow {
    pub id: LocalId,
    pub external_id: ExternalId,
    pub fields: FieldMap,
    pub changes: FieldDiff,
}

pub trait StagedRow: Send + Sync {
    fn external_id(&self) -> ExternalId;
}

impl StagedRow for NewRow {
    fn external_id(&self) -> ExternalId {
        self.external_id
    }
}

impl StagedRow for ChangedRow {
    fn external_id(&self) -> ExternalId {
        self.external_id
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} on {table} failed: {source}")]
    Database {
        operation: &'static str,
        table: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("constraint violated on {table}: {detail}")]
    Constraint { table: &'static str, detail: String },
    #[error("cannot decode column {column} of {table}: {detail}")]
    Decode {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
    #[error("chunk of {rows} rows for {table} needs {binds} bind parameters, limit is {limit}")]
    ChunkTooLarge {
        table: &'static str,
        rows: usize,
        binds: usize,
        limit: usize,
    },
    #[error("injected failure on {operation} call #{call} against {table}")]
    Injected {
        operation: &'static str,
        table: &'static str,
        call: usize,
    },
}

impl StorageError {
    pub fn database(
        operation: &'static str,
        table: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StorageError::Database {
            operation,
            table,
            source: Box::new(source),
        }
    }
}
