use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use csync_core::{
    ChangedRow, ColumnType, EntityKind, EntityRef, ExternalId, FieldMap, FieldValue, NewRow,
    StorageError, StoredRow,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{EntityStore, StoreTransaction, MAX_BIND_PARAMS};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StorageError::database("begin", "transaction", err))?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn find_by_external_ids(
        &mut self,
        kind: EntityKind,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, StoredRow>, StorageError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let table = kind.table();
        let sql = format!(
            "SELECT id, external_id, {}, created_at, updated_at FROM {table} WHERE external_id = ANY($1)",
            kind.tracked_fields().join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| StorageError::database("select", table, err))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let stored = decode_row(kind, &row)?;
            out.insert(stored.external_id, stored);
        }
        Ok(out)
    }

    async fn insert_many(&mut self, kind: EntityKind, rows: &[NewRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = kind.table();
        check_bind_budget(table, rows.len(), kind.columns().len() + 1)?;

        let result = insert_query(kind, rows)
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| map_write_error("insert", table, err))?;
        debug!(table, rows = result.rows_affected(), "inserted chunk");
        Ok(())
    }

    async fn update_many(
        &mut self,
        kind: EntityKind,
        rows: &[ChangedRow],
        fields: &[&'static str],
    ) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = kind.table();
        check_bind_budget(table, rows.len(), fields.len() + 1)?;

        let result = update_query(kind, rows, fields)
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| map_write_error("update", table, err))?;
        if result.rows_affected() != rows.len() as u64 {
            return Err(StorageError::Constraint {
                table,
                detail: format!(
                    "expected to update {} rows, updated {}",
                    rows.len(),
                    result.rows_affected()
                ),
            });
        }
        debug!(table, rows = result.rows_affected(), "updated chunk");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|err| StorageError::database("commit", "transaction", err))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|err| StorageError::database("rollback", "transaction", err))
    }
}

/// One bound parameter of a `VALUES` tuple.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    BigInt(i64),
    Text(String),
    Null,
}

impl SqlValue {
    /// References bind the parent's local id.
    fn from_field(value: Option<&FieldValue>) -> Self {
        match value {
            Some(FieldValue::Int(v)) => SqlValue::BigInt(*v),
            Some(FieldValue::Text(v)) => SqlValue::Text(v.clone()),
            Some(FieldValue::Ref(r)) => SqlValue::BigInt(r.id),
            None => SqlValue::Null,
        }
    }
}

/// The key column first, then `columns` in order.
fn tuple_values(key: i64, fields: &FieldMap, columns: &[&'static str]) -> Vec<SqlValue> {
    std::iter::once(SqlValue::BigInt(key))
        .chain(columns.iter().map(|c| SqlValue::from_field(fields.get(c))))
        .collect()
}

fn push_tuple(b: &mut Separated<'_, 'static, Postgres, &'static str>, values: Vec<SqlValue>) {
    for value in values {
        match value {
            SqlValue::BigInt(v) => {
                b.push_bind(v);
            }
            SqlValue::Text(v) => {
                b.push_bind(v);
            }
            SqlValue::Null => {
                b.push("NULL");
            }
        }
    }
}

fn check_bind_budget(
    table: &'static str,
    rows: usize,
    binds_per_row: usize,
) -> Result<(), StorageError> {
    let binds = rows * binds_per_row;
    if binds > MAX_BIND_PARAMS {
        return Err(StorageError::ChunkTooLarge {
            table,
            rows,
            binds,
            limit: MAX_BIND_PARAMS,
        });
    }
    Ok(())
}

fn insert_query(kind: EntityKind, rows: &[NewRow]) -> QueryBuilder<'static, Postgres> {
    let columns = kind.tracked_fields();
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} (external_id, {}) ",
        kind.table(),
        columns.join(", ")
    ));
    qb.push_values(rows, |mut b, row| {
        push_tuple(&mut b, tuple_values(row.external_id, &row.fields, &columns));
    });
    qb
}

/// Overwrites `fields` matched on local id, bumping `updated_at`.
fn update_query(
    kind: EntityKind,
    rows: &[ChangedRow],
    fields: &[&'static str],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("UPDATE {} AS t SET ", kind.table()));
    {
        let mut set = qb.separated(", ");
        for field in fields {
            set.push(format!("{field} = v.{field}"));
        }
        set.push("updated_at = NOW()");
    }
    qb.push(" FROM (");
    qb.push_values(rows, |mut b, row| {
        push_tuple(&mut b, tuple_values(row.id, &row.fields, fields));
    });
    qb.push(format!(") AS v (id, {}) WHERE t.id = v.id", fields.join(", ")));
    qb
}

fn decode_row(kind: EntityKind, row: &PgRow) -> Result<StoredRow, StorageError> {
    let table = kind.table();
    let decode = |column: &'static str| {
        move |err: sqlx::Error| StorageError::Decode {
            table,
            column,
            detail: err.to_string(),
        }
    };

    let mut fields = FieldMap::new();
    for column in kind.columns() {
        let value = match column.ty {
            ColumnType::BigInt => {
                FieldValue::Int(row.try_get::<i64, _>(column.name).map_err(decode(column.name))?)
            }
            ColumnType::Text => FieldValue::Text(
                row.try_get::<String, _>(column.name)
                    .map_err(decode(column.name))?,
            ),
            ColumnType::Reference(target) => FieldValue::Ref(EntityRef {
                kind: target,
                id: row.try_get::<i64, _>(column.name).map_err(decode(column.name))?,
            }),
        };
        fields.insert(column.name, value);
    }

    Ok(StoredRow {
        kind,
        id: row.try_get("id").map_err(decode("id"))?,
        external_id: row.try_get("external_id").map_err(decode("external_id"))?,
        fields,
        created_at: row.try_get("created_at").map_err(decode("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(decode("updated_at"))?,
    })
}

fn map_write_error(operation: &'static str, table: &'static str, err: sqlx::Error) -> StorageError {
    if let Some(db) = err.as_database_error() {
        if db.is_unique_violation() || db.is_foreign_key_violation() {
            return StorageError::Constraint {
                table,
                detail: db.message().to_string(),
            };
        }
    }
    StorageError::database(operation, table, err)
}
