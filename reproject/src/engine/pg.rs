use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;

use crate::{
    engine::{Change, Engine, ViewStore},
    error::{MigrationError, Result},
    projector::Row,
    table::TableRef,
    version::{Phase, Version, VersionEntry},
};

/// Postgres view database.
///
/// View tables live in the connection's current schema, next to the
/// `<prefix>_version` ledger table. Table names are quoted, keep them
/// lowercase so they match the unquoted names of the DDL templates.
#[derive(Debug, Clone)]
pub struct PgViewStore {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgViewStore {
    pub fn new(pool: &PgPool) -> ViewStore {
        ViewStore::new(Self {
            pool: pool.clone(),
            prefix: None,
        })
    }

    pub fn with_prefix(pool: &PgPool, prefix: impl Into<String>) -> ViewStore {
        ViewStore::new(Self {
            pool: pool.clone(),
            prefix: Some(prefix.into()),
        })
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_ref().unwrap_or(&"reproject".to_owned()),
            name.into()
        )
    }

    pub fn table_versions(&self) -> String {
        self.table("version")
    }

    async fn apply(&self, tx: &mut Transaction<'_, Postgres>, change: Change) -> Result<()> {
        match change {
            Change::CreateTable { statements, .. }
            | Change::CreateIndexes { statements, .. }
            | Change::AlterTable { statements, .. } => {
                for statement in statements.iter() {
                    sqlx::raw_sql(statement).execute(&mut **tx).await?;
                }
            }
            Change::RenameTable { from, to } => {
                sqlx::query(&format!(
                    "ALTER TABLE {} RENAME TO {}",
                    quote_ident(&from),
                    quote_ident(&to)
                ))
                .execute(&mut **tx)
                .await?;
            }
            Change::DropTable { table } => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(&table)))
                    .execute(&mut **tx)
                    .await?;
            }
            Change::Phase { version, from, to } => {
                let table_versions = self.table_versions();
                let updated = sqlx::query(&format!(
                    r#"
                    UPDATE {table_versions}
                    SET status = $1, ended_at = CASE WHEN $1 = 'done' THEN now() ELSE ended_at END
                    WHERE version = $2 AND status = $3
                    "#
                ))
                .bind(to.as_str())
                .bind(i64::from(version.0))
                .bind(from.as_str())
                .execute(&mut **tx)
                .await?
                .rows_affected();

                if updated == 0 {
                    return Err(MigrationError::UnexpectedPhase {
                        version,
                        expected: from,
                    });
                }
            }
        }

        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(anyhow::anyhow!("expected a row, got `{other}`").into()),
    }
}

fn key_record(table: &TableRef, key: &Value) -> Value {
    let mut record = Row::new();
    record.insert(table.key.to_owned(), key.clone());

    Value::Object(record)
}

type VersionRow = (
    i64,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i64>,
);

#[async_trait]
impl Engine for PgViewStore {
    async fn migrate(&self) -> Result<()> {
        let table_versions = self.table_versions();

        sqlx::raw_sql(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table_versions} (
                version BIGINT PRIMARY KEY,
                status VARCHAR(32) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                ended_at TIMESTAMPTZ,
                snapshot_marker BIGINT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {table_versions}_single_running_idx
                ON {table_versions} ((status <> 'done')) WHERE status <> 'done';
            "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn versions(&self) -> Result<Vec<VersionEntry>> {
        let table_versions = self.table_versions();

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT version, status, started_at, ended_at, snapshot_marker FROM {table_versions} ORDER BY version"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(version, status, started_at, ended_at, snapshot_marker)| {
                Ok(VersionEntry {
                    version: Version(u32::try_from(version).map_err(anyhow::Error::from)?),
                    phase: status.parse()?,
                    started_at,
                    ended_at,
                    snapshot_marker,
                })
            })
            .collect()
    }

    async fn claim_version(&self, entry: &VersionEntry) -> Result<bool> {
        let table_versions = self.table_versions();

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {table_versions} (version, status, started_at, ended_at, snapshot_marker)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#
        ))
        .bind(i64::from(entry.version.0))
        .bind(entry.phase.as_str())
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(entry.snapshot_marker)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn delete_version(&self, version: Version) -> Result<()> {
        let table_versions = self.table_versions();

        sqlx::query(&format!(
            "DELETE FROM {table_versions} WHERE version = $1 AND status <> $2"
        ))
        .bind(i64::from(version.0))
        .bind(Phase::Done.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn execute(&self, changes: Vec<Change>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for change in changes {
            self.apply(&mut tx, change).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let (exists,) = sqlx::query_as::<_, (bool,)>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT table_name::text FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name <> $1
            "#,
        )
        .bind(self.table_versions())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn upsert_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<()> {
        let name = quote_ident(&table.name);
        let key = quote_ident(&table.key);

        let columns = rows
            .iter()
            .flat_map(|row| row.keys().map(|column| quote_ident(column)))
            .collect::<BTreeSet<_>>();

        let updates = columns
            .iter()
            .filter(|column| **column != key)
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect::<Vec<_>>();

        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_owned()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let columns = columns.into_iter().collect::<Vec<_>>().join(", ");
        let rows = Value::Array(rows.into_iter().map(Value::Object).collect());

        sqlx::query(&format!(
            r#"
            INSERT INTO {name} ({columns})
            SELECT {columns} FROM jsonb_populate_recordset(NULL::{name}, $1)
            ON CONFLICT ({key}) {on_conflict}
            "#
        ))
        .bind(rows)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_rows(&self, table: &TableRef, keys: Vec<Value>) -> Result<()> {
        let name = quote_ident(&table.name);
        let key = quote_ident(&table.key);
        let records = Value::Array(keys.iter().map(|k| key_record(table, k)).collect());

        sqlx::query(&format!(
            "DELETE FROM {name} WHERE {key} IN (SELECT {key} FROM jsonb_populate_recordset(NULL::{name}, $1))"
        ))
        .bind(records)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_row(&self, table: &TableRef, key: &Value) -> Result<Option<Row>> {
        let name = quote_ident(&table.name);
        let column = quote_ident(&table.key);

        let row = sqlx::query_as::<_, (Value,)>(&format!(
            "SELECT to_jsonb(t) FROM {name} AS t WHERE t.{column} = (SELECT {column} FROM jsonb_populate_record(NULL::{name}, $1))"
        ))
        .bind(key_record(table, key))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(value,)| to_row(value)).transpose()
    }

    async fn rows(&self, table: &TableRef) -> Result<Vec<Row>> {
        let name = quote_ident(&table.name);
        let column = quote_ident(&table.key);

        let rows = sqlx::query_as::<_, (Value,)>(&format!(
            "SELECT to_jsonb(t) FROM {name} AS t ORDER BY t.{column}"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(value,)| to_row(value)).collect()
    }
}
