use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    cursor::{Cursor, CursorType, QueryResult},
    engine::Engine,
    error::{Result, StoreError},
    event::{Event, EventFilter, WriteEvent, LENGTH_OF_AGGREGATE_ID_PREFIX},
    store::Store,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgStore {
    pub fn new(pool: &PgPool) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: None,
        })
    }

    pub fn with_prefix(pool: &PgPool, prefix: impl Into<String>) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: Some(prefix.into()),
        })
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_ref().unwrap_or(&"ev".to_owned()),
            name.into()
        )
    }

    pub fn table_events(&self) -> String {
        self.table("event")
    }

    pub fn table_replayed_ids(&self) -> String {
        self.table("replayed_id")
    }
}

#[async_trait]
impl Engine for PgStore {
    async fn migrate(&self) -> Result<()> {
        let table_events = self.table_events();
        let table_replayed_ids = self.table_replayed_ids();

        sqlx::raw_sql(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table_events} (
                id BIGSERIAL PRIMARY KEY,
                aggregate_id UUID NOT NULL,
                sequence_number INTEGER NOT NULL,
                event_type VARCHAR(255) NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                xact_id BIGINT NOT NULL DEFAULT pg_current_xact_id()::text::bigint,
                UNIQUE (aggregate_id, sequence_number)
            );
            CREATE INDEX IF NOT EXISTS {table_events}_prefix_idx
                ON {table_events} ((substring(aggregate_id::text from 1 for {LENGTH_OF_AGGREGATE_ID_PREFIX})));
            CREATE INDEX IF NOT EXISTS {table_events}_xact_id_idx ON {table_events} (xact_id);
            CREATE TABLE IF NOT EXISTS {table_replayed_ids} (
                event_id BIGINT PRIMARY KEY
            );
            "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append(&self, write_events: Vec<WriteEvent>) -> Result<Vec<Event>> {
        let table_events = self.table_events();
        let mut tx = self.pool.begin().await?;
        let mut events = Vec::with_capacity(write_events.len());

        for write_events in write_events.chunks(100) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table_events} (aggregate_id, sequence_number, event_type, data) "
            ));

            query_builder.push_values(write_events, |mut b, event| {
                b.push_bind(event.aggregate_id)
                    .push_bind(event.sequence_number)
                    .push_bind(event.event_type.to_owned())
                    .push_bind(event.data.clone());
            });

            query_builder.push(" RETURNING *");

            let inserted = query_builder
                .build_query_as::<Event>()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                        StoreError::DuplicateSequenceNumber(db.message().to_owned())
                    }
                    e => StoreError::Sqlx(e),
                })?;

            events.extend(inserted);
        }

        tx.commit().await?;

        Ok(events)
    }

    async fn read(
        &self,
        filter: &EventFilter,
        first: u16,
        after: Option<CursorType>,
    ) -> Result<QueryResult<Event>> {
        let table_events = self.table_events();
        let table_replayed_ids = self.table_replayed_ids();

        let mut query_builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {table_events} WHERE event_type = ANY("));

        query_builder
            .push_bind(filter.event_types.clone())
            .push(format!(
                ") AND substring(aggregate_id::text from 1 for {LENGTH_OF_AGGREGATE_ID_PREFIX}) = ANY("
            ))
            .push_bind(filter.aggregate_prefixes.clone())
            .push(")");

        if filter.exclude_replayed {
            query_builder.push(format!(
                " AND NOT EXISTS (SELECT 1 FROM {table_replayed_ids} WHERE event_id = {table_events}.id)"
            ));
        }

        if let Some(created_after) = filter.created_after {
            query_builder
                .push(" AND created_at > ")
                .push_bind(created_after);
        }

        if let Some(cursor) = after {
            let cursor = Event::from_cursor(&cursor)?;

            query_builder
                .push(" AND (aggregate_id > ")
                .push_bind(cursor.aggregate_id)
                .push(" OR (aggregate_id = ")
                .push_bind(cursor.aggregate_id)
                .push(" AND sequence_number > ")
                .push_bind(cursor.sequence_number)
                .push("))");
        }

        query_builder.push(format!(
            " ORDER BY {} LIMIT {}",
            Event::to_pg_order(),
            i64::from(first) + 1
        ));

        let events = query_builder
            .build_query_as::<Event>()
            .fetch_all(&self.pool)
            .await?;

        Ok(QueryResult::forward(events, first))
    }

    async fn snapshot_marker(&self) -> Result<i64> {
        let (marker,) = sqlx::query_as::<_, (i64,)>(
            "SELECT pg_snapshot_xmin(pg_current_snapshot())::text::bigint",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(marker)
    }

    async fn count_since(&self, event_types: &[String], marker: i64) -> Result<i64> {
        let table_events = self.table_events();

        let (count,) = sqlx::query_as::<_, (i64,)>(&format!(
            "SELECT count(*) FROM {table_events} WHERE event_type = ANY($1) AND xact_id >= $2"
        ))
        .bind(event_types)
        .bind(marker)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn truncate_replayed(&self) -> Result<()> {
        let table_replayed_ids = self.table_replayed_ids();

        sqlx::query(&format!("TRUNCATE TABLE {table_replayed_ids}"))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_replayed(&self, ids: &[i64]) -> Result<()> {
        let table_replayed_ids = self.table_replayed_ids();

        sqlx::query(&format!(
            "INSERT INTO {table_replayed_ids} (event_id) SELECT unnest($1::bigint[]) ON CONFLICT DO NOTHING"
        ))
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_replayed(&self, id: i64) -> Result<bool> {
        let table_replayed_ids = self.table_replayed_ids();

        let row = sqlx::query_as::<_, (i64,)>(&format!(
            "SELECT event_id FROM {table_replayed_ids} WHERE event_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn replayed_count(&self) -> Result<i64> {
        let table_replayed_ids = self.table_replayed_ids();

        let (count,) =
            sqlx::query_as::<_, (i64,)>(&format!("SELECT count(*) FROM {table_replayed_ids}"))
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
