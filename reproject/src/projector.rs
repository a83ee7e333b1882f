use async_trait::async_trait;
use dyn_clone::DynClone;
use reproject_store::Event;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::{
    engine::ViewStore,
    error::{MigrationError, Result},
    table::{TableDefinition, TableNames, TableRef},
};

/// One view row, column name to value.
pub type Row = Map<String, Value>;

/// Turns events into view row mutations.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Unique name, matched by dry run patterns.
    fn name(&self) -> String;

    /// Event types this projector consumes. Other events are never handed to
    /// [`Projector::handle`].
    fn message_types(&self) -> Vec<String>;

    fn managed_tables(&self) -> Vec<TableDefinition>;

    /// Applies one event. Events of an aggregate arrive in increasing
    /// sequence number order.
    async fn handle(&self, event: &Event, persistor: &mut dyn Persistor) -> anyhow::Result<()>;

    /// Dedicated persistor overriding `ambient` during replay.
    fn replay_persistor(&self, _ambient: &dyn Persistor) -> Option<Box<dyn Persistor>> {
        None
    }
}

/// Buffered writer of view rows addressed by logical table name.
///
/// A replay worker calls [`Persistor::prepare`], feeds mutations and ends with
/// exactly one [`Persistor::commit`] or [`Persistor::discard`].
#[async_trait]
pub trait Persistor: DynClone + Send + Sync {
    async fn prepare(&mut self) -> Result<()>;

    async fn get(&self, table: &str, key: &Value) -> Result<Option<Row>>;

    async fn upsert(&mut self, table: &str, row: Row) -> Result<()>;

    async fn delete(&mut self, table: &str, key: &Value) -> Result<()>;

    /// Flushes buffered mutations, returns how many were written.
    async fn commit(&mut self) -> Result<usize>;

    /// Drops buffered mutations, returns how many were dropped.
    async fn discard(&mut self) -> Result<usize>;

    /// Number of buffered mutations.
    fn pending(&self) -> usize;

    /// Empty persistor writing to the same destination, owned by one worker.
    fn fork(&self) -> Box<dyn Persistor>;
}

dyn_clone::clone_trait_object!(Persistor);

/// What happens to buffered rows at the end of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPolicy {
    #[default]
    Commit,
    Discard,
}

#[derive(Debug, Clone)]
enum Mutation {
    Upsert(Row),
    Delete(Value),
}

#[derive(Debug, Clone)]
struct Buffer {
    table: TableRef,
    rows: BTreeMap<String, Mutation>,
}

/// Persistor buffering rows per physical table and flushing them into the
/// view store on commit.
///
/// Logical names are resolved through [`TableNames`] when a mutation is
/// buffered, so rebinding tables affects later mutations only.
#[derive(Clone)]
pub struct ReplayPersistor {
    views: ViewStore,
    table_names: TableNames,
    buffers: HashMap<String, Buffer>,
}

impl ReplayPersistor {
    pub fn new(views: ViewStore, table_names: TableNames) -> Self {
        Self {
            views,
            table_names,
            buffers: HashMap::new(),
        }
    }

    fn buffer(&mut self, table: &TableRef) -> &mut Buffer {
        self.buffers
            .entry(table.name.to_owned())
            .or_insert_with(|| Buffer {
                table: table.clone(),
                rows: BTreeMap::new(),
            })
    }
}

fn key_of(key: &Value) -> String {
    key.to_string()
}

#[async_trait]
impl Persistor for ReplayPersistor {
    async fn prepare(&mut self) -> Result<()> {
        self.buffers.clear();

        Ok(())
    }

    async fn get(&self, table: &str, key: &Value) -> Result<Option<Row>> {
        let table = self.table_names.resolve(table)?;

        match self
            .buffers
            .get(&table.name)
            .and_then(|buffer| buffer.rows.get(&key_of(key)))
        {
            Some(Mutation::Upsert(row)) => return Ok(Some(row.clone())),
            Some(Mutation::Delete(_)) => return Ok(None),
            _ => {}
        }

        self.views.get_row(&table, key).await
    }

    async fn upsert(&mut self, table: &str, row: Row) -> Result<()> {
        let table = self.table_names.resolve(table)?;
        let key = row
            .get(&table.key)
            .map(key_of)
            .ok_or_else(|| MigrationError::MissingKey {
                table: table.name.to_owned(),
                key: table.key.to_owned(),
            })?;

        self.buffer(&table).rows.insert(key, Mutation::Upsert(row));

        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &Value) -> Result<()> {
        let table = self.table_names.resolve(table)?;

        self.buffer(&table)
            .rows
            .insert(key_of(key), Mutation::Delete(key.clone()));

        Ok(())
    }

    async fn commit(&mut self) -> Result<usize> {
        let mut written = 0;

        for (_, buffer) in self.buffers.drain() {
            written += buffer.rows.len();

            let mut rows = Vec::new();
            let mut keys = Vec::new();

            for mutation in buffer.rows.into_values() {
                match mutation {
                    Mutation::Upsert(row) => rows.push(row),
                    Mutation::Delete(key) => keys.push(key),
                }
            }

            self.views.delete_rows(&buffer.table, keys).await?;
            self.views.upsert_rows(&buffer.table, rows).await?;
        }

        Ok(written)
    }

    async fn discard(&mut self) -> Result<usize> {
        let dropped = self.pending();
        self.buffers.clear();

        Ok(dropped)
    }

    fn pending(&self) -> usize {
        self.buffers.values().map(|buffer| buffer.rows.len()).sum()
    }

    fn fork(&self) -> Box<dyn Persistor> {
        Box::new(Self::new(self.views.clone(), self.table_names.clone()))
    }
}
