use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    engine::{Change, Engine, ViewStore},
    error::{MigrationError, Result},
    projector::Row,
    table::TableRef,
    version::{Version, VersionEntry},
};

pub struct MemoryViewStore;

impl MemoryViewStore {
    pub fn create() -> ViewStore {
        ViewStore::new(Memory::default())
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    key: String,
    rows: BTreeMap<String, Row>,
    statements: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct State {
    versions: Vec<VersionEntry>,
    tables: HashMap<String, Table>,
}

impl State {
    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MigrationError::TableNotFound(name.to_owned()))
    }

    fn apply(&mut self, change: Change) -> Result<()> {
        match change {
            Change::CreateTable { table, statements } => {
                if self.tables.contains_key(&table.name) {
                    return Err(MigrationError::TableAlreadyExists(table.name));
                }

                self.tables.insert(
                    table.name,
                    Table {
                        key: table.key,
                        rows: BTreeMap::new(),
                        statements,
                    },
                );
            }
            Change::CreateIndexes { table, statements }
            | Change::AlterTable { table, statements } => {
                self.table_mut(&table)?.statements.extend(statements);
            }
            Change::RenameTable { from, to } => {
                if self.tables.contains_key(&to) {
                    return Err(MigrationError::TableAlreadyExists(to));
                }

                let table = self
                    .tables
                    .remove(&from)
                    .ok_or(MigrationError::TableNotFound(from))?;

                self.tables.insert(to, table);
            }
            Change::DropTable { table } => {
                self.tables.remove(&table);
            }
            Change::Phase { version, from, to } => {
                let entry = self
                    .versions
                    .iter_mut()
                    .find(|entry| entry.version == version && entry.phase == from)
                    .ok_or(MigrationError::UnexpectedPhase {
                        version,
                        expected: from,
                    })?;

                entry.phase = to;

                if entry.is_done() {
                    entry.ended_at = Some(Utc::now());
                }
            }
        }

        Ok(())
    }
}

/// In-process view database. DDL statements are recorded, not interpreted.
#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<State>>);

impl Memory {
    /// Statements applied to `table` so far, creation first.
    pub fn statements(&self, table: &str) -> Option<Vec<String>> {
        self.0
            .read()
            .tables
            .get(table)
            .map(|table| table.statements.clone())
    }
}

fn key_of(key: &Value) -> String {
    key.to_string()
}

#[async_trait]
impl Engine for Memory {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn versions(&self) -> Result<Vec<VersionEntry>> {
        Ok(self.0.read().versions.clone())
    }

    async fn claim_version(&self, entry: &VersionEntry) -> Result<bool> {
        let mut state = self.0.write();

        if state
            .versions
            .iter()
            .any(|e| !e.is_done() || e.version == entry.version)
        {
            return Ok(false);
        }

        state.versions.push(entry.clone());

        Ok(true)
    }

    async fn delete_version(&self, version: Version) -> Result<()> {
        self.0
            .write()
            .versions
            .retain(|e| e.is_done() || e.version != version);

        Ok(())
    }

    async fn execute(&self, changes: Vec<Change>) -> Result<()> {
        let mut state = self.0.write();
        let mut next = state.clone();

        for change in changes {
            next.apply(change)?;
        }

        *state = next;

        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.0.read().tables.contains_key(table))
    }

    async fn tables(&self) -> Result<Vec<String>> {
        Ok(self.0.read().tables.keys().cloned().collect())
    }

    async fn upsert_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<()> {
        let mut state = self.0.write();
        let stored = state.table_mut(&table.name)?;

        for row in rows {
            let key = row
                .get(&stored.key)
                .map(key_of)
                .ok_or_else(|| MigrationError::MissingKey {
                    table: table.name.to_owned(),
                    key: stored.key.to_owned(),
                })?;

            stored.rows.insert(key, row);
        }

        Ok(())
    }

    async fn delete_rows(&self, table: &TableRef, keys: Vec<Value>) -> Result<()> {
        let mut state = self.0.write();
        let stored = state.table_mut(&table.name)?;

        for key in keys.iter() {
            stored.rows.remove(&key_of(key));
        }

        Ok(())
    }

    async fn get_row(&self, table: &TableRef, key: &Value) -> Result<Option<Row>> {
        let state = self.0.read();
        let stored = state
            .tables
            .get(&table.name)
            .ok_or_else(|| MigrationError::TableNotFound(table.name.to_owned()))?;

        Ok(stored.rows.get(&key_of(key)).cloned())
    }

    async fn rows(&self, table: &TableRef) -> Result<Vec<Row>> {
        let state = self.0.read();
        let stored = state
            .tables
            .get(&table.name)
            .ok_or_else(|| MigrationError::TableNotFound(table.name.to_owned()))?;

        Ok(stored.rows.values().cloned().collect())
    }
}
