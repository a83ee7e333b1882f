use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

use crate::{
    error::Result,
    projector::Row,
    table::TableRef,
    version::{Phase, Version, VersionEntry},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

/// Structural change of the view database.
///
/// [`Engine::execute`] applies a batch of changes all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    CreateTable {
        table: TableRef,
        statements: Vec<String>,
    },
    CreateIndexes {
        table: String,
        statements: Vec<String>,
    },
    AlterTable {
        table: String,
        statements: Vec<String>,
    },
    RenameTable {
        from: String,
        to: String,
    },
    DropTable {
        table: String,
    },
    Phase {
        version: Version,
        from: Phase,
        to: Phase,
    },
}

/// The view database: version ledger, view tables and their rows.
#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Creates the version ledger table when missing.
    async fn migrate(&self) -> Result<()>;

    async fn versions(&self) -> Result<Vec<VersionEntry>>;

    /// Inserts `entry` unless its version is already recorded or an entry is
    /// still in flight. Returns whether the entry was inserted.
    async fn claim_version(&self, entry: &VersionEntry) -> Result<bool>;

    /// Deletes the unfinished entry of `version`, if any.
    async fn delete_version(&self, version: Version) -> Result<()>;

    async fn execute(&self, changes: Vec<Change>) -> Result<()>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Names of the view tables, the ledger table excluded.
    async fn tables(&self) -> Result<Vec<String>>;

    async fn upsert_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<()>;

    async fn delete_rows(&self, table: &TableRef, keys: Vec<Value>) -> Result<()>;

    async fn get_row(&self, table: &TableRef, key: &Value) -> Result<Option<Row>>;

    /// Every row of `table` ordered by key.
    async fn rows(&self, table: &TableRef) -> Result<Vec<Row>>;
}

dyn_clone::clone_trait_object!(Engine);

#[derive(Clone)]
pub struct ViewStore {
    pub(crate) engine: Box<dyn Engine>,
}

impl ViewStore {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        self.engine.migrate().await
    }

    pub async fn versions(&self) -> Result<Vec<VersionEntry>> {
        self.engine.versions().await
    }

    pub async fn claim_version(&self, entry: &VersionEntry) -> Result<bool> {
        self.engine.claim_version(entry).await
    }

    pub async fn delete_version(&self, version: Version) -> Result<()> {
        self.engine.delete_version(version).await
    }

    pub async fn execute(&self, changes: Vec<Change>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        for change in changes.iter() {
            tracing::debug!("{change:?}");
        }

        self.engine.execute(changes).await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        self.engine.table_exists(table).await
    }

    pub async fn tables(&self) -> Result<Vec<String>> {
        let mut tables = self.engine.tables().await?;
        tables.sort();

        Ok(tables)
    }

    pub async fn upsert_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        self.engine.upsert_rows(table, rows).await
    }

    pub async fn delete_rows(&self, table: &TableRef, keys: Vec<Value>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        self.engine.delete_rows(table, keys).await
    }

    pub async fn get_row(&self, table: &TableRef, key: &Value) -> Result<Option<Row>> {
        self.engine.get_row(table, key).await
    }

    pub async fn rows(&self, table: &TableRef) -> Result<Vec<Row>> {
        self.engine.rows(table).await
    }
}
