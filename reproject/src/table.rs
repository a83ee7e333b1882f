use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{MigrationError, Result},
    version::Version,
};

/// Placeholder replaced by `_<version>` in versioned DDL and removed for live
/// tables. Every name that must be unique in the database carries it.
pub const SUFFIX: &str = "%SUFFIX%";

/// DDL of one view table.
///
/// ```sql
/// CREATE TABLE user_account%SUFFIX% (id uuid NOT NULL, CONSTRAINT user_account_pkey%SUFFIX% PRIMARY KEY (id));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub key: String,
    pub create_sql: String,
    pub indexes_sql: Option<String>,
}

impl TableDefinition {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        create_sql: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            create_sql: create_sql.into(),
            indexes_sql: None,
        }
    }

    pub fn indexes(mut self, sql: impl Into<String>) -> Self {
        self.indexes_sql = Some(sql.into());
        self
    }

    pub fn versioned_name(&self, version: Option<Version>) -> String {
        format!("{}{}", self.name, suffix(version))
    }

    pub fn table_ref(&self, version: Option<Version>) -> TableRef {
        TableRef::new(self.versioned_name(version), self.key.to_owned())
    }

    pub fn create_statements(&self, version: Option<Version>) -> Vec<String> {
        statements(&self.create_sql, version)
    }

    pub fn index_statements(&self, version: Option<Version>) -> Vec<String> {
        self.indexes_sql
            .as_deref()
            .map(|sql| statements(sql, version))
            .unwrap_or_default()
    }
}

pub fn suffix(version: Option<Version>) -> String {
    match version {
        Some(version) => format!("_{version}"),
        _ => String::new(),
    }
}

/// Substitutes [`SUFFIX`] and splits a script into its `;` separated
/// statements.
pub fn statements(sql: &str, version: Option<Version>) -> Vec<String> {
    sql.replace(SUFFIX, &suffix(version))
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Physical table a logical name currently points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub name: String,
    pub key: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// Binding of logical table names, as used by projectors, to the physical
/// tables persistors write into.
#[derive(Debug, Clone, Default)]
pub struct TableNames(Arc<RwLock<HashMap<String, TableRef>>>);

impl TableNames {
    pub fn new(tables: &[TableDefinition]) -> Self {
        let names = Self::default();

        for table in tables {
            names.bind(table, None);
        }

        names
    }

    pub fn bind(&self, table: &TableDefinition, version: Option<Version>) {
        self.0
            .write()
            .insert(table.name.to_owned(), table.table_ref(version));
    }

    pub fn resolve(&self, logical: &str) -> Result<TableRef> {
        self.0
            .read()
            .get(logical)
            .cloned()
            .ok_or_else(|| MigrationError::TableNotFound(logical.to_owned()))
    }
}
