use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{projector::Projector, table::TableDefinition, version::Version};

/// One action of a version.
#[derive(Clone)]
pub enum Migration {
    /// Rebuilds every table managed by the projector from the event log.
    ReplayTable(Arc<dyn Projector>),

    /// Alters a live table in place. The script must be idempotent and
    /// forward-only, offline rollbacks do not revert it.
    AlterTable { table: String, script: String },
}

impl Migration {
    pub fn replay(projector: Arc<dyn Projector>) -> Self {
        Migration::ReplayTable(projector)
    }

    pub fn replay_all(projectors: &[Arc<dyn Projector>]) -> Vec<Self> {
        projectors.iter().cloned().map(Migration::ReplayTable).collect()
    }

    pub fn alter_table(table: impl Into<String>, script: impl Into<String>) -> Self {
        Migration::AlterTable {
            table: table.into(),
            script: script.into(),
        }
    }
}

impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Migration::ReplayTable(a), Migration::ReplayTable(b)) => a.name() == b.name(),
            (
                Migration::AlterTable { table, script },
                Migration::AlterTable {
                    table: other_table,
                    script: other_script,
                },
            ) => table == other_table && script == other_script,
            _ => false,
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Migration::ReplayTable(projector) => {
                f.debug_tuple("ReplayTable").field(&projector.name()).finish()
            }
            Migration::AlterTable { table, .. } => {
                f.debug_struct("AlterTable").field("table", table).finish()
            }
        }
    }
}

/// Every version of the view schema with its actions, and the version to
/// migrate to.
///
/// ```ignore
/// let migrations = Migrations::new(3)
///     .version(1, Migration::replay_all(&projectors))
///     .version(2, vec![Migration::replay(invoices.clone())])
///     .version(3, vec![Migration::alter_table("account", "ALTER TABLE account ADD COLUMN IF NOT EXISTS email text")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    target: Version,
    versions: BTreeMap<Version, Vec<Migration>>,
}

impl Migrations {
    pub fn new(target: impl Into<Version>) -> Self {
        Self {
            target: target.into(),
            versions: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<Version>, migrations: Vec<Migration>) -> Self {
        self.versions
            .entry(version.into())
            .or_default()
            .extend(migrations);

        self
    }

    pub fn target(&self) -> Version {
        self.target
    }

    pub fn versions(&self) -> &BTreeMap<Version, Vec<Migration>> {
        &self.versions
    }

    /// Distinct projectors of every version, in declaration order.
    pub fn projectors(&self) -> Vec<Arc<dyn Projector>> {
        let mut projectors: Vec<Arc<dyn Projector>> = Vec::new();

        for migration in self.versions.values().flatten() {
            if let Migration::ReplayTable(projector) = migration {
                if !projectors.iter().any(|p| p.name() == projector.name()) {
                    projectors.push(projector.clone());
                }
            }
        }

        projectors
    }

    /// Distinct tables managed by the projectors of every version.
    pub fn tables(&self) -> Vec<TableDefinition> {
        let mut tables: Vec<TableDefinition> = Vec::new();

        for table in self.projectors().iter().flat_map(|p| p.managed_tables()) {
            if !tables.iter().any(|t| t.name == table.name) {
                tables.push(table);
            }
        }

        tables
    }

    /// Names of every table the migrations ever touch.
    pub fn table_names(&self) -> Vec<String> {
        let mut names = self
            .tables()
            .into_iter()
            .map(|table| table.name)
            .collect::<Vec<_>>();

        for migration in self.versions.values().flatten() {
            if let Migration::AlterTable { table, .. } = migration {
                if !names.contains(table) {
                    names.push(table.to_owned());
                }
            }
        }

        names
    }
}
