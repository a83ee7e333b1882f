use std::sync::Arc;

use crate::{
    error::{MigrationError, Result},
    migration::{Migration, Migrations},
    projector::Projector,
    table::TableDefinition,
    version::Version,
};

/// Actions needed to go from `current` to `target`, in version order.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub current: Version,
    pub target: Version,
    pub actions: Vec<(Version, Migration)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn projectors(&self) -> Vec<Arc<dyn Projector>> {
        let mut projectors: Vec<Arc<dyn Projector>> = Vec::new();

        for (_, migration) in self.actions.iter() {
            if let Migration::ReplayTable(projector) = migration {
                if !projectors.iter().any(|p| p.name() == projector.name()) {
                    projectors.push(projector.clone());
                }
            }
        }

        projectors
    }

    pub fn replay_tables(&self) -> Vec<TableDefinition> {
        let mut tables: Vec<TableDefinition> = Vec::new();

        for table in self.projectors().iter().flat_map(|p| p.managed_tables()) {
            if !tables.iter().any(|t| t.name == table.name) {
                tables.push(table);
            }
        }

        tables
    }

    /// Alterations of tables that are not rebuilt by this plan.
    pub fn alter_tables(&self) -> Vec<(Version, String, String)> {
        let replayed = self.replay_tables();

        self.actions
            .iter()
            .filter_map(|(version, migration)| match migration {
                Migration::AlterTable { table, script }
                    if !replayed.iter().any(|t| &t.name == table) =>
                {
                    Some((*version, table.to_owned(), script.to_owned()))
                }
                _ => None,
            })
            .collect()
    }

    /// Event types consumed by the projectors of the plan.
    pub fn event_types(&self) -> Vec<String> {
        event_types(&self.projectors())
    }
}

/// Union of the message types of `projectors`, without duplicates.
pub fn event_types(projectors: &[Arc<dyn Projector>]) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();

    for event_type in projectors.iter().flat_map(|p| p.message_types()) {
        if !types.contains(&event_type) {
            types.push(event_type);
        }
    }

    types
}

pub struct Planner<'a> {
    migrations: &'a Migrations,
}

impl<'a> Planner<'a> {
    pub fn new(migrations: &'a Migrations) -> Self {
        Self { migrations }
    }

    /// Concatenates the actions of every version in `(current, target]`.
    ///
    /// Every version of the range must be declared, even with no action.
    pub fn plan(&self, current: Version, target: Version) -> Result<Plan> {
        if target < current {
            return Err(MigrationError::InvalidMigrationDefinition(format!(
                "new version {target} must be greater or equal to current version {current}"
            )));
        }

        let mut actions = Vec::new();

        for version in (current.0..target.0).map(|v| Version(v + 1)) {
            let migrations = self.migrations.versions().get(&version).ok_or_else(|| {
                MigrationError::InvalidMigrationDefinition(format!(
                    "version {version} is missing between {current} and {target}"
                ))
            })?;

            actions.extend(migrations.iter().cloned().map(|m| (version, m)));
        }

        if actions.is_empty() && current != target {
            return Err(MigrationError::InvalidMigrationDefinition(format!(
                "no migrations from version {current} to {target}"
            )));
        }

        Ok(Plan {
            current,
            target,
            actions,
        })
    }
}
