use tracing::info;

use crate::{
    engine::{Change, ViewStore},
    error::Result,
    plan::Plan,
    table::{statements, TableNames},
    version::Version,
};

/// Applies the structural side of a plan and keeps the logical table
/// bindings in sync with it.
#[derive(Clone)]
pub struct Executor {
    views: ViewStore,
    table_names: TableNames,
}

impl Executor {
    pub fn new(views: ViewStore, table_names: TableNames) -> Self {
        Self { views, table_names }
    }

    pub fn table_names(&self) -> &TableNames {
        &self.table_names
    }

    /// Creates `<table>_<target>` for every replayed table and alters the
    /// live tables that are not replayed.
    ///
    /// Tables are created one by one, a failure leaves the previous ones in
    /// place for the rollback to drop.
    pub async fn execute_online(&self, plan: &Plan) -> Result<()> {
        for table in plan.replay_tables() {
            info!("create table {}", table.versioned_name(Some(plan.target)));

            self.views
                .execute(vec![Change::CreateTable {
                    table: table.table_ref(Some(plan.target)),
                    statements: table.create_statements(Some(plan.target)),
                }])
                .await?;

            self.table_names.bind(&table, Some(plan.target));
        }

        for (version, table, script) in plan.alter_tables() {
            info!("alter table {table} for version {version}");

            self.views
                .execute(vec![Change::AlterTable {
                    statements: statements(&script, None),
                    table,
                }])
                .await?;
        }

        Ok(())
    }

    pub async fn create_indexes_after_execute_online(&self, plan: &Plan) -> Result<()> {
        for table in plan.replay_tables() {
            let statements = table.index_statements(Some(plan.target));

            if statements.is_empty() {
                continue;
            }

            self.views
                .execute(vec![Change::CreateIndexes {
                    table: table.versioned_name(Some(plan.target)),
                    statements,
                }])
                .await?;
        }

        Ok(())
    }

    pub fn reset_table_names(&self, plan: &Plan) {
        for table in plan.replay_tables() {
            self.table_names.bind(&table, None);
        }
    }

    pub fn set_table_names_to_new_version(&self, plan: &Plan) {
        for table in plan.replay_tables() {
            self.table_names.bind(&table, Some(plan.target));
        }
    }

    /// Stages the swap of every replayed table: the live table is retired as
    /// `<table>_<current>` and `<table>_<target>` takes its name.
    ///
    /// Nothing is applied, the caller commits the changes in one batch.
    pub async fn execute_offline(&self, plan: &Plan, current: Version) -> Result<Vec<Change>> {
        let mut changes = Vec::new();

        for table in plan.replay_tables() {
            if self.views.table_exists(&table.name).await? {
                changes.push(Change::RenameTable {
                    from: table.name.to_owned(),
                    to: table.versioned_name(Some(current)),
                });
            }

            changes.push(Change::RenameTable {
                from: table.versioned_name(Some(plan.target)),
                to: table.name.to_owned(),
            });
        }

        Ok(changes)
    }

    /// Drops `<table>_<version>` for every known table and every version from
    /// `current - lookback` to `target`.
    pub async fn drop_old_tables(
        &self,
        current: Version,
        target: Version,
        lookback: u32,
        tables: &[String],
    ) -> Result<()> {
        let from = current.saturating_sub(lookback);
        let mut changes = Vec::new();

        for version in from.0..=target.0 {
            for table in tables.iter() {
                let name = format!("{table}_{version}");

                if self.views.table_exists(&name).await? {
                    info!("drop table {name}");
                    changes.push(Change::DropTable { table: name });
                }
            }
        }

        self.views.execute(changes).await
    }
}
