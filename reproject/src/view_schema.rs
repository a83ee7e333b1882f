use glob_match::glob_match;
use reproject_store::Store;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{
    config::ViewSchemaConfig,
    engine::{Change, ViewStore},
    error::{MigrationError, Result},
    executor::Executor,
    migration::Migrations,
    plan::{event_types, Plan, Planner},
    projector::{Projector, ReplayPersistor, TransactionPolicy},
    replay::{groups, groups_with, DryRunObserver, ReplayContext, Replayer},
    table::TableNames,
    version::{Phase, Version, VersionLedger},
};

/// Where the view schema stands relative to the target version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    UpToDate {
        current: Version,
    },
    Pending {
        current: Version,
        pending: Version,
    },
    OnlineRunning {
        from: Version,
        to: Version,
    },
    OnlineFinished {
        from: Version,
        to: Version,
        transactions_behind: i64,
        pending_events: i64,
    },
    OfflineRunning {
        from: Version,
        to: Version,
    },
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::UpToDate { current } => {
                write!(f, "Current version {current}, no pending changes")
            }
            MigrationStatus::Pending { current, pending } => {
                write!(f, "Current version {current}, pending version {pending}")
            }
            MigrationStatus::OnlineRunning { from, to } => {
                write!(f, "Online migration from {from} to {to} is running")
            }
            MigrationStatus::OnlineFinished {
                from,
                to,
                transactions_behind,
                pending_events,
            } => write!(
                f,
                "Online migration from {from} to {to} is finished.\n{transactions_behind} transactions behind current state ({pending_events} pending events)."
            ),
            MigrationStatus::OfflineRunning { from, to } => {
                write!(f, "Offline migration from {from} to {to} is running")
            }
        }
    }
}

/// Outcome of [`ViewSchema::migrate_dryrun`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRun {
    pub projectors: Vec<String>,
    pub events: usize,
    pub records: usize,
    pub elapsed: Duration,
}

/// Migrates the view schema to the target version of its [`Migrations`].
///
/// A migration runs in two steps. [`ViewSchema::migrate_online`] builds the
/// new tables while the application keeps writing events, then
/// [`ViewSchema::migrate_offline`], run while no events are written, replays
/// what the online step missed and swaps the tables.
pub struct ViewSchema {
    views: ViewStore,
    store: Store,
    migrations: Migrations,
    config: ViewSchemaConfig,
    ledger: VersionLedger,
    executor: Executor,
    replayer: Replayer,
    plan: OnceCell<Plan>,
}

impl ViewSchema {
    pub fn new(views: ViewStore, store: Store, migrations: Migrations) -> Self {
        Self::with_config(views, store, migrations, ViewSchemaConfig::default())
    }

    pub fn with_config(
        views: ViewStore,
        store: Store,
        migrations: Migrations,
        config: ViewSchemaConfig,
    ) -> Self {
        let table_names = TableNames::new(&migrations.tables());

        Self {
            ledger: VersionLedger::new(views.clone(), store.clone()),
            executor: Executor::new(views.clone(), table_names),
            replayer: Replayer::new(store.clone(), config.clone()),
            views,
            store,
            migrations,
            config,
            plan: OnceCell::new(),
        }
    }

    pub fn views(&self) -> &ViewStore {
        &self.views
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn config(&self) -> &ViewSchemaConfig {
        &self.config
    }

    pub fn migrations(&self) -> &Migrations {
        &self.migrations
    }

    /// Logical table bindings, shared with every persistor of this schema.
    pub fn table_names(&self) -> TableNames {
        self.executor.table_names().clone()
    }

    /// Ambient persistor writing into the currently bound tables.
    pub fn persistor(&self) -> ReplayPersistor {
        ReplayPersistor::new(self.views.clone(), self.table_names())
    }

    pub async fn current_version(&self) -> Result<Version> {
        self.ledger.current_version().await
    }

    /// Plan from the current version to the target, computed once.
    pub async fn plan(&self) -> Result<&Plan> {
        self.plan
            .get_or_try_init(|| async {
                let current = self.current_version().await?;

                Planner::new(&self.migrations).plan(current, self.migrations.target())
            })
            .await
    }

    /// Creates the version ledger, event and replayed id tables.
    pub async fn create_view_schema_if_not_exists(&self) -> Result<()> {
        self.migrate_metadata_tables().await
    }

    pub async fn migrate_metadata_tables(&self) -> Result<()> {
        self.views.migrate().await?;
        self.store.migrate().await?;

        Ok(())
    }

    /// Creates every managed table under its live name and records the target
    /// version as done, without replaying anything.
    pub async fn create_view_tables(&self) -> Result<()> {
        self.create_view_schema_if_not_exists().await?;

        let target = self.migrations.target();

        if target == self.current_version().await? {
            return Ok(());
        }

        for table in self.migrations.tables() {
            let mut changes = vec![Change::CreateTable {
                table: table.table_ref(None),
                statements: table.create_statements(None),
            }];

            let indexes = table.index_statements(None);

            if !indexes.is_empty() {
                changes.push(Change::CreateIndexes {
                    table: table.name.to_owned(),
                    statements: indexes,
                });
            }

            self.views.execute(changes).await?;
        }

        self.ledger.create_done(target).await
    }

    /// Replays every projector into the currently bound tables.
    pub async fn replay_all(&self, group_exponent: u32) -> Result<usize> {
        let ctx = ReplayContext::new(self.migrations.projectors(), Box::new(self.persistor()));

        self.replayer
            .replay(ctx, groups(group_exponent)?, false)
            .await
    }

    /// First step of a migration, run while the application is running.
    ///
    /// Creates `<table>_<target>` for every replayed table, replays every
    /// event into them while recording replayed ids, then leaves the live
    /// tables bound. Any failure after the version is claimed rolls back.
    pub async fn migrate_online(&self) -> Result<()> {
        self.migrate_metadata_tables().await?;

        let plan = self.plan().await?;
        let target = self.migrations.target();
        let current = self.current_version().await?;

        if target == current {
            return Ok(());
        }

        ensure_version_correct(current, target)?;

        info!("Start migrate_online for version {target}");

        match self.run_online(plan, current).await {
            Ok(()) => {
                info!("Done migrate_online for version {target}");
                Ok(())
            }
            Err(e) if !e.should_rollback() => Err(e),
            Err(e) => {
                self.rollback_migration(plan, current).await;
                Err(e)
            }
        }
    }

    async fn run_online(&self, plan: &Plan, current: Version) -> Result<()> {
        let target = plan.target;

        self.ledger.start_online(target).await?;
        self.store.truncate_replayed().await?;
        self.executor
            .drop_old_tables(
                current,
                target,
                self.config.old_version_lookback,
                &self.migrations.table_names(),
            )
            .await?;
        self.executor.execute_online(plan).await?;

        let projectors = plan.projectors();

        if !projectors.is_empty() {
            let ctx =
                ReplayContext::new(projectors, Box::new(self.persistor())).record_replayed(true);

            self.replayer
                .replay(ctx, groups(self.config.online_group_exponent)?, false)
                .await?;
        }

        self.executor
            .create_indexes_after_execute_online(plan)
            .await?;
        self.executor.reset_table_names(plan);
        self.ledger.end_online(target).await
    }

    /// Last step of a migration. No events may be written while it runs.
    ///
    /// Replays the events the online step did not, then in one transaction
    /// retires the live tables as `<table>_<current>`, promotes the new ones
    /// and marks the version done.
    pub async fn migrate_offline(&self) -> Result<()> {
        let target = self.migrations.target();
        let current = self.current_version().await?;

        if target == current {
            return Ok(());
        }

        ensure_version_correct(current, target)?;

        let plan = self.plan().await?;

        match self.ledger.start_offline(target).await {
            Ok(()) => {}
            Err(MigrationError::MigrationAlreadyDone(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        info!("Start migrate_offline for version {target}");

        match self.run_offline(plan, current).await {
            Ok(()) => {
                info!("Migrated to version {target}");
                Ok(())
            }
            Err(MigrationError::MigrationAlreadyDone(_)) => Ok(()),
            Err(e) if !e.should_rollback() => Err(e),
            Err(e) => {
                self.rollback_migration(plan, current).await;
                Err(e)
            }
        }
    }

    async fn run_offline(&self, plan: &Plan, current: Version) -> Result<()> {
        self.executor.set_table_names_to_new_version(plan);

        let projectors = plan.projectors();

        if !projectors.is_empty() {
            let ctx = ReplayContext::new(projectors, Box::new(self.persistor()));

            self.replayer
                .replay(ctx, groups(self.config.offline_group_exponent)?, true)
                .await?;
        }

        let mut changes = self.executor.execute_offline(plan, current).await?;
        changes.push(VersionLedger::end_offline_change(plan.target));

        self.views.execute(changes).await.map_err(|e| match e {
            MigrationError::UnexpectedPhase { version, .. } => {
                MigrationError::ConcurrentMigration(format!(
                    "version {version} is no longer {}",
                    Phase::OfflineRunning
                ))
            }
            e => e,
        })?;

        self.executor.reset_table_names(plan);
        self.store.truncate_replayed().await?;

        Ok(())
    }

    /// Replays the matching projectors over a slice of the groups without
    /// writing anything, to measure throughput.
    ///
    /// Projectors with a dedicated replay persistor are skipped.
    pub async fn migrate_dryrun(
        &self,
        pattern: Option<&str>,
        group_exponent: u32,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<DryRun> {
        let persistor = self.persistor();
        let pattern = pattern.unwrap_or("*");

        let projectors = self
            .migrations
            .projectors()
            .into_iter()
            .filter(|p| {
                p.replay_persistor(&persistor).is_none() && glob_match(pattern, &p.name())
            })
            .collect::<Vec<Arc<dyn Projector>>>();

        let names = projectors.iter().map(|p| p.name()).collect::<Vec<_>>();
        let started = Instant::now();

        if projectors.is_empty() {
            info!("Dry run found no projector matching {pattern}");

            return Ok(DryRun {
                projectors: names,
                events: 0,
                records: 0,
                elapsed: started.elapsed(),
            });
        }

        info!(
            "Dry run using the following projectors: {}",
            names.join(", ")
        );

        let observer = Arc::new(DryRunObserver::default());
        let ctx = ReplayContext::new(projectors, Box::new(persistor))
            .policy(TransactionPolicy::Discard)
            .observer(observer.clone());

        let events = self
            .replayer
            .replay(ctx, groups_with(group_exponent, limit, offset)?, false)
            .await?;

        let elapsed = started.elapsed();

        info!(
            "Done migrate_dryrun for version {} in {:.2} s",
            self.migrations.target(),
            elapsed.as_secs_f64()
        );

        Ok(DryRun {
            projectors: names,
            events,
            records: observer.records(),
            elapsed,
        })
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let pending = self.migrations.target();
        let latest_done = self
            .ledger
            .latest_done()
            .await?
            .map(|entry| entry.version)
            .unwrap_or(Version::ZERO);

        let Some(latest) = self.ledger.latest().await? else {
            return Ok(if pending == Version::ZERO {
                MigrationStatus::UpToDate {
                    current: Version::ZERO,
                }
            } else {
                MigrationStatus::Pending {
                    current: Version::ZERO,
                    pending,
                }
            });
        };

        let status = match latest.phase {
            Phase::Done if latest.version == pending => MigrationStatus::UpToDate {
                current: latest.version,
            },
            Phase::Done => MigrationStatus::Pending {
                current: latest.version,
                pending,
            },
            Phase::OnlineRunning => MigrationStatus::OnlineRunning {
                from: latest_done,
                to: latest.version,
            },
            Phase::OnlineFinished => {
                let marker = latest.snapshot_marker.unwrap_or_default();
                let types = event_types(&self.plan().await?.projectors());

                MigrationStatus::OnlineFinished {
                    from: latest_done,
                    to: latest.version,
                    transactions_behind: self.store.snapshot_marker().await? - marker,
                    pending_events: self.store.count_since(&types, marker).await?,
                }
            }
            Phase::OfflineRunning => MigrationStatus::OfflineRunning {
                from: latest_done,
                to: latest.version,
            },
        };

        Ok(status)
    }

    /// Undoes an unfinished migration. Failures are logged, the caller
    /// returns the error that triggered the rollback.
    async fn rollback_migration(&self, plan: &Plan, current: Version) {
        error!("Rollback migration to version {}", plan.target);

        if let Err(e) = self
            .executor
            .drop_old_tables(
                current,
                plan.target,
                self.config.old_version_lookback,
                &self.migrations.table_names(),
            )
            .await
        {
            error!("failed to drop tables of version {}: {e}", plan.target);
        }

        if let Err(e) = self.store.truncate_replayed().await {
            error!("failed to truncate replayed ids: {e}");
        }

        self.executor.reset_table_names(plan);

        if let Err(e) = self.ledger.rollback(plan.target).await {
            error!("failed to rollback version {}: {e}", plan.target);
        }
    }
}

fn ensure_version_correct(current: Version, target: Version) -> Result<()> {
    if target < current {
        return Err(MigrationError::InvalidMigrationDefinition(format!(
            "new version {target} must be greater or equal to current version {current}"
        )));
    }

    Ok(())
}
