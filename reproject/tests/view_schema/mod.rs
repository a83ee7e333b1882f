use reproject::{
    store::Store,
    tasks::{DryrunArgs, MigrateCommand},
    ConfigBuilder, Migration, MigrationError, MigrationStatus, Migrations, Phase, TableRef,
    Version, VersionLedger, ViewSchema, ViewStore,
};
use std::{collections::HashSet, time::Duration};

use crate::common::{
    as_projector, config, create_accounts, ids_with_prefix, random_ids, rename_account,
    versioned_tables, Accounts,
};

fn schema(views: &ViewStore, store: &Store, migrations: Migrations) -> ViewSchema {
    ViewSchema::with_config(views.clone(), store.clone(), migrations, config())
}

fn replay_accounts(accounts: &std::sync::Arc<Accounts>) -> Migrations {
    Migrations::new(1).version(1, Migration::replay_all(&[as_projector(accounts)]))
}

pub async fn test_ledger_transitions(views: &ViewStore, store: &Store) -> anyhow::Result<()> {
    views.migrate().await?;
    store.migrate().await?;

    let ledger = VersionLedger::new(views.clone(), store.clone());

    ledger.start_online(Version(1)).await?;

    let err = ledger.start_online(Version(1)).await.unwrap_err();
    assert!(matches!(err, MigrationError::ConcurrentMigration(_)));

    let err = ledger.start_online(Version(2)).await.unwrap_err();
    assert!(matches!(err, MigrationError::ConcurrentMigration(_)));

    let err = ledger.start_offline(Version(1)).await.unwrap_err();
    assert!(matches!(err, MigrationError::ConcurrentMigration(_)));

    let err = ledger.end_offline(Version(1)).await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidMigrationDefinition(_)));

    let err = ledger.end_online(Version(2)).await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidMigrationDefinition(_)));

    ledger.end_online(Version(1)).await?;

    let err = ledger.end_online(Version(1)).await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidMigrationDefinition(_)));

    assert_eq!(ledger.current_version().await?, Version::ZERO);
    assert_eq!(ledger.version_currently_migrating().await?, Some(Version(1)));

    ledger.start_offline(Version(1)).await?;
    ledger.end_offline(Version(1)).await?;

    assert_eq!(ledger.current_version().await?, Version(1));
    assert!(ledger.running().await?.is_empty());

    let entry = ledger.latest().await?.unwrap();
    assert_eq!(entry.phase, Phase::Done);
    assert!(entry.ended_at.is_some());
    assert!(entry.snapshot_marker.is_some());

    let err = ledger.start_offline(Version(1)).await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationAlreadyDone(Version(1))));

    let err = ledger.start_offline(Version(3)).await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationNotStarted(Version(3))));

    ledger.start_online(Version(2)).await?;
    ledger.rollback(Version(2)).await?;

    assert!(ledger.running().await?.is_empty());
    assert_eq!(ledger.current_version().await?, Version(1));

    ledger.rollback(Version(1)).await?;

    assert_eq!(ledger.current_version().await?, Version(1));

    Ok(())
}

pub async fn test_empty_plan(views: &ViewStore, store: &Store) -> anyhow::Result<()> {
    let schema = schema(views, store, Migrations::new(0));

    schema.migrate_online().await?;
    schema.migrate_offline().await?;

    assert!(schema.plan().await?.is_empty());
    assert!(schema.ledger().entries().await?.is_empty());
    assert_eq!(schema.current_version().await?, Version::ZERO);

    Ok(())
}

/// Migrating an empty event log only creates the tables.
pub async fn test_migrate_empty_log(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.migrate_online().await?;

    let entry = schema.ledger().latest().await?.unwrap();
    assert_eq!(entry.version, Version(1));
    assert_eq!(entry.phase, Phase::OnlineFinished);
    assert!(views.table_exists(&format!("{table}_1")).await?);
    assert_eq!(schema.table_names().resolve(table)?.name, table);

    schema.migrate_offline().await?;

    assert_eq!(schema.current_version().await?, Version(1));
    assert_eq!(store.replayed_count().await?, 0);
    assert!(versioned_tables(views, table).await?.is_empty());
    assert!(views.table_exists(table).await?);
    assert!(views.rows(&accounts.table_ref()).await?.is_empty());
    assert!(accounts.seen().is_empty());

    schema.migrate_online().await?;
    schema.migrate_offline().await?;

    assert_eq!(schema.ledger().entries().await?.len(), 1);

    Ok(())
}

/// Every event of a large log is replayed exactly once.
pub async fn test_replay_exactly_once(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    let events = create_accounts(store, &random_ids(10_000)).await?;
    let accounts = Accounts::new(table);
    let config = ConfigBuilder::new()
        .block_size(100)
        .replay_workers(8)
        .online_group_exponent(2)
        .build();

    let schema = ViewSchema::with_config(
        views.clone(),
        store.clone(),
        replay_accounts(&accounts),
        config,
    );

    schema.migrate_online().await?;

    let seen = accounts.seen();
    let mut expected = events.iter().map(|e| e.id).collect::<Vec<_>>();
    expected.sort();

    assert_eq!(seen.len(), 10_000);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 10_000);
    assert_eq!(seen, expected);
    assert_eq!(store.replayed_count().await?, 10_000);
    assert_eq!(
        views
            .rows(&TableRef::new(format!("{table}_1"), "id"))
            .await?
            .len(),
        10_000
    );

    accounts.clear_seen();
    schema.migrate_offline().await?;

    assert!(accounts.seen().is_empty());
    assert_eq!(schema.current_version().await?, Version(1));
    assert_eq!(views.rows(&accounts.table_ref()).await?.len(), 10_000);
    assert_eq!(store.replayed_count().await?, 0);

    Ok(())
}

/// A projector failing in one group of 16 rolls the whole version back.
pub async fn test_failing_group_rolls_back(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(20)).await?;
    create_accounts(store, &ids_with_prefix(1, 0x5a)).await?;

    let accounts = Accounts::failing(table, '5');
    let schema = schema(views, store, replay_accounts(&accounts));

    let err = schema.migrate_online().await.unwrap_err();

    match err {
        MigrationError::ReplayFailed { first, last, .. } => {
            assert_eq!(first, "500");
            assert_eq!(last, "5ff");
        }
        e => panic!("unexpected error {e}"),
    }

    assert!(schema.ledger().latest().await?.is_none());
    assert_eq!(schema.current_version().await?, Version::ZERO);
    assert!(versioned_tables(views, table).await?.is_empty());
    assert!(!views.table_exists(table).await?);
    assert_eq!(store.replayed_count().await?, 0);
    assert_eq!(schema.table_names().resolve(table)?.name, table);

    Ok(())
}

/// A panicking projector is reported with the prefix range of its group.
pub async fn test_panicking_group_rolls_back(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(20)).await?;
    create_accounts(store, &ids_with_prefix(1, 0x7a)).await?;

    let accounts = Accounts::panicking(table, '7');
    let schema = schema(views, store, replay_accounts(&accounts));

    let err = schema.migrate_online().await.unwrap_err();

    match err {
        MigrationError::ReplayFailed { first, last, .. } => {
            assert_eq!(first, "700");
            assert_eq!(last, "7ff");
        }
        e => panic!("unexpected error {e}"),
    }

    assert!(schema.ledger().latest().await?.is_none());
    assert!(versioned_tables(views, table).await?.is_empty());
    assert_eq!(store.replayed_count().await?, 0);

    Ok(())
}

/// A failing group stops its siblings instead of waiting for them.
pub async fn test_failure_cancels_other_groups(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &ids_with_prefix(1, 0x5a)).await?;
    create_accounts(store, &ids_with_prefix(1, 0x6a)).await?;

    let stalled_table = format!("stalled_{table}");
    let failing = Accounts::failing(table, '5');
    let stalling = Accounts::stalling(&stalled_table, '6');
    let config = ConfigBuilder::new()
        .block_size(10)
        .replay_workers(16)
        .online_group_exponent(1)
        .build();

    let schema = ViewSchema::with_config(
        views.clone(),
        store.clone(),
        Migrations::new(1).version(
            1,
            Migration::replay_all(&[as_projector(&failing), as_projector(&stalling)]),
        ),
        config,
    );

    let err = tokio::time::timeout(Duration::from_secs(10), schema.migrate_online())
        .await?
        .unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ReplayFailed { ref first, .. } if first == "500"
    ));
    assert!(!stalling.stall_finished());
    assert!(schema.ledger().latest().await?.is_none());
    assert!(versioned_tables(views, table).await?.is_empty());
    assert!(versioned_tables(views, &stalled_table).await?.is_empty());

    Ok(())
}

/// Offline replays only what online missed.
pub async fn test_offline_replays_new_events(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(100)).await?;

    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.migrate_online().await?;

    assert_eq!(accounts.seen().len(), 100);
    assert_eq!(store.replayed_count().await?, 100);

    accounts.clear_seen();

    let new_events = create_accounts(store, &random_ids(2)).await?;

    schema.migrate_offline().await?;

    let mut expected = new_events.iter().map(|e| e.id).collect::<Vec<_>>();
    expected.sort();

    assert_eq!(accounts.seen(), expected);
    assert_eq!(views.rows(&accounts.table_ref()).await?.len(), 102);
    assert!(!views.table_exists(&format!("{table}_1")).await?);
    assert_eq!(schema.current_version().await?, Version(1));

    Ok(())
}

/// Offline failures drop the new tables and forget the version.
pub async fn test_offline_failure_rolls_back(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &ids_with_prefix(10, 0x1b)).await?;

    let accounts = Accounts::failing(table, 'f');
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.migrate_online().await?;

    create_accounts(store, &ids_with_prefix(1, 0xfa)).await?;

    let err = schema.migrate_offline().await.unwrap_err();
    assert!(matches!(err, MigrationError::ReplayFailed { .. }));

    assert!(schema.ledger().entries().await?.is_empty());
    assert!(versioned_tables(views, table).await?.is_empty());
    assert!(!views.table_exists(table).await?);
    assert_eq!(store.replayed_count().await?, 0);
    assert_eq!(schema.table_names().resolve(table)?.name, table);

    Ok(())
}

pub async fn test_replay_is_idempotent(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    let events = create_accounts(store, &random_ids(50)).await?;

    for (i, event) in events.iter().take(10).enumerate() {
        rename_account(store, event.aggregate_id, 2, &format!("renamed-{i}")).await?;
    }

    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.create_view_tables().await?;

    assert_eq!(schema.current_version().await?, Version(1));
    assert_eq!(schema.replay_all(1).await?, 60);

    let table_ref = accounts.table_ref();
    let first = views.rows(&table_ref).await?;

    assert_eq!(first.len(), 50);
    assert_eq!(
        first
            .iter()
            .filter(|row| row["name"].as_str().unwrap_or_default().starts_with("renamed-"))
            .count(),
        10
    );

    views
        .delete_rows(&table_ref, first.iter().map(|row| row["id"].clone()).collect())
        .await?;

    assert!(views.rows(&table_ref).await?.is_empty());
    assert_eq!(schema.replay_all(2).await?, 60);
    assert_eq!(views.rows(&table_ref).await?, first);

    Ok(())
}

/// A second migration can not start while one is running, and does not roll
/// the running one back.
pub async fn test_concurrent_migration(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    let accounts = Accounts::new(table);
    let running = schema(views, store, replay_accounts(&accounts));

    running.create_view_schema_if_not_exists().await?;
    running.ledger().start_online(Version(1)).await?;

    let other = schema(
        views,
        store,
        Migrations::new(2)
            .version(1, Migration::replay_all(&[as_projector(&accounts)]))
            .version(
                2,
                vec![Migration::alter_table(
                    table,
                    format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS email text"),
                )],
            ),
    );

    let err = other.migrate_online().await.unwrap_err();
    assert!(matches!(err, MigrationError::ConcurrentMigration(_)));

    let running_entries = running.ledger().running().await?;
    assert_eq!(running_entries.len(), 1);
    assert_eq!(running_entries[0].version, Version(1));
    assert_eq!(running_entries[0].phase, Phase::OnlineRunning);

    let err = other.migrate_offline().await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationNotStarted(Version(2))));
    assert_eq!(running.ledger().running().await?.len(), 1);

    Ok(())
}

/// A later version only altering a table keeps its rows and leaves no
/// versioned table behind.
pub async fn test_alter_table(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(5)).await?;

    let accounts = Accounts::new(table);
    let first = schema(views, store, replay_accounts(&accounts));

    first.migrate_online().await?;
    first.migrate_offline().await?;

    let second = schema(
        views,
        store,
        Migrations::new(2)
            .version(1, Migration::replay_all(&[as_projector(&accounts)]))
            .version(
                2,
                vec![Migration::alter_table(
                    table,
                    format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS email text"),
                )],
            ),
    );

    assert!(second.plan().await?.replay_tables().is_empty());

    second.migrate_online().await?;
    second.migrate_offline().await?;

    assert_eq!(second.current_version().await?, Version(2));
    assert!(versioned_tables(views, table).await?.is_empty());
    assert_eq!(views.rows(&accounts.table_ref()).await?.len(), 5);

    Ok(())
}

pub async fn test_dryrun(views: &ViewStore, store: &Store, table: &str) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(30)).await?;

    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.create_view_tables().await?;

    let dryrun = schema.migrate_dryrun(Some("nothing*"), 1, None, None).await?;
    assert!(dryrun.projectors.is_empty());
    assert_eq!(dryrun.events, 0);

    let pattern = format!("{table}*");
    let dryrun = schema
        .migrate_dryrun(Some(pattern.as_str()), 1, None, None)
        .await?;
    assert_eq!(dryrun.projectors, vec![format!("{table}-projector")]);
    assert_eq!(dryrun.events, 30);
    assert_eq!(dryrun.records, 30);

    let dryrun = schema.migrate_dryrun(None, 1, Some(0), None).await?;
    assert_eq!(dryrun.events, 0);

    let err = schema.migrate_dryrun(None, 4, None, None).await.unwrap_err();
    assert!(matches!(err, MigrationError::TooManyGroups { .. }));

    assert_eq!(accounts.seen().len(), 30);
    assert!(views.rows(&accounts.table_ref()).await?.is_empty());
    assert_eq!(store.replayed_count().await?, 0);

    Ok(())
}

pub async fn test_status(views: &ViewStore, store: &Store, table: &str) -> anyhow::Result<()> {
    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    schema.create_view_schema_if_not_exists().await?;

    assert_eq!(
        schema.status().await?,
        MigrationStatus::Pending {
            current: Version::ZERO,
            pending: Version(1)
        }
    );

    schema.migrate_online().await?;
    create_accounts(store, &random_ids(2)).await?;

    match schema.status().await? {
        MigrationStatus::OnlineFinished {
            from,
            to,
            pending_events,
            ..
        } => {
            assert_eq!(from, Version::ZERO);
            assert_eq!(to, Version(1));
            assert!(pending_events >= 2);
        }
        status => panic!("unexpected status {status}"),
    }

    assert!(schema
        .status()
        .await?
        .to_string()
        .starts_with("Online migration from 0 to 1 is finished."));

    schema.migrate_offline().await?;

    let status = schema.status().await?;
    assert_eq!(
        status,
        MigrationStatus::UpToDate {
            current: Version(1)
        }
    );
    assert_eq!(status.to_string(), "Current version 1, no pending changes");

    schema.ledger().start_online(Version(2)).await?;

    assert_eq!(
        schema.status().await?,
        MigrationStatus::OnlineRunning {
            from: Version(1),
            to: Version(2)
        }
    );

    schema.ledger().end_online(Version(2)).await?;
    schema.ledger().start_offline(Version(2)).await?;

    let status = schema.status().await?;
    assert_eq!(
        status,
        MigrationStatus::OfflineRunning {
            from: Version(1),
            to: Version(2)
        }
    );
    assert_eq!(
        status.to_string(),
        "Offline migration from 1 to 2 is running"
    );

    Ok(())
}

pub async fn test_tasks(views: &ViewStore, store: &Store, table: &str) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(3)).await?;

    let accounts = Accounts::new(table);
    let schema = schema(views, store, replay_accounts(&accounts));

    assert_eq!(
        MigrateCommand::CheckPending.run(&schema).await?,
        "Migration is pending, current version: 0,\npending version: 1"
    );
    assert_eq!(
        MigrateCommand::CheckRunning.run(&schema).await?,
        "No running migrations"
    );

    MigrateCommand::Online.run(&schema).await?;

    assert_eq!(
        MigrateCommand::CheckRunning.run(&schema).await?,
        "Migration is running, current version: 0,\ntarget version 1"
    );

    assert_eq!(
        MigrateCommand::Offline.run(&schema).await?,
        "Current version in the database is: 1"
    );
    assert_eq!(
        MigrateCommand::CurrentVersion.run(&schema).await?,
        "Current version in the database is: 1"
    );
    assert_eq!(
        MigrateCommand::CheckPending.run(&schema).await?,
        "No pending migrations"
    );
    assert_eq!(
        MigrateCommand::Status.run(&schema).await?,
        "Current version 1, no pending changes"
    );
    assert_eq!(views.rows(&accounts.table_ref()).await?.len(), 3);

    Ok(())
}

pub async fn test_dryrun_task_uses_configured_exponent(
    views: &ViewStore,
    store: &Store,
    table: &str,
) -> anyhow::Result<()> {
    create_accounts(store, &random_ids(4)).await?;

    let accounts = Accounts::new(table);
    let schema = ViewSchema::with_config(
        views.clone(),
        store.clone(),
        replay_accounts(&accounts),
        ConfigBuilder::new().dryrun_group_exponent(4).build(),
    );

    schema.create_view_tables().await?;

    let err = MigrateCommand::Dryrun(DryrunArgs {
        pattern: None,
        group_exponent: None,
        limit: None,
        offset: None,
    })
    .run(&schema)
    .await
    .unwrap_err();

    assert!(matches!(err, MigrationError::TooManyGroups { groups: 65536, .. }));

    let output = MigrateCommand::Dryrun(DryrunArgs {
        pattern: None,
        group_exponent: Some(1),
        limit: None,
        offset: None,
    })
    .run(&schema)
    .await?;

    assert!(output.contains("4 events"));

    Ok(())
}
