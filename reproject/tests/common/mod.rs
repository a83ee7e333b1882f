use async_trait::async_trait;
use parking_lot::Mutex;
use parse_display::{Display, FromStr};
use reproject::{
    store::{Event, Store, WriteEvent},
    ConfigBuilder, Persistor, Projector, Row, TableDefinition, TableRef, ViewSchemaConfig,
    ViewStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Display, FromStr)]
#[display(style = "kebab-case")]
pub enum AccountEvent {
    AccountCreated,
    AccountRenamed,
}

impl From<AccountEvent> for String {
    fn from(val: AccountEvent) -> Self {
        val.to_string()
    }
}

#[derive(Serialize, Deserialize)]
pub struct AccountCreated {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct AccountRenamed {
    pub name: String,
}

/// What goes wrong when an aggregate id starts with the faulty prefix.
#[derive(Clone, Copy)]
pub enum Fault {
    Error,
    Panic,
    /// Waits for a notification that never comes.
    Stall,
}

/// Projects accounts into one table, remembering every event it handled.
pub struct Accounts {
    table: String,
    fault: Option<(char, Fault)>,
    seen: Mutex<Vec<i64>>,
    stall: Notify,
    stall_started: AtomicBool,
    stall_finished: AtomicBool,
}

impl Accounts {
    pub fn new(table: &str) -> Arc<Self> {
        Self::with_fault(table, None)
    }

    /// Fails on the first event of an aggregate whose id starts with `prefix`.
    pub fn failing(table: &str, prefix: char) -> Arc<Self> {
        Self::with_fault(table, Some((prefix, Fault::Error)))
    }

    pub fn panicking(table: &str, prefix: char) -> Arc<Self> {
        Self::with_fault(table, Some((prefix, Fault::Panic)))
    }

    pub fn stalling(table: &str, prefix: char) -> Arc<Self> {
        Self::with_fault(table, Some((prefix, Fault::Stall)))
    }

    fn with_fault(table: &str, fault: Option<(char, Fault)>) -> Arc<Self> {
        Arc::new(Self {
            table: table.to_owned(),
            fault,
            seen: Mutex::new(Vec::new()),
            stall: Notify::new(),
            stall_started: AtomicBool::new(false),
            stall_finished: AtomicBool::new(false),
        })
    }

    pub fn stall_started(&self) -> bool {
        self.stall_started.load(Ordering::SeqCst)
    }

    pub fn stall_finished(&self) -> bool {
        self.stall_finished.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<i64> {
        let mut seen = self.seen.lock().clone();
        seen.sort();
        seen
    }

    pub fn clear_seen(&self) {
        self.seen.lock().clear();
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.table.to_owned(), "id")
    }
}

#[async_trait]
impl Projector for Accounts {
    fn name(&self) -> String {
        format!("{}-projector", self.table)
    }

    fn message_types(&self) -> Vec<String> {
        vec![
            AccountEvent::AccountCreated.into(),
            AccountEvent::AccountRenamed.into(),
        ]
    }

    fn managed_tables(&self) -> Vec<TableDefinition> {
        let table = &self.table;

        vec![TableDefinition::new(
            table,
            "id",
            format!(
                "CREATE TABLE {table}%SUFFIX% (id uuid NOT NULL, name text, version integer, CONSTRAINT {table}_pkey%SUFFIX% PRIMARY KEY (id));"
            ),
        )
        .indexes(format!(
            "CREATE INDEX {table}_name%SUFFIX% ON {table}%SUFFIX% (name);"
        ))]
    }

    async fn handle(&self, event: &Event, persistor: &mut dyn Persistor) -> anyhow::Result<()> {
        if let Some((prefix, fault)) = self.fault {
            if event.aggregate_id.to_string().starts_with(prefix) {
                match fault {
                    Fault::Error => anyhow::bail!("account {} is corrupted", event.aggregate_id),
                    Fault::Panic => panic!("account {} is unreadable", event.aggregate_id),
                    Fault::Stall => {
                        self.stall_started.store(true, Ordering::SeqCst);
                        self.stall.notified().await;
                        self.stall_finished.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        self.seen.lock().push(event.id);

        let id = json!(event.aggregate_id);

        match event.event_type.parse::<AccountEvent>()? {
            AccountEvent::AccountCreated => {
                let data: AccountCreated = event.to_data()?;
                let mut row = Row::new();
                row.insert("id".to_owned(), id);
                row.insert("name".to_owned(), Value::String(data.name));
                row.insert("version".to_owned(), json!(event.sequence_number));

                persistor.upsert(&self.table, row).await?;
            }
            AccountEvent::AccountRenamed => {
                let data: AccountRenamed = event.to_data()?;
                let mut row = persistor
                    .get(&self.table, &id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("account {id} not found"))?;

                row.insert("name".to_owned(), Value::String(data.name));
                row.insert("version".to_owned(), json!(event.sequence_number));

                persistor.upsert(&self.table, row).await?;
            }
        }

        Ok(())
    }
}

pub fn as_projector(accounts: &Arc<Accounts>) -> Arc<dyn Projector> {
    accounts.clone()
}

pub fn config() -> ViewSchemaConfig {
    ConfigBuilder::new()
        .block_size(10)
        .replay_workers(4)
        .online_group_exponent(1)
        .offline_group_exponent(1)
        .build()
}

pub fn random_ids(n: usize) -> Vec<Uuid> {
    (0..n).map(|_| Uuid::new_v4()).collect()
}

/// Ids whose first byte is `first`, so they fall in a known replay group.
pub fn ids_with_prefix(n: usize, first: u8) -> Vec<Uuid> {
    (0..n)
        .map(|_| {
            let mut bytes = *Uuid::new_v4().as_bytes();
            bytes[0] = first;
            Uuid::from_bytes(bytes)
        })
        .collect()
}

pub async fn create_accounts(store: &Store, ids: &[Uuid]) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(500) {
        let write_events = chunk
            .iter()
            .enumerate()
            .map(|(i, id)| {
                WriteEvent::new(AccountEvent::AccountCreated)
                    .aggregate(*id, 1)
                    .data(AccountCreated {
                        name: format!("account-{i}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        events.extend(store.append(write_events).await?);
    }

    Ok(events)
}

pub async fn rename_account(
    store: &Store,
    id: Uuid,
    sequence_number: i32,
    name: &str,
) -> anyhow::Result<Event> {
    let mut events = store
        .append(vec![WriteEvent::new(AccountEvent::AccountRenamed)
            .aggregate(id, sequence_number)
            .data(AccountRenamed {
                name: name.to_owned(),
            })?])
        .await?;

    events
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no event appended"))
}

/// `<table>_<version>` tables currently in the view store.
pub async fn versioned_tables(views: &ViewStore, table: &str) -> anyhow::Result<Vec<String>> {
    let prefix = format!("{table}_");

    Ok(views
        .tables()
        .await?
        .into_iter()
        .filter(|name| {
            name.strip_prefix(&prefix)
                .map(|version| version.parse::<u32>().is_ok())
                .unwrap_or(false)
        })
        .collect())
}
