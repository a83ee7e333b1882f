use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{cursor::Cursor, error::Result};

/// Number of leading characters of an aggregate id used to partition the
/// event log. The pg backend indexes exactly this substring.
pub const LENGTH_OF_AGGREGATE_ID_PREFIX: usize = 3;

/// Returns the partition prefix of an aggregate id, the first
/// [`LENGTH_OF_AGGREGATE_ID_PREFIX`] characters of its lowercase hyphenated form.
pub fn aggregate_prefix(aggregate_id: &Uuid) -> String {
    aggregate_id
        .hyphenated()
        .to_string()
        .chars()
        .take(LENGTH_OF_AGGREGATE_ID_PREFIX)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct Event {
    pub id: i64,
    pub aggregate_id: Uuid,
    pub sequence_number: i32,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub xact_id: i64,
}

impl Event {
    pub fn to_data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn prefix(&self) -> String {
        aggregate_prefix(&self.aggregate_id)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self {
            id: i64::default(),
            aggregate_id: Uuid::nil(),
            sequence_number: i32::default(),
            event_type: String::default(),
            data: Value::default(),
            created_at: Utc::now(),
            xact_id: i64::default(),
        }
    }
}

impl Cursor for Event {
    fn keys() -> Vec<&'static str> {
        vec!["aggregate_id", "sequence_number"]
    }

    fn serialize(&self) -> Vec<String> {
        vec![
            self.aggregate_id.to_string(),
            self.sequence_number.to_string(),
        ]
    }

    fn deserialize(values: Vec<&str>) -> Result<Self> {
        let mut values = values.iter();
        let aggregate_id = Self::deserialize_as("aggregate_id", values.next())?;
        let sequence_number = Self::deserialize_as("sequence_number", values.next())?;

        Ok(Event {
            aggregate_id,
            sequence_number,
            ..Default::default()
        })
    }
}

/// An event to append. Identifier, creation time and transaction token are
/// assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct WriteEvent {
    pub aggregate_id: Uuid,
    pub sequence_number: i32,
    pub event_type: String,
    pub data: Value,
}

impl WriteEvent {
    pub fn new<N: Into<String>>(event_type: N) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    pub fn aggregate(mut self, aggregate_id: Uuid, sequence_number: i32) -> Self {
        self.aggregate_id = aggregate_id;
        self.sequence_number = sequence_number;

        self
    }

    pub fn data<D: Serialize>(mut self, value: D) -> Result<Self> {
        self.data = serde_json::to_value(&value)?;

        Ok(self)
    }

    pub fn to_event(&self, id: i64, xact_id: i64) -> Event {
        Event {
            id,
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            event_type: self.event_type.to_owned(),
            data: self.data.clone(),
            created_at: Utc::now(),
            xact_id,
        }
    }
}

/// Selects the events of one replay group.
///
/// Reads are always ordered by `(aggregate_id, sequence_number)`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Vec<String>,
    pub aggregate_prefixes: Vec<String>,
    pub exclude_replayed: bool,
    pub created_after: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn new(event_types: Vec<String>, aggregate_prefixes: Vec<String>) -> Self {
        Self {
            event_types,
            aggregate_prefixes,
            ..Self::default()
        }
    }

    /// Skips events already in the replayed ledger and events created before
    /// `created_after`.
    pub fn exclude_replayed(mut self, created_after: DateTime<Utc>) -> Self {
        self.exclude_replayed = true;
        self.created_after = Some(created_after);

        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.iter().any(|t| t == &event.event_type) {
            return false;
        }

        let prefix = event.prefix();

        if !self.aggregate_prefixes.iter().any(|p| p == &prefix) {
            return false;
        }

        match self.created_after {
            Some(after) => event.created_at > after,
            _ => true,
        }
    }
}
