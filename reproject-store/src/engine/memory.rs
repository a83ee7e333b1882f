use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashSet, sync::Arc};

use crate::{
    cursor::{Cursor, CursorType, QueryResult},
    engine::Engine,
    error::{Result, StoreError},
    event::{Event, EventFilter, WriteEvent},
    store::Store,
};

pub struct MemoryStore;

impl MemoryStore {
    pub fn create() -> Store {
        Store::new(Memory::default())
    }
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    replayed: HashSet<i64>,
    last_id: i64,
    last_xact_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<State>>);

#[async_trait]
impl Engine for Memory {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, write_events: Vec<WriteEvent>) -> Result<Vec<Event>> {
        let mut state = self.0.write();
        let mut keys = state
            .events
            .iter()
            .map(|e| (e.aggregate_id, e.sequence_number))
            .collect::<HashSet<_>>();

        for event in write_events.iter() {
            if !keys.insert((event.aggregate_id, event.sequence_number)) {
                return Err(StoreError::DuplicateSequenceNumber(format!(
                    "{}/{}",
                    event.aggregate_id, event.sequence_number
                )));
            }
        }

        state.last_xact_id += 1;
        let xact_id = state.last_xact_id;
        let mut events = Vec::with_capacity(write_events.len());

        for event in write_events {
            state.last_id += 1;
            let event = event.to_event(state.last_id, xact_id);
            state.events.push(event.clone());
            events.push(event);
        }

        Ok(events)
    }

    async fn read(
        &self,
        filter: &EventFilter,
        first: u16,
        after: Option<CursorType>,
    ) -> Result<QueryResult<Event>> {
        let after = match after {
            Some(cursor) => {
                let event = Event::from_cursor(&cursor)?;
                Some((event.aggregate_id, event.sequence_number))
            }
            _ => None,
        };

        let mut events = {
            let state = self.0.read();

            state
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .filter(|e| !filter.exclude_replayed || !state.replayed.contains(&e.id))
                .filter(|e| match after {
                    Some(key) => (e.aggregate_id, e.sequence_number) > key,
                    _ => true,
                })
                .cloned()
                .collect::<Vec<_>>()
        };

        events.sort_by_key(|e| (e.aggregate_id, e.sequence_number));
        events.truncate(usize::from(first) + 1);

        Ok(QueryResult::forward(events, first))
    }

    async fn snapshot_marker(&self) -> Result<i64> {
        Ok(self.0.read().last_xact_id + 1)
    }

    async fn count_since(&self, event_types: &[String], marker: i64) -> Result<i64> {
        let count = self
            .0
            .read()
            .events
            .iter()
            .filter(|e| e.xact_id >= marker && event_types.contains(&e.event_type))
            .count();

        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn truncate_replayed(&self) -> Result<()> {
        self.0.write().replayed.clear();

        Ok(())
    }

    async fn record_replayed(&self, ids: &[i64]) -> Result<()> {
        self.0.write().replayed.extend(ids.iter().copied());

        Ok(())
    }

    async fn is_replayed(&self, id: i64) -> Result<bool> {
        Ok(self.0.read().replayed.contains(&id))
    }

    async fn replayed_count(&self) -> Result<i64> {
        Ok(i64::try_from(self.0.read().replayed.len()).unwrap_or(i64::MAX))
    }
}
