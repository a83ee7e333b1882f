use crate::{
    cursor::{CursorType, QueryResult},
    engine::Engine,
    error::Result,
    event::{Event, EventFilter, WriteEvent},
};

#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        self.engine.migrate().await
    }

    pub async fn append(&self, events: Vec<WriteEvent>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        self.engine.append(events).await
    }

    pub async fn read(
        &self,
        filter: &EventFilter,
        first: u16,
        after: Option<CursorType>,
    ) -> Result<QueryResult<Event>> {
        if filter.event_types.is_empty() || filter.aggregate_prefixes.is_empty() {
            return Ok(QueryResult::default());
        }

        self.engine.read(filter, first, after).await
    }

    /// Reads every event matching `filter`, page by page.
    pub async fn read_all(&self, filter: &EventFilter, first: u16) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut cursor = None;

        loop {
            let page = self.read(filter, first, cursor).await?;
            events.extend(page.edges.into_iter().map(|edge| edge.node));

            if !page.page_info.has_next_page {
                break;
            }

            cursor = page.page_info.end_cursor;
        }

        Ok(events)
    }

    pub async fn snapshot_marker(&self) -> Result<i64> {
        self.engine.snapshot_marker().await
    }

    pub async fn count_since(&self, event_types: &[String], marker: i64) -> Result<i64> {
        if event_types.is_empty() {
            return Ok(0);
        }

        self.engine.count_since(event_types, marker).await
    }

    pub async fn truncate_replayed(&self) -> Result<()> {
        self.engine.truncate_replayed().await
    }

    /// Records event ids as replayed. Ids already recorded are ignored.
    pub async fn record_replayed(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        self.engine.record_replayed(ids).await
    }

    pub async fn is_replayed(&self, id: i64) -> Result<bool> {
        self.engine.is_replayed(id).await
    }

    pub async fn replayed_count(&self) -> Result<i64> {
        self.engine.replayed_count().await
    }
}
