use async_trait::async_trait;
use dyn_clone::DynClone;

use crate::{
    cursor::{CursorType, QueryResult},
    error::Result,
    event::{Event, EventFilter, WriteEvent},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Creates the event and replayed-id tables when missing.
    async fn migrate(&self) -> Result<()>;

    async fn append(&self, events: Vec<WriteEvent>) -> Result<Vec<Event>>;

    async fn read(
        &self,
        filter: &EventFilter,
        first: u16,
        after: Option<CursorType>,
    ) -> Result<QueryResult<Event>>;

    /// Ordering token below which every transaction is committed.
    async fn snapshot_marker(&self) -> Result<i64>;

    /// Counts events of the given types written at or after `marker`.
    async fn count_since(&self, event_types: &[String], marker: i64) -> Result<i64>;

    async fn truncate_replayed(&self) -> Result<()>;
    async fn record_replayed(&self, ids: &[i64]) -> Result<()>;
    async fn is_replayed(&self, id: i64) -> Result<bool>;
    async fn replayed_count(&self) -> Result<i64>;
}

dyn_clone::clone_trait_object!(Engine);
