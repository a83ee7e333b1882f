use chrono::Utc;
use parking_lot::Mutex;
use reproject_store::{EventFilter, Store, LENGTH_OF_AGGREGATE_ID_PREFIX};
use std::{collections::HashMap, fmt, sync::Arc, time::Instant};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    config::ViewSchemaConfig,
    error::{MigrationError, Result},
    plan::event_types,
    projector::{Persistor, Projector, TransactionPolicy},
};

/// Total number of aggregate id prefixes, `16^3`.
pub const NUMBER_OF_PREFIXES: usize = 1 << (4 * LENGTH_OF_AGGREGATE_ID_PREFIX);

/// A contiguous slice of the aggregate id prefix space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayGroup {
    pub prefixes: Vec<String>,
}

impl ReplayGroup {
    pub fn first(&self) -> &str {
        self.prefixes.first().map(String::as_str).unwrap_or_default()
    }

    pub fn last(&self) -> &str {
        self.prefixes.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for ReplayGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first(), self.last())
    }
}

/// Every prefix, zero padded lowercase hex, sorted.
pub fn prefixes() -> Vec<String> {
    (0..NUMBER_OF_PREFIXES)
        .map(|i| format!("{i:0width$x}", width = LENGTH_OF_AGGREGATE_ID_PREFIX))
        .collect()
}

/// Splits the prefix space into `16^exponent` groups.
pub fn groups(exponent: u32) -> Result<Vec<ReplayGroup>> {
    groups_with(exponent, None, None)
}

/// [`groups`] skipping the first `offset` groups and keeping at most `limit`.
pub fn groups_with(
    exponent: u32,
    limit: Option<usize>,
    offset: Option<usize>,
) -> Result<Vec<ReplayGroup>> {
    let number_of_groups = 16usize
        .checked_pow(exponent)
        .filter(|groups| *groups <= NUMBER_OF_PREFIXES)
        .ok_or(MigrationError::TooManyGroups {
            groups: 16usize.saturating_pow(exponent),
            prefixes: NUMBER_OF_PREFIXES,
        })?;

    debug!("Number of groups {number_of_groups}, prefixes: {NUMBER_OF_PREFIXES}");

    let prefixes = prefixes();
    let size = NUMBER_OF_PREFIXES / number_of_groups;

    let groups = (0..number_of_groups)
        .map(|i| {
            let end = if i + 1 == number_of_groups {
                NUMBER_OF_PREFIXES
            } else {
                (i + 1) * size
            };

            ReplayGroup {
                prefixes: prefixes[i * size..end].to_vec(),
            }
        })
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    Ok(groups)
}

/// Hooks around the lifecycle of every group worker.
pub trait ReplayObserver: Send + Sync {
    fn on_prepare(&self, _group: &ReplayGroup) {}

    /// Called after each block with its size, the events replayed so far by
    /// the group and the ids of the block.
    fn on_progress(&self, _group: &ReplayGroup, _block: usize, _total: usize, _ids: &[i64]) {}

    /// Called once the group persistors are committed or discarded.
    fn on_commit(&self, _group: &ReplayGroup, _records: usize) {}
}

/// Logs group progress.
#[derive(Debug, Default)]
pub struct LogObserver;

impl ReplayObserver for LogObserver {
    fn on_progress(&self, group: &ReplayGroup, _block: usize, total: usize, _ids: &[i64]) {
        if total > 0 {
            debug!("group {group}: {total} events replayed");
        }
    }
}

/// Measures replay throughput without writing anything.
#[derive(Debug, Default)]
pub struct DryRunObserver {
    started: Mutex<HashMap<ReplayGroup, Instant>>,
    records: Mutex<usize>,
}

impl DryRunObserver {
    pub fn records(&self) -> usize {
        *self.records.lock()
    }
}

impl ReplayObserver for DryRunObserver {
    fn on_prepare(&self, group: &ReplayGroup) {
        self.started.lock().insert(group.clone(), Instant::now());
    }

    fn on_commit(&self, group: &ReplayGroup, records: usize) {
        let elapsed = self
            .started
            .lock()
            .remove(group)
            .map(|started| started.elapsed())
            .unwrap_or_default();

        *self.records.lock() += records;

        let seconds = elapsed.as_secs_f64();
        let rate = if seconds > 0.0 {
            records as f64 / seconds
        } else {
            0.0
        };

        info!("dryrun: processed {records} records in {seconds:.2} s ({rate:.2} records/s)");
    }
}

/// Everything a replay worker needs, handed explicitly to each of them.
#[derive(Clone)]
pub struct ReplayContext {
    pub projectors: Vec<Arc<dyn Projector>>,
    pub persistor: Box<dyn Persistor>,
    pub policy: TransactionPolicy,
    pub observer: Arc<dyn ReplayObserver>,
    pub record_replayed: bool,
}

impl ReplayContext {
    pub fn new(projectors: Vec<Arc<dyn Projector>>, persistor: Box<dyn Persistor>) -> Self {
        Self {
            projectors,
            persistor,
            policy: TransactionPolicy::Commit,
            observer: Arc::new(LogObserver),
            record_replayed: false,
        }
    }

    pub fn policy(mut self, policy: TransactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ReplayObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Records the ids of replayed events in the store ledger.
    pub fn record_replayed(mut self, record: bool) -> Self {
        self.record_replayed = record;
        self
    }
}

struct Worker {
    store: Store,
    projectors: Vec<(Arc<dyn Projector>, Vec<String>)>,
    persistor: Box<dyn Persistor>,
    dedicated: Vec<Option<Box<dyn Persistor>>>,
    policy: TransactionPolicy,
    observer: Arc<dyn ReplayObserver>,
    record_replayed: bool,
    filter: EventFilter,
    block_size: u16,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, group: &ReplayGroup) -> Result<usize> {
        self.observer.on_prepare(group);
        self.persistor.prepare().await?;

        for persistor in self.dedicated.iter_mut().flatten() {
            persistor.prepare().await?;
        }

        let mut total = 0;
        let mut cursor = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::ReplayCancelled);
            }

            let page = self
                .store
                .read(&self.filter, self.block_size, cursor)
                .await?;

            let mut ids = Vec::with_capacity(page.edges.len());

            for edge in page.edges.iter() {
                let event = &edge.node;

                for (i, (projector, types)) in self.projectors.iter().enumerate() {
                    if !types.contains(&event.event_type) {
                        continue;
                    }

                    let persistor = match self.dedicated[i].as_mut() {
                        Some(persistor) => persistor.as_mut(),
                        None => self.persistor.as_mut(),
                    };

                    projector.handle(event, persistor).await.map_err(|e| {
                        e.context(format!("{} failed on event {}", projector.name(), event.id))
                    })?;
                }

                ids.push(event.id);
            }

            total += ids.len();

            if self.record_replayed {
                self.store.record_replayed(&ids).await?;
            }

            self.observer.on_progress(group, ids.len(), total, &ids);

            if !page.page_info.has_next_page {
                break;
            }

            cursor = page.page_info.end_cursor;
        }

        let mut records = finish(self.persistor.as_mut(), self.policy).await?;

        for persistor in self.dedicated.iter_mut().flatten() {
            records += finish(persistor.as_mut(), self.policy).await?;
        }

        self.observer.on_commit(group, records);

        Ok(total)
    }
}

async fn finish(persistor: &mut dyn Persistor, policy: TransactionPolicy) -> Result<usize> {
    match policy {
        TransactionPolicy::Commit => persistor.commit().await,
        TransactionPolicy::Discard => persistor.discard().await,
    }
}

/// Drives the events of every group through the projectors, one bounded
/// pool of workers per replay.
#[derive(Clone)]
pub struct Replayer {
    store: Store,
    config: ViewSchemaConfig,
}

impl Replayer {
    pub fn new(store: Store, config: ViewSchemaConfig) -> Self {
        Self { store, config }
    }

    /// Replays `groups` and returns the number of events replayed.
    ///
    /// Events of a group are read in `(aggregate_id, sequence_number)` order.
    /// With `exclude_already_replayed`, only events missing from the ledger and
    /// created within the recency window are read. The first failing group
    /// cancels every other one and fails the whole replay.
    pub async fn replay(
        &self,
        ctx: ReplayContext,
        groups: Vec<ReplayGroup>,
        exclude_already_replayed: bool,
    ) -> Result<usize> {
        let started = Instant::now();
        let types = event_types(&ctx.projectors);
        let created_after = Utc::now()
            - chrono::Duration::from_std(self.config.offline_recency_window)
                .map_err(anyhow::Error::from)?;

        info!("groups: {}", groups.len());
        info!("Start replaying events");

        let mut persistor = ctx.persistor;
        let mut dedicated = ctx
            .projectors
            .iter()
            .map(|projector| projector.replay_persistor(persistor.as_ref()))
            .collect::<Vec<_>>();

        let projectors = ctx
            .projectors
            .iter()
            .map(|projector| (projector.clone(), projector.message_types()))
            .collect::<Vec<_>>();

        let semaphore = Arc::new(Semaphore::new(self.config.number_of_replay_workers.max(1)));
        let cancel = CancellationToken::new();
        let mut set = JoinSet::new();
        let mut spawned = HashMap::new();
        let number_of_groups = groups.len();

        for (index, group) in groups.into_iter().enumerate() {
            let mut filter = EventFilter::new(types.clone(), group.prefixes.clone());

            if exclude_already_replayed {
                filter = filter.exclude_replayed(created_after);
            }

            let worker = Worker {
                store: self.store.clone(),
                projectors: projectors.clone(),
                persistor: persistor.fork(),
                dedicated: dedicated
                    .iter()
                    .map(|p| p.as_ref().map(|p| p.fork()))
                    .collect(),
                policy: ctx.policy,
                observer: ctx.observer.clone(),
                record_replayed: ctx.record_replayed,
                filter,
                block_size: self.config.block_size.max(1),
                cancel: cancel.clone(),
            };

            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let spawned_group = group.clone();

            let handle = set.spawn(async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(anyhow::Error::from)?;

                    let group_started = Instant::now();

                    let replayed = tokio::select! {
                        _ = cancel.cancelled() => Err(MigrationError::ReplayCancelled),
                        replayed = worker.run(&group) => replayed,
                    }?;

                    info!(
                        "Group ({group}) {}/{number_of_groups} replayed in {:.2} s",
                        index + 1,
                        group_started.elapsed().as_secs_f64()
                    );

                    Ok(replayed)
                }
                .await;

                (group, result)
            });

            spawned.insert(handle.id(), spawned_group);
        }

        let mut total = 0;
        let mut failure = None;

        while let Some(joined) = set.join_next().await {
            let (group, result) = match joined {
                Ok((group, result)) => {
                    spawned.retain(|_, spawned_group| spawned_group != &group);
                    (Some(group), result)
                }
                Err(e) if e.is_cancelled() => continue,
                Err(e) => (spawned.remove(&e.id()), Err(MigrationError::from(e))),
            };

            match result {
                Ok(replayed) => total += replayed,
                Err(MigrationError::ReplayCancelled) if failure.is_some() => {}
                Err(e) => {
                    if failure.is_none() {
                        if let Some(group) = group.as_ref() {
                            error!(
                                "Replaying failed for ids: ^{} - {}",
                                group.first(),
                                group.last()
                            );
                        }

                        log_error_chain(&e);

                        cancel.cancel();
                        set.abort_all();
                        failure = Some(e.into_replay_failure(group.as_ref()));
                    }
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }

        finish(persistor.as_mut(), ctx.policy).await?;

        for persistor in dedicated.iter_mut().flatten() {
            finish(persistor.as_mut(), ctx.policy).await?;
        }

        info!(
            "{number_of_groups} groups replayed, {total} events in {:.2} s",
            started.elapsed().as_secs_f64()
        );

        Ok(total)
    }
}

impl MigrationError {
    fn into_replay_failure(self, group: Option<&ReplayGroup>) -> MigrationError {
        MigrationError::ReplayFailed {
            first: group.map(|g| g.first().to_owned()).unwrap_or_default(),
            last: group.map(|g| g.last().to_owned()).unwrap_or_default(),
            source: Box::new(self),
        }
    }
}

fn log_error_chain(err: &MigrationError) {
    let mut source = match err {
        MigrationError::Any(err) => {
            error!("{err}");
            err.source()
        }
        err => {
            error!("{err}");
            std::error::Error::source(err)
        }
    };

    while let Some(err) = source {
        error!("caused by: {err}");
        source = err.source();
    }
}
