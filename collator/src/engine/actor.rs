use super::{Config, Error, Included, Metrics, Outcome, Pipeline, Proposal, Report};
use crate::{
    reader::{self, Fetch, Reader},
    store::Store,
    table::Table,
    topology::{Membership, Reconciler},
    types::{Message, Neighbor, Position, ShardId},
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Storage};
use futures::{stream, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    future::Future,
    pin::pin,
};
use tracing::{debug, error, info, warn};

/// Drives cross-shard message consumption, one local block at a time.
pub struct Engine<
    E: Clock + Storage + RuntimeMetrics,
    R: Reader,
    P: Pipeline,
    M: Membership,
> {
    context: E,
    cfg: Config,
    store: Store<E>,
    reader: R,
    pipeline: P,
    membership: M,
    reconciler: Reconciler,

    halted: BTreeSet<ShardId>,
    unavailable: BTreeMap<ShardId, u32>,

    metrics: Metrics,
}

impl<E: Clock + Storage + RuntimeMetrics, R: Reader, P: Pipeline, M: Membership>
    Engine<E, R, P, M>
{
    /// Create a new engine on top of an initialized [Store].
    pub fn new(
        context: E,
        cfg: Config,
        store: Store<E>,
        reader: R,
        pipeline: P,
        membership: M,
    ) -> Self {
        let metrics = Metrics::init(&context);
        let halted = store.halted().clone();
        metrics.height.set(store.height() as i64);
        metrics.neighbors.set(store.state().len() as i64);
        metrics.halted.set(halted.len() as i64);
        Self {
            context,
            cfg,
            store,
            reader,
            pipeline,
            membership,
            reconciler: Reconciler::new(),
            halted,
            unavailable: BTreeMap::new(),
            metrics,
        }
    }

    pub fn store(&self) -> &Store<E> {
        &self.store
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Neighbors whose advancement has been halted.
    pub fn halted(&self) -> &BTreeSet<ShardId> {
        &self.halted
    }

    /// Close the underlying [Store].
    pub async fn close(self) -> Result<(), Error> {
        self.store.close().await?;
        Ok(())
    }

    fn halt(&mut self, shard: ShardId) {
        if self.halted.insert(shard) {
            self.metrics.halted.set(self.halted.len() as i64);
        }
    }

    /// Run a single block-production cycle.
    ///
    /// Dropping the returned future before it resolves leaves the committed state untouched.
    pub async fn cycle(&mut self) -> Result<Report, Error> {
        self.metrics.cycles.inc();
        let (tip, committed) = self.store.load();
        let height = tip + 1;
        let mut draft = Table::from_state(&committed);

        // Apply topology changes observed at cycle start
        let current = self.membership.current().await;
        let mut resume = BTreeMap::new();
        for &shard in &current {
            if draft.contains(shard) {
                continue;
            }
            if let Some(position) = self.store.retired(shard)? {
                resume.insert(shard, position);
            }
        }
        let changes = self.reconciler.reconcile(&mut draft, &current, &resume);

        // Fetch from every neighbor that can still advance
        let targets: Vec<Neighbor> = draft
            .list()
            .into_iter()
            .filter(|neighbor| !self.halted.contains(&neighbor.shard))
            .collect();
        let max = self.cfg.max_batch.get();
        let timeout = self.cfg.fetch_timeout;
        let context = &self.context;
        let source = &self.reader;
        let results: Vec<(Neighbor, Fetch)> = stream::iter(targets)
            .map(|cursor| async move {
                let result = reader::fetch(context, source, cursor, max, timeout).await;
                (cursor, result)
            })
            .buffered(self.cfg.concurrency.get())
            .collect()
            .await;

        // Classify results (in ascending shard order)
        let mut unavailable = Vec::new();
        let mut unknown = Vec::new();
        let mut drained = Vec::new();
        let mut queues: Vec<(Neighbor, VecDeque<Message>)> = Vec::new();
        let mut retired = Vec::new();
        for (cursor, result) in results {
            let shard = cursor.shard;
            match result {
                Fetch::Fetched(messages) => {
                    if let Some(streak) = self.unavailable.remove(&shard) {
                        info!(shard, streak, "neighbor available again");
                    }
                    if messages.len() < max {
                        drained.push(shard);
                    }
                    if messages.is_empty() {
                        if let Some(neighbor) = self.reconciler.retire(&mut draft, shard) {
                            retired.push(neighbor);
                        }
                        continue;
                    }
                    queues.push((cursor, messages.into()));
                }
                Fetch::Unavailable(reason) => {
                    self.metrics.unavailable.inc();
                    let streak = self.unavailable.entry(shard).or_default();
                    *streak += 1;
                    if *streak >= self.cfg.unavailable_threshold {
                        error!(
                            shard,
                            streak = *streak,
                            %reason,
                            "neighbor persistently unavailable"
                        );
                    } else {
                        warn!(shard, streak = *streak, %reason, "neighbor unavailable");
                    }
                    unavailable.push(shard);
                }
                Fetch::Unknown => {
                    self.metrics.unknown.inc();
                    self.reconciler.report_unknown(shard);
                    unknown.push(shard);
                }
                Fetch::Fatal(violation) => {
                    error!(shard, position = %cursor.position, %violation, "halting neighbor");
                    self.halt(shard);
                }
            }
        }

        // Interleave round-robin until the block is full
        let mut included = interleave(queues, self.cfg.max_messages.get());

        // Advance draft cursors past the last included message of each neighbor
        let mut last: BTreeMap<ShardId, Position> = BTreeMap::new();
        for item in &included {
            last.insert(item.shard, item.message.position);
        }
        for (shard, position) in last {
            let result = match position.next() {
                Some(next) => draft.put(Neighbor::new(shard, next)).map_err(|e| e.to_string()),
                None => Err(format!("no position after {position}")),
            };
            if let Err(reason) = result {
                error!(shard, %reason, "halting neighbor");
                self.halt(shard);
                included.retain(|item| item.shard != shard);
            }
        }

        // Hand the block to the pipeline
        let state = draft.to_state();
        let count = included.len();
        debug!(
            height,
            messages = count,
            neighbors = state.len(),
            unavailable = unavailable.len(),
            "proposing block"
        );
        let receiver = self.pipeline.propose(height, state.clone(), included).await;
        let proposal = receiver
            .await
            .unwrap_or_else(|_| Proposal::Aborted("pipeline dropped proposal".into()));

        let outcome = match proposal {
            Proposal::Committed {
                height: committed,
                mut batch,
            } => {
                for neighbor in &retired {
                    batch.retire(*neighbor);
                }
                if &self.halted != self.store.halted() {
                    batch.halt(self.halted.clone());
                }
                self.store.commit(state, committed, batch).await?;
                let shards: Vec<ShardId> = retired.iter().map(|n| n.shard).collect();
                self.reconciler.confirm(&shards);
                self.metrics.commits.inc();
                self.metrics.messages.inc_by(count as u64);
                self.metrics.height.set(committed as i64);
                self.metrics.neighbors.set(self.store.state().len() as i64);
                info!(height = committed, messages = count, "committed block");
                Outcome::Committed(committed)
            }
            Proposal::Aborted(reason) => {
                self.metrics.aborts.inc();
                warn!(height, %reason, "pipeline aborted block: discarding cursor advances");
                retired.clear();
                Outcome::Aborted(reason)
            }
        };

        let mut report = Report::new(outcome);
        report.messages = count;
        report.unavailable = unavailable;
        report.unknown = unknown;
        report.drained = drained;
        report.added = changes.added;
        report.removed = retired.iter().map(|n| n.shard).collect();
        report.halted = self.halted.iter().copied().collect();
        report.rejected = self.reconciler.rejected().collect();
        Ok(report)
    }

    /// Run cycles until `stop` resolves, pausing [Config::cycle_interval] between them.
    ///
    /// A cycle in progress when `stop` resolves is dropped before it can commit.
    pub async fn run(&mut self, stop: impl Future<Output = ()>) -> Result<(), Error> {
        let mut stop = pin!(stop);
        loop {
            select! {
                _ = &mut stop => {
                    info!("stopping engine");
                    return Ok(());
                },
                result = self.cycle() => {
                    let report = result?;
                    debug!(?report, "cycle complete");
                },
            }
            select! {
                _ = &mut stop => {
                    info!("stopping engine");
                    return Ok(());
                },
                _ = self.context.sleep(self.cfg.cycle_interval) => {},
            }
        }
    }
}

/// Take one message per neighbor per round (in queue order) until `budget` is reached.
fn interleave(mut queues: Vec<(Neighbor, VecDeque<Message>)>, budget: usize) -> Vec<Included> {
    let mut included = Vec::new();
    loop {
        let mut progressed = false;
        for (before, queue) in queues.iter_mut() {
            if included.len() >= budget {
                return included;
            }
            if let Some(message) = queue.pop_front() {
                included.push(Included {
                    shard: before.shard,
                    before: *before,
                    message,
                });
                progressed = true;
            }
        }
        if !progressed {
            return included;
        }
    }
}
