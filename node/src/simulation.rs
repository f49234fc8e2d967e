//! Simulated neighbor shards.

use crate::config::SimulationConfig;
use commonware_runtime::Clock;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, info};
use xshard_collator::{
    mocks::Ledger,
    types::{CollatorState, Position, ShardId},
};

/// Produces blocks (and outages) for every neighbor on a shared [Ledger].
pub struct Simulation<E: Clock> {
    context: E,
    cfg: SimulationConfig,
    neighbors: Vec<ShardId>,
    ledger: Ledger<E>,
    rng: StdRng,
    offline: BTreeSet<ShardId>,
}

impl<E: Clock> Simulation<E> {
    /// Simulate every neighbor tracked in `state`.
    ///
    /// Each chain is extended up to its committed cursor with blocks whose messages were
    /// already applied, so traffic continues where the collator left off after a restart.
    pub fn new(context: E, cfg: SimulationConfig, state: &CollatorState) -> Self {
        let ledger = Ledger::new(context.clone());
        for neighbor in state.neighbors() {
            let shard = neighbor.shard;
            let position = neighbor.position;
            for _ in 0..position.block {
                ledger.append(shard, 0);
            }
            ledger.append(shard, position.index as usize);
            if position != Position::GENESIS {
                debug!(shard, %position, "resumed neighbor chain");
            }
        }
        Self {
            context,
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            neighbors: state.neighbors().iter().map(|n| n.shard).collect(),
            ledger,
            offline: BTreeSet::new(),
        }
    }

    /// Ledger the simulated neighbors append to.
    pub fn ledger(&self) -> Ledger<E> {
        self.ledger.clone()
    }

    /// Advance every neighbor by one tick.
    pub fn step(&mut self) {
        for &shard in &self.neighbors {
            if self.rng.gen_bool(self.cfg.outage_probability) {
                if self.offline.remove(&shard) {
                    info!(shard, "neighbor back online");
                    self.ledger.set_unavailable(shard, false);
                } else {
                    info!(shard, "neighbor offline");
                    self.offline.insert(shard);
                    self.ledger.set_unavailable(shard, true);
                }
            }
            if self.rng.gen_bool(self.cfg.block_probability) {
                let txs = self.rng.gen_range(0..=self.cfg.max_txs);
                let block = self.ledger.append(shard, txs);
                debug!(shard, block, txs, "neighbor produced block");
            }
        }
    }

    /// Step forever at the configured interval.
    pub async fn run(mut self) {
        let interval = Duration::from_millis(self.cfg.block_interval_ms);
        loop {
            self.step();
            self.context.sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner as _};
    use xshard_collator::{reader::Reader, types::Neighbor};

    fn config(seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            block_probability: 1.0,
            max_txs: 4,
            ..Default::default()
        }
    }

    #[test_traced]
    fn test_deterministic_traffic() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let genesis = CollatorState::genesis([1, 2]).unwrap();
            let mut a = Simulation::new(context.clone(), config(3), &genesis);
            let mut b = Simulation::new(context, config(3), &genesis);
            for _ in 0..10 {
                a.step();
                b.step();
            }
            for shard in [1, 2] {
                assert_eq!(a.ledger().messages(shard), b.ledger().messages(shard));
            }

            // Every neighbor starts with an empty genesis block
            let messages = a.ledger().messages(1);
            assert!(messages.iter().all(|m| m.position >= Position::new(1, 0)));
        });
    }

    #[test_traced]
    fn test_resume_from_cursors() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let state = CollatorState::new(vec![
                Neighbor::new(1, Position::new(3, 2)),
                Neighbor::new(2, Position::GENESIS),
            ])
            .unwrap();
            let mut simulation = Simulation::new(context, config(5), &state);
            let ledger = simulation.ledger();
            assert_eq!(ledger.blocks(1), 4);
            assert_eq!(ledger.blocks(2), 1);

            // Nothing pending at the committed cursors
            for neighbor in state.neighbors() {
                let pending = ledger.fetch(neighbor.shard, neighbor.position, 10).await;
                assert!(pending.unwrap().is_empty());
            }

            // New traffic lands after the cursors
            simulation.step();
            let pending = ledger.fetch(1, Position::new(3, 2), 10).await.unwrap();
            assert!(pending.iter().all(|m| m.position >= Position::new(4, 0)));
            assert_eq!(ledger.blocks(1), 5);
        });
    }
}
