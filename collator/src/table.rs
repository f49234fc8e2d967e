//! In-memory mapping from [ShardId] to read [Position].
//!
//! The [Table] enforces the two invariants every cursor must uphold: at most
//! [MAX_NEIGHBORS] entries and positions that never move backwards. Durability is
//! handled by [crate::store].

use crate::types::{CollatorState, Neighbor, Position, ShardId, MAX_NEIGHBORS};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when mutating a [Table].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("capacity exceeded: cannot track more than {0} neighbors")]
    CapacityExceeded(usize),
    #[error("cursor regression for shard {shard}: {current} -> {proposed}")]
    CursorRegression {
        shard: ShardId,
        current: Position,
        proposed: Position,
    },
}

/// Neighbor cursors keyed (and iterated) by ascending [ShardId].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    cursors: BTreeMap<ShardId, Position>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a snapshot.
    ///
    /// A [CollatorState] already guarantees unique shards and the capacity bound.
    pub fn from_state(state: &CollatorState) -> Self {
        Self {
            cursors: state
                .neighbors()
                .iter()
                .map(|n| (n.shard, n.position))
                .collect(),
        }
    }

    /// Snapshot the table in canonical order.
    pub fn to_state(&self) -> CollatorState {
        CollatorState::from_sorted(self.list())
    }

    pub fn get(&self, shard: ShardId) -> Option<Neighbor> {
        self.cursors
            .get(&shard)
            .map(|position| Neighbor::new(shard, *position))
    }

    /// Insert or advance the cursor for `neighbor.shard`.
    ///
    /// Fails (leaving the table unchanged) if a new entry would exceed [MAX_NEIGHBORS]
    /// or if the new position is behind the existing one.
    pub fn put(&mut self, neighbor: Neighbor) -> Result<(), Error> {
        match self.cursors.get(&neighbor.shard) {
            Some(current) if neighbor.position < *current => Err(Error::CursorRegression {
                shard: neighbor.shard,
                current: *current,
                proposed: neighbor.position,
            }),
            Some(_) => {
                self.cursors.insert(neighbor.shard, neighbor.position);
                Ok(())
            }
            None if self.cursors.len() >= MAX_NEIGHBORS => {
                Err(Error::CapacityExceeded(MAX_NEIGHBORS))
            }
            None => {
                self.cursors.insert(neighbor.shard, neighbor.position);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, shard: ShardId) -> Option<Neighbor> {
        self.cursors
            .remove(&shard)
            .map(|position| Neighbor::new(shard, position))
    }

    /// All neighbors, ordered by ascending [ShardId].
    pub fn list(&self) -> Vec<Neighbor> {
        self.cursors
            .iter()
            .map(|(shard, position)| Neighbor::new(*shard, *position))
            .collect()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.cursors.keys().copied()
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.cursors.contains_key(&shard)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
