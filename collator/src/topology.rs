//! Keep the tracked neighbors in line with the shard-membership service.
//!
//! The [Reconciler] never deletes a cursor on its own. Each cycle it diffs the current
//! membership against the (draft) cursor table:
//!
//! * Shards in the membership but not in the table are inserted where a previous removal
//!   left them, or at [Position::GENESIS] if they were never tracked.
//! * Shards in the table but not in the membership become _pending removal_. They stay in
//!   the table (and keep being read) until a cycle observes that they are drained, and
//!   are only forgotten once that cycle commits.
//!
//! Because pending removals are derived from durable state, they survive aborted cycles
//! and restarts without any bookkeeping of their own.
//!
//! [Position::GENESIS]: crate::types::Position::GENESIS

use crate::{
    table::{self, Table},
    types::{Neighbor, Position, ShardId},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
};
use tracing::{debug, error, info, warn};

/// Source of truth for which shards this collator must track.
pub trait Membership: Send + Sync + 'static {
    /// The current set of neighbor shards.
    fn current(&self) -> impl Future<Output = BTreeSet<ShardId>> + Send;
}

/// Topology changes applied to a draft table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    /// Shards inserted into the table.
    pub added: Vec<ShardId>,
    /// Shards that could not be inserted because the table is full.
    pub rejected: Vec<ShardId>,
    /// Shards tracked but no longer in the membership.
    pub pending: Vec<ShardId>,
}

/// Applies membership changes to the cursor table.
#[derive(Debug, Default)]
pub struct Reconciler {
    pending: BTreeSet<ShardId>,
    rejected: BTreeSet<ShardId>,
    unknown: BTreeMap<ShardId, u64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert new members into `draft` and recompute the set of shards pending removal.
    ///
    /// A new member found in `resume` continues from that position instead of genesis.
    pub fn reconcile(
        &mut self,
        draft: &mut Table,
        current: &BTreeSet<ShardId>,
        resume: &BTreeMap<ShardId, Position>,
    ) -> Changes {
        let mut changes = Changes::default();

        // Forget rejections for shards that have left the membership
        self.rejected.retain(|shard| current.contains(shard));

        for &shard in current {
            if draft.contains(shard) || self.rejected.contains(&shard) {
                continue;
            }
            let neighbor = match resume.get(&shard) {
                Some(&position) => Neighbor::new(shard, position),
                None => Neighbor::genesis(shard),
            };
            match draft.put(neighbor) {
                Ok(()) => {
                    if resume.contains_key(&shard) {
                        info!(shard, position = %neighbor.position, "resuming removed neighbor");
                    } else {
                        info!(shard, "tracking new neighbor");
                    }
                    changes.added.push(shard);
                }
                Err(err @ table::Error::CapacityExceeded(_)) => {
                    error!(shard, %err, "cannot track neighbor");
                    self.rejected.insert(shard);
                    changes.rejected.push(shard);
                }
                Err(err) => {
                    // An absent entry cannot regress
                    error!(shard, %err, "unexpected table error");
                }
            }
        }

        let pending: BTreeSet<_> = draft
            .shards()
            .filter(|shard| !current.contains(shard))
            .collect();
        for shard in pending.difference(&self.pending) {
            info!(shard, "neighbor removed from topology: draining");
        }
        for shard in self.pending.difference(&pending) {
            if current.contains(shard) {
                info!(shard, "neighbor re-added: removal cancelled");
            }
        }
        self.pending = pending;
        changes.pending = self.pending.iter().copied().collect();
        changes
    }

    /// Whether `shard` is waiting to be drained before removal.
    pub fn is_pending(&self, shard: ShardId) -> bool {
        self.pending.contains(&shard)
    }

    /// Members that could not be tracked because the table was full.
    pub fn rejected(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.rejected.iter().copied()
    }

    /// Shards waiting to be drained, in ascending order.
    pub fn pending(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.pending.iter().copied()
    }

    /// Remove `shard` from `draft` if it is pending removal.
    ///
    /// Must only be called after a fetch for `shard` returned no messages. The removal
    /// becomes permanent only once the draft commits (see [Reconciler::confirm]).
    pub fn retire(&self, draft: &mut Table, shard: ShardId) -> Option<Neighbor> {
        if !self.is_pending(shard) {
            return None;
        }
        let neighbor = draft.remove(shard)?;
        debug!(shard, position = %neighbor.position, "neighbor drained");
        Some(neighbor)
    }

    /// Record that the removal of `shards` has been committed.
    pub fn confirm(&mut self, shards: &[ShardId]) {
        for shard in shards {
            if self.pending.remove(shard) {
                self.unknown.remove(shard);
                info!(shard, "neighbor removed");
            }
        }
    }

    /// Record that a reader could not find `shard`, returning how often that happened.
    pub fn report_unknown(&mut self, shard: ShardId) -> u64 {
        let count = self.unknown.entry(shard).or_default();
        *count += 1;
        if self.pending.contains(&shard) {
            // Cannot prove the shard is drained, so the removal stays queued
            debug!(shard, count = *count, "unknown neighbor pending removal");
        } else {
            warn!(
                shard,
                count = *count,
                "topology inconsistency: member shard unknown to reader"
            );
        }
        *count
    }

    /// Number of times `shard` has been reported unknown.
    pub fn unknown(&self, shard: ShardId) -> u64 {
        self.unknown.get(&shard).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, MAX_NEIGHBORS};

    fn members(shards: impl IntoIterator<Item = ShardId>) -> BTreeSet<ShardId> {
        shards.into_iter().collect()
    }

    #[test]
    fn test_additions_start_at_genesis() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        draft.put(Neighbor::new(1, Position::new(3, 3))).unwrap();

        let changes = reconciler.reconcile(&mut draft, &members([1, 2, 3]), &BTreeMap::new());
        assert_eq!(changes.added, vec![2, 3]);
        assert!(changes.pending.is_empty());
        assert_eq!(draft.get(2), Some(Neighbor::genesis(2)));

        // Existing cursors are untouched
        assert_eq!(draft.get(1).unwrap().position, Position::new(3, 3));
    }

    #[test]
    fn test_removal_waits_for_drain() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        reconciler.reconcile(&mut draft, &members([1, 2]), &BTreeMap::new());

        // Shard 2 leaves the topology
        let changes = reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());
        assert_eq!(changes.pending, vec![2]);
        assert!(draft.contains(2));

        // Only pending shards can be retired
        assert!(reconciler.retire(&mut draft, 1).is_none());
        assert_eq!(reconciler.retire(&mut draft, 2), Some(Neighbor::genesis(2)));
        assert!(!draft.contains(2));
        reconciler.confirm(&[2]);
        assert_eq!(reconciler.pending().count(), 0);
    }

    #[test]
    fn test_removal_survives_abort() {
        let mut reconciler = Reconciler::new();
        let mut committed = Table::new();
        reconciler.reconcile(&mut committed, &members([1, 2]), &BTreeMap::new());

        // Cycle retires shard 2 but is aborted (draft discarded)
        let mut draft = committed.clone();
        reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());
        reconciler.retire(&mut draft, 2).unwrap();

        // Next cycle starts from committed state and still sees the removal
        let mut draft = committed.clone();
        let changes = reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());
        assert_eq!(changes.pending, vec![2]);
        assert!(draft.contains(2));
    }

    #[test]
    fn test_readd_cancels_removal() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        reconciler.reconcile(&mut draft, &members([1, 2]), &BTreeMap::new());
        draft.put(Neighbor::new(2, Position::new(4, 0))).unwrap();

        reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());
        assert!(reconciler.is_pending(2));

        let changes = reconciler.reconcile(&mut draft, &members([1, 2]), &BTreeMap::new());
        assert!(!reconciler.is_pending(2));
        assert!(changes.added.is_empty());

        // Cursor is kept rather than reset
        assert_eq!(draft.get(2).unwrap().position, Position::new(4, 0));
    }

    #[test]
    fn test_readded_shard_resumes_from_retired_position() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());

        let resume = BTreeMap::from([(2, Position::new(7, 3))]);
        let changes = reconciler.reconcile(&mut draft, &members([1, 2, 3]), &resume);
        assert_eq!(changes.added, vec![2, 3]);
        assert_eq!(draft.get(2), Some(Neighbor::new(2, Position::new(7, 3))));
        assert_eq!(draft.get(3), Some(Neighbor::genesis(3)));

        // Tracked shards ignore stale resume positions
        draft.put(Neighbor::new(2, Position::new(9, 0))).unwrap();
        let changes = reconciler.reconcile(&mut draft, &members([1, 2, 3]), &resume);
        assert!(changes.added.is_empty());
        assert_eq!(draft.get(2).unwrap().position, Position::new(9, 0));
    }

    #[test]
    fn test_capacity_rejection_is_remembered() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        let full = members(0..MAX_NEIGHBORS as ShardId);
        reconciler.reconcile(&mut draft, &full, &BTreeMap::new());
        assert_eq!(draft.len(), MAX_NEIGHBORS);

        let mut over = full.clone();
        over.insert(MAX_NEIGHBORS as ShardId);
        let changes = reconciler.reconcile(&mut draft, &over, &BTreeMap::new());
        assert_eq!(changes.rejected, vec![MAX_NEIGHBORS as ShardId]);
        assert_eq!(
            reconciler.rejected().collect::<Vec<_>>(),
            vec![MAX_NEIGHBORS as ShardId]
        );
        assert_eq!(draft.len(), MAX_NEIGHBORS);

        // Not retried while still a member
        let changes = reconciler.reconcile(&mut draft, &over, &BTreeMap::new());
        assert!(changes.rejected.is_empty());
        assert!(changes.added.is_empty());
    }

    #[test]
    fn test_unknown_reports() {
        let mut reconciler = Reconciler::new();
        let mut draft = Table::new();
        reconciler.reconcile(&mut draft, &members([1, 2]), &BTreeMap::new());
        assert_eq!(reconciler.report_unknown(1), 1);
        assert_eq!(reconciler.report_unknown(1), 2);

        // Unknown shards pending removal stay queued
        reconciler.reconcile(&mut draft, &members([1]), &BTreeMap::new());
        reconciler.report_unknown(2);
        assert!(reconciler.is_pending(2));
        assert_eq!(reconciler.unknown(2), 1);
    }
}
