//! Advance neighbor cursors in lockstep with local block production.
//!
//! # Design
//!
//! The [Engine] runs one cycle per local block. Each cycle:
//!
//! 1. Loads the last committed [CollatorState] into a draft [crate::table::Table].
//! 2. Reconciles the draft with the current [crate::topology::Membership]. A shard that
//!    returns after being removed resumes from the cursor it was removed at.
//! 3. Fetches pending messages from every tracked (and not halted) neighbor, with at most
//!    [Config::concurrency] fetches in flight and a [Config::fetch_timeout] per fetch.
//! 4. Interleaves the fetched messages round-robin by ascending [ShardId] until
//!    [Config::max_messages] is reached, preserving each neighbor's own order.
//! 5. Moves each consuming neighbor's draft cursor to just past its last included message.
//! 6. Hands the draft and the messages to the [Pipeline]. Only if the pipeline returns a
//!    [Proposal::Committed] is the draft persisted, in the same sync as the block.
//!
//! Fetch results are applied sequentially in shard order after every fetch has resolved, so
//! concurrency only affects latency. If a cycle is aborted (or its future dropped) before
//! the commit, the draft is discarded and the next cycle retries from the committed cursors.
//!
//! # Failures
//!
//! * Unavailable neighbors (including timeouts and contract-breaking responses) keep their
//!   cursor until a later cycle. Persistent unavailability escalates to `error` logs after
//!   [Config::unavailable_threshold] consecutive cycles.
//! * Unknown neighbors are reported to the [crate::topology::Reconciler].
//! * A reader that serves messages below the cursor, a message with no successor
//!   [crate::types::Position], or a cursor regression halts advancement for that neighbor.
//!   Halts are persisted with the next commit and listed in every [Report].
//! * Storage failures while committing are returned to the caller.

use crate::{
    store,
    types::{BlockNumber, CollatorState, Message, Neighbor, ShardId},
};
use futures::channel::oneshot;
use std::future::Future;
use thiserror::Error;

mod actor;
mod config;
mod metrics;

pub use actor::Engine;
pub use config::Config;
pub use metrics::Metrics;

/// Errors that stop the [Engine].
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),
}

/// A message handed to the [Pipeline] for inclusion in the next local block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Included {
    pub shard: ShardId,
    /// Committed cursor of `shard` when the cycle started.
    pub before: Neighbor,
    pub message: Message,
}

/// Result of asking the [Pipeline] to build a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proposal {
    /// The block at `height` is finalized for commit. `batch` holds its pending writes.
    Committed {
        height: BlockNumber,
        batch: store::Batch,
    },
    /// The block was rejected. Nothing from the cycle may be persisted.
    Aborted(String),
}

/// The local block-production pipeline.
pub trait Pipeline: Send + 'static {
    /// Build the block at `height` that applies `messages` (in order) and records `state`.
    ///
    /// If the pipeline cannot decide, the channel can be dropped (treated as an abort).
    fn propose(
        &mut self,
        height: BlockNumber,
        state: CollatorState,
        messages: Vec<Included>,
    ) -> impl Future<Output = oneshot::Receiver<Proposal>> + Send;
}

/// How a cycle ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed(BlockNumber),
    Aborted(String),
}

/// Summary of a single cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    /// Number of messages handed to the pipeline.
    pub messages: usize,
    pub unavailable: Vec<ShardId>,
    pub unknown: Vec<ShardId>,
    /// Neighbors that returned fewer messages than [Config::max_batch].
    pub drained: Vec<ShardId>,
    /// Neighbors inserted by the reconciler during the cycle.
    pub added: Vec<ShardId>,
    /// Neighbors whose removal was committed by the cycle.
    pub removed: Vec<ShardId>,
    /// Neighbors whose advancement is halted.
    pub halted: Vec<ShardId>,
    /// Members that cannot be tracked because the cursor table is full.
    pub rejected: Vec<ShardId>,
}

impl Report {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            messages: 0,
            unavailable: Vec::new(),
            unknown: Vec::new(),
            drained: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            halted: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn committed(&self) -> Option<BlockNumber> {
        match self.outcome {
            Outcome::Committed(height) => Some(height),
            Outcome::Aborted(_) => None,
        }
    }
}
