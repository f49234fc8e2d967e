//! Durable, versioned persistence of [CollatorState] snapshots.
//!
//! [Store] keeps one snapshot per committed local block height in a
//! [commonware_storage::metadata::Metadata] store. A snapshot is never written on its own:
//! [Store::commit] stages it next to the [Batch] carrying the block's own writes and syncs
//! everything at once, so cursor advances and message application survive (or vanish)
//! together.
//!
//! # Keys
//!
//! Every record is stored under a prefixed `u64` key:
//!
//! ```text
//! STATE_PREFIX   || height  ->  CollatorState
//! TIP_PREFIX     || 0       ->  last committed height (u64)
//! RETIRED_PREFIX || shard   ->  final Position of a removed neighbor
//! HALTED_PREFIX  || 0       ->  shards whose advancement is halted (Vec<ShardId>)
//! ```
//!
//! Prefixes below [FIRST_PIPELINE_PREFIX] belong to the [Store]. The pipeline may write
//! anything at or above it.

use crate::types::{BlockNumber, CollatorState, Neighbor, ShardId, MAX_NEIGHBORS};
use commonware_codec::{Decode, DecodeExt, Encode, Error as CodecError};
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::{self, Metadata};
use commonware_utils::sequence::prefixed_u64::U64;
use std::{collections::BTreeSet, num::NonZeroU64};
use thiserror::Error;

mod cursor;

pub use cursor::Store;

/// Prefix of snapshot records, indexed by local height.
pub const STATE_PREFIX: u8 = 0;

/// Prefix of the record holding the last committed height.
pub const TIP_PREFIX: u8 = 1;

/// Prefix of the final cursor of each removed neighbor, indexed by [ShardId].
pub const RETIRED_PREFIX: u8 = 2;

/// Prefix of the record holding the halted neighbors.
pub const HALTED_PREFIX: u8 = 3;

/// Lowest prefix available to [Batch::put].
pub const FIRST_PIPELINE_PREFIX: u8 = 0x10;

/// Height associated with the genesis snapshot.
pub const GENESIS_HEIGHT: BlockNumber = 0;

/// Errors that can occur when interacting with the [Store].
#[derive(Debug, Error)]
pub enum Error {
    #[error("metadata error: {0}")]
    Metadata(#[from] metadata::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid snapshot at height {0}: {1}")]
    InvalidSnapshot(BlockNumber, CodecError),
    #[error("missing snapshot at height {0}")]
    MissingSnapshot(BlockNumber),
    #[error("height mismatch: expected {expected}, found {found}")]
    HeightMismatch {
        expected: BlockNumber,
        found: BlockNumber,
    },
    #[error("prefix {0} is reserved")]
    ReservedPrefix(u8),
}

/// Configuration for the [Store].
#[derive(Clone, Debug)]
pub struct Config {
    /// The [commonware_runtime::Storage] partition holding the store.
    pub partition: String,

    /// Number of most recent snapshots to keep. `None` keeps every snapshot.
    ///
    /// Committing height `h` deletes the snapshot at `h - retention` in the same sync.
    pub retention: Option<NonZeroU64>,

    /// Prefixes of pipeline records indexed by local height.
    ///
    /// Records under these prefixes are pruned together with the snapshot of the same height.
    pub pipeline_prefixes: Vec<u8>,
}

/// A set of writes committed together with a snapshot.
///
/// Operations are applied in insertion order (a later operation on the same key wins).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<(u8, u64, Option<Vec<u8>>)>,

    retired: Vec<Neighbor>,
    halted: Option<BTreeSet<ShardId>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `(prefix, index)`.
    ///
    /// `prefix` must be at least [FIRST_PIPELINE_PREFIX] or the commit fails.
    pub fn put(&mut self, prefix: u8, index: u64, value: impl Into<Vec<u8>>) {
        self.ops.push((prefix, index, Some(value.into())));
    }

    pub fn delete(&mut self, prefix: u8, index: u64) {
        self.ops.push((prefix, index, None));
    }

    /// Number of pipeline operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Record the final cursor of a neighbor removed by this commit.
    pub(crate) fn retire(&mut self, neighbor: Neighbor) {
        self.retired.push(neighbor);
    }

    /// Replace the persisted set of halted neighbors.
    pub(crate) fn halt(&mut self, halted: BTreeSet<ShardId>) {
        self.halted = Some(halted);
    }
}

impl IntoIterator for Batch {
    type Item = (u8, u64, Option<Vec<u8>>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Key of the snapshot associated with `height`.
pub fn state_key(height: BlockNumber) -> U64 {
    U64::new(STATE_PREFIX, height)
}

fn tip_key() -> U64 {
    U64::new(TIP_PREFIX, 0)
}

fn retired_key(shard: ShardId) -> U64 {
    U64::new(RETIRED_PREFIX, shard as u64)
}

fn halted_key() -> U64 {
    U64::new(HALTED_PREFIX, 0)
}

async fn open<E: Clock + Storage + Metrics>(
    context: E,
    partition: &str,
) -> Result<Metadata<E, U64, Vec<u8>>, Error> {
    let metadata = Metadata::init(
        context.with_label("metadata"),
        metadata::Config {
            partition: partition.to_string(),
            codec_config: ((0..).into(), ()),
        },
    )
    .await?;
    Ok(metadata)
}

fn decode_state(height: BlockNumber, raw: &[u8]) -> Result<CollatorState, Error> {
    CollatorState::decode(raw).map_err(|e| Error::InvalidSnapshot(height, e))
}

fn decode_halted(raw: &[u8]) -> Result<BTreeSet<ShardId>, Error> {
    let shards = Vec::<ShardId>::decode_cfg(raw, &((0..=MAX_NEIGHBORS).into(), ()))?;
    Ok(shards.into_iter().collect())
}

fn encode_halted(halted: &BTreeSet<ShardId>) -> Vec<u8> {
    halted
        .iter()
        .copied()
        .collect::<Vec<ShardId>>()
        .encode()
        .to_vec()
}

/// Read the snapshot at `height` (or the latest) from `partition` without modifying it.
pub async fn read<E: Clock + Storage + Metrics>(
    context: E,
    partition: &str,
    height: Option<BlockNumber>,
) -> Result<Option<(BlockNumber, CollatorState)>, Error> {
    let metadata = open(context, partition).await?;
    let height = match height {
        Some(height) => height,
        None => match metadata.get(&tip_key()) {
            Some(raw) => BlockNumber::decode(raw.as_slice())?,
            None => return Ok(None),
        },
    };
    let Some(raw) = metadata.get(&state_key(height)) else {
        return Ok(None);
    };
    Ok(Some((height, decode_state(height, raw)?)))
}
