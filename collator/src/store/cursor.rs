use super::{
    decode_halted, decode_state, encode_halted, halted_key, open, retired_key, state_key, tip_key,
    Batch, Config, Error, FIRST_PIPELINE_PREFIX, GENESIS_HEIGHT,
};
use crate::types::{BlockNumber, CollatorState, Position, ShardId};
use commonware_codec::{DecodeExt, Encode};
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::Metadata;
use commonware_utils::sequence::prefixed_u64::U64;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Durable [CollatorState] snapshots, one per committed local height.
///
/// The last committed snapshot is cached in memory. [Store::commit] takes `&mut self`, so
/// no [Store::load] can observe a commit in progress.
pub struct Store<E: Clock + Storage + Metrics> {
    metadata: Metadata<E, U64, Vec<u8>>,
    cfg: Config,

    height: BlockNumber,
    state: CollatorState,
    halted: BTreeSet<ShardId>,
}

impl<E: Clock + Storage + Metrics> Store<E> {
    /// Open the store, recovering the last committed snapshot.
    ///
    /// If the partition holds no snapshot, `genesis` is persisted at [GENESIS_HEIGHT].
    pub async fn init(context: E, cfg: Config, genesis: CollatorState) -> Result<Self, Error> {
        let mut metadata = open(context, &cfg.partition).await?;
        let tip = match metadata.get(&tip_key()) {
            Some(raw) => Some(BlockNumber::decode(raw.as_slice())?),
            None => None,
        };
        let (height, state) = match tip {
            Some(height) => {
                let raw = metadata
                    .get(&state_key(height))
                    .ok_or(Error::MissingSnapshot(height))?;
                let state = decode_state(height, raw)?;
                info!(height, neighbors = state.len(), "recovered collator state");
                (height, state)
            }
            None => {
                metadata.put(state_key(GENESIS_HEIGHT), genesis.encode().to_vec());
                metadata.put(tip_key(), GENESIS_HEIGHT.encode().to_vec());
                metadata.sync().await?;
                info!(neighbors = genesis.len(), "initialized genesis collator state");
                (GENESIS_HEIGHT, genesis)
            }
        };
        let halted = match metadata.get(&halted_key()) {
            Some(raw) => decode_halted(raw)?,
            None => BTreeSet::new(),
        };
        if !halted.is_empty() {
            info!(?halted, "recovered halted neighbors");
        }
        Ok(Self {
            metadata,
            cfg,
            height,
            state,
            halted,
        })
    }

    /// The last durably committed snapshot and the local height it belongs to.
    pub fn load(&self) -> (BlockNumber, CollatorState) {
        (self.height, self.state.clone())
    }

    /// Height of the last committed snapshot.
    pub fn height(&self) -> BlockNumber {
        self.height
    }

    /// The last committed snapshot.
    pub fn state(&self) -> &CollatorState {
        &self.state
    }

    /// Neighbors whose advancement was halted as of the last commit.
    pub fn halted(&self) -> &BTreeSet<ShardId> {
        &self.halted
    }

    /// Final cursor of `shard` when its removal was last committed.
    pub fn retired(&self, shard: ShardId) -> Result<Option<Position>, Error> {
        let Some(raw) = self.metadata.get(&retired_key(shard)) else {
            return Ok(None);
        };
        Ok(Some(Position::decode(raw.as_slice())?))
    }

    /// Read the snapshot committed at `height`, if it is still retained.
    pub fn load_at(&self, height: BlockNumber) -> Result<Option<CollatorState>, Error> {
        let Some(raw) = self.metadata.get(&state_key(height)) else {
            return Ok(None);
        };
        decode_state(height, raw).map(Some)
    }

    /// Read a record written by a committed [Batch].
    pub fn get(&self, prefix: u8, index: u64) -> Option<&[u8]> {
        self.metadata
            .get(&U64::new(prefix, index))
            .map(|value| value.as_slice())
    }

    /// Durably persist `state` as the snapshot for `height` together with `batch`.
    ///
    /// `height` must be exactly one above the last committed height. If the commit is
    /// rejected, nothing in `batch` is staged and the store still reflects the previous
    /// height. If the sync itself fails, the store must be reopened.
    pub async fn commit(
        &mut self,
        state: CollatorState,
        height: BlockNumber,
        batch: Batch,
    ) -> Result<(), Error> {
        let expected = self.height + 1;
        if height != expected {
            return Err(Error::HeightMismatch {
                expected,
                found: height,
            });
        }
        if let Some(&(prefix, _, _)) = batch
            .ops
            .iter()
            .find(|(prefix, _, _)| *prefix < FIRST_PIPELINE_PREFIX)
        {
            return Err(Error::ReservedPrefix(prefix));
        }

        // Stage block writes
        let ops = batch.ops.len();
        for (prefix, index, value) in batch.ops {
            let key = U64::new(prefix, index);
            match value {
                Some(value) => {
                    self.metadata.put(key, value);
                }
                None => {
                    self.metadata.remove(&key);
                }
            }
        }
        for neighbor in &batch.retired {
            self.metadata
                .put(retired_key(neighbor.shard), neighbor.position.encode().to_vec());
        }
        if let Some(halted) = &batch.halted {
            if halted.is_empty() {
                self.metadata.remove(&halted_key());
            } else {
                self.metadata.put(halted_key(), encode_halted(halted));
            }
        }

        // Stage the snapshot
        self.metadata.put(state_key(height), state.encode().to_vec());
        self.metadata.put(tip_key(), height.encode().to_vec());
        if let Some(retention) = self.cfg.retention {
            if let Some(stale) = height.checked_sub(retention.get()) {
                self.metadata.remove(&state_key(stale));
                for &prefix in &self.cfg.pipeline_prefixes {
                    self.metadata.remove(&U64::new(prefix, stale));
                }
            }
        }
        self.metadata.sync().await?;

        debug!(
            height,
            ops,
            retired = batch.retired.len(),
            neighbors = state.len(),
            "committed collator state"
        );
        self.height = height;
        self.state = state;
        if let Some(halted) = batch.halted {
            self.halted = halted;
        }
        Ok(())
    }

    /// Sync and close the underlying storage.
    pub async fn close(self) -> Result<(), Error> {
        self.metadata.close().await?;
        Ok(())
    }
}
