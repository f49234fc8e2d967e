//! Local block production.

use bytes::BufMut;
use futures::channel::oneshot;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};
use xshard_collator::{
    engine::{Included, Pipeline, Proposal},
    store::{Batch, FIRST_PIPELINE_PREFIX},
    types::{BlockNumber, CollatorState, ShardId},
};

/// Key prefix of block records, indexed by height.
pub const BLOCK_PREFIX: u8 = FIRST_PIPELINE_PREFIX;

/// Builds a block record for every proposal, occasionally aborting.
///
/// The record stores the number of applied messages followed by the digest of the
/// [CollatorState] the block commits to.
pub struct Builder {
    shard: ShardId,
    abort_probability: f64,
    rng: StdRng,
}

impl Builder {
    pub fn new(shard: ShardId, abort_probability: f64, seed: u64) -> Self {
        Self {
            shard,
            abort_probability,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Pipeline for Builder {
    async fn propose(
        &mut self,
        height: BlockNumber,
        state: CollatorState,
        messages: Vec<Included>,
    ) -> oneshot::Receiver<Proposal> {
        let (sender, receiver) = oneshot::channel();
        let proposal = if self.rng.gen_bool(self.abort_probability) {
            Proposal::Aborted("simulated abort".into())
        } else {
            for item in &messages {
                debug!(
                    shard = self.shard,
                    height,
                    from = item.shard,
                    position = %item.message.position,
                    "applying message"
                );
            }
            let mut record = Vec::with_capacity(4 + 32);
            record.put_u32(messages.len() as u32);
            record.put_slice(&state.digest());
            let mut batch = Batch::new();
            batch.put(BLOCK_PREFIX, height, record);
            info!(shard = self.shard, height, messages = messages.len(), "built block");
            Proposal::Committed { height, batch }
        };
        let _ = sender.send(proposal);
        receiver
    }
}
