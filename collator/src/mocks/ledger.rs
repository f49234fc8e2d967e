use crate::{
    reader::{Error, Reader},
    types::{BlockNumber, Message, Position, ShardId},
};
use bytes::Bytes;
use commonware_runtime::Clock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Default)]
struct State {
    // Blocks of payloads, indexed by block number
    chains: BTreeMap<ShardId, Vec<Vec<Bytes>>>,

    unavailable: BTreeSet<ShardId>,
    rewound: BTreeSet<ShardId>,
    delays: BTreeMap<ShardId, Duration>,
    fetches: BTreeMap<ShardId, usize>,
}

/// Deterministic payload of the message at `position` of `shard`.
pub fn payload(shard: ShardId, position: Position) -> Bytes {
    Bytes::from(format!("{}/{}/{}", shard, position.block, position.index))
}

/// Append-only neighbor chains shared by every clone.
///
/// Shards without a chain are unknown.
#[derive(Clone)]
pub struct Ledger<E: Clock> {
    context: E,
    state: Arc<Mutex<State>>,
}

impl<E: Clock> Ledger<E> {
    pub fn new(context: E) -> Self {
        Self {
            context,
            state: Arc::default(),
        }
    }

    /// Append a block with `txs` messages to `shard` (creating the chain if needed).
    pub fn append(&self, shard: ShardId, txs: usize) -> BlockNumber {
        let mut state = self.lock();
        let chain = state.chains.entry(shard).or_default();
        let block = chain.len() as BlockNumber;
        let payloads = (0..txs as u64)
            .map(|index| payload(shard, Position::new(block, index)))
            .collect();
        chain.push(payloads);
        block
    }

    /// Number of blocks appended to `shard`.
    pub fn blocks(&self, shard: ShardId) -> usize {
        self.lock().chains.get(&shard).map_or(0, Vec::len)
    }

    /// Forget `shard`, making it unknown to readers.
    pub fn remove(&self, shard: ShardId) {
        self.lock().chains.remove(&shard);
    }

    /// Every message `shard` has emitted.
    pub fn messages(&self, shard: ShardId) -> Vec<Message> {
        let state = self.lock();
        state
            .chains
            .get(&shard)
            .map(|chain| read(chain, shard, Position::GENESIS, usize::MAX))
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, shard: ShardId, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(shard);
        } else {
            state.unavailable.remove(&shard);
        }
    }

    /// Serve `shard` from genesis regardless of the requested cursor.
    pub fn set_rewound(&self, shard: ShardId, rewound: bool) {
        let mut state = self.lock();
        if rewound {
            state.rewound.insert(shard);
        } else {
            state.rewound.remove(&shard);
        }
    }

    /// Delay every response for `shard`.
    pub fn set_delay(&self, shard: ShardId, delay: Option<Duration>) {
        let mut state = self.lock();
        match delay {
            Some(delay) => state.delays.insert(shard, delay),
            None => state.delays.remove(&shard),
        };
    }

    /// Number of fetches served for `shard`.
    pub fn fetches(&self, shard: ShardId) -> usize {
        self.lock().fetches.get(&shard).copied().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read(chain: &[Vec<Bytes>], shard: ShardId, from: Position, max: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    for (block, payloads) in chain.iter().enumerate().skip(from.block as usize) {
        let block = block as BlockNumber;
        let start = if block == from.block {
            from.index as usize
        } else {
            0
        };
        for (index, payload) in payloads.iter().enumerate().skip(start) {
            if messages.len() >= max {
                return messages;
            }
            let position = Position::new(block, index as u64);
            messages.push(Message::new(shard, position, payload.clone()));
        }
    }
    messages
}

impl<E: Clock> Reader for Ledger<E> {
    async fn fetch(
        &self,
        shard: ShardId,
        from: Position,
        max: usize,
    ) -> Result<Vec<Message>, Error> {
        let (delay, result) = {
            let mut state = self.lock();
            *state.fetches.entry(shard).or_default() += 1;
            let delay = state.delays.get(&shard).copied();
            let result = if state.unavailable.contains(&shard) {
                Err(Error::Unavailable("offline".into()))
            } else if let Some(chain) = state.chains.get(&shard) {
                let from = if state.rewound.contains(&shard) {
                    Position::GENESIS
                } else {
                    from
                };
                Ok(read(chain, shard, from, max))
            } else {
                Err(Error::Unknown)
            };
            (delay, result)
        };
        if let Some(delay) = delay {
            self.context.sleep(delay).await;
        }
        result
    }
}
