use crate::{
    engine::{Included, Pipeline as P, Proposal},
    store::{Batch, Store, FIRST_PIPELINE_PREFIX},
    types::{BlockNumber, CollatorState, Message, Position},
};
use bytes::{Buf, BufMut, Bytes};
use commonware_runtime::{Clock, Metrics, Storage};
use futures::channel::oneshot;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Prefix under which a committed block stores its messages, indexed by height.
pub const BLOCK_PREFIX: u8 = FIRST_PIPELINE_PREFIX;

/// A block handed to the [Pipeline].
#[derive(Clone, Debug)]
pub struct Proposed {
    pub height: BlockNumber,
    pub state: CollatorState,
    pub messages: Vec<Included>,
}

#[derive(Default)]
struct State {
    proposals: Vec<Proposed>,
    abort: usize,
    drop: usize,
}

/// Pipeline that records every proposal and writes the included messages as the block.
///
/// A committed block stores its messages under [BLOCK_PREFIX], so what was durably applied
/// can be read back with [applied].
#[derive(Clone, Default)]
pub struct Pipeline {
    state: Arc<Mutex<State>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the next `n` proposals.
    pub fn abort_next(&self, n: usize) {
        self.lock().abort = n;
    }

    /// Drop the response channel of the next `n` proposals.
    pub fn drop_next(&self, n: usize) {
        self.lock().drop = n;
    }

    /// Every proposal received (including aborted ones).
    pub fn proposals(&self) -> Vec<Proposed> {
        self.lock().proposals.clone()
    }

    pub fn last(&self) -> Option<Proposed> {
        self.lock().proposals.last().cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl P for Pipeline {
    async fn propose(
        &mut self,
        height: BlockNumber,
        state: CollatorState,
        messages: Vec<Included>,
    ) -> oneshot::Receiver<Proposal> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.lock();
        trace!(height, messages = messages.len(), "propose");
        let block = encode(&messages);
        inner.proposals.push(Proposed {
            height,
            state,
            messages,
        });
        if inner.drop > 0 {
            inner.drop -= 1;
            return receiver;
        }
        let proposal = if inner.abort > 0 {
            inner.abort -= 1;
            Proposal::Aborted("injected abort".into())
        } else {
            let mut batch = Batch::new();
            batch.put(BLOCK_PREFIX, height, block);
            Proposal::Committed { height, batch }
        };
        let _ = sender.send(proposal);
        receiver
    }
}

fn encode(messages: &[Included]) -> Vec<u8> {
    let mut buf = Vec::new();
    for item in messages {
        let message = &item.message;
        buf.put_u32(message.shard);
        buf.put_u64(message.position.block);
        buf.put_u64(message.position.index);
        buf.put_u32(message.payload.len() as u32);
        buf.put_slice(&message.payload);
    }
    buf
}

fn decode(mut buf: Bytes) -> Vec<Message> {
    let mut messages = Vec::new();
    while buf.remaining() >= 24 {
        let shard = buf.get_u32();
        let block = buf.get_u64();
        let index = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            break;
        }
        let payload = buf.split_to(len);
        messages.push(Message::new(shard, Position::new(block, index), payload));
    }
    messages
}

/// Every message durably applied by blocks `1..=tip` still in `store`, in application order.
pub fn applied<E: Clock + Storage + Metrics>(store: &Store<E>, tip: BlockNumber) -> Vec<Message> {
    let mut messages = Vec::new();
    for height in 1..=tip {
        if let Some(block) = store.get(BLOCK_PREFIX, height) {
            messages.extend(decode(Bytes::copy_from_slice(block)));
        }
    }
    messages
}
