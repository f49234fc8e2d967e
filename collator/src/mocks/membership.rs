use crate::{topology::Membership as M, types::ShardId};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Membership set that can be changed from outside the engine.
#[derive(Clone, Default)]
pub struct Membership {
    shards: Arc<Mutex<BTreeSet<ShardId>>>,
}

impl Membership {
    pub fn new(shards: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            shards: Arc::new(Mutex::new(shards.into_iter().collect())),
        }
    }

    pub fn add(&self, shard: ShardId) {
        self.lock().insert(shard);
    }

    pub fn remove(&self, shard: ShardId) {
        self.lock().remove(&shard);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<ShardId>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl M for Membership {
    async fn current(&self) -> BTreeSet<ShardId> {
        self.lock().clone()
    }
}
