//! Fetch cross-shard messages from a neighbor's ledger.
//!
//! A [Reader] is the only way the collator observes a neighbor. The engine never trusts a
//! response blindly: [fetch] bounds every call with a timeout, checks the response against
//! the [Reader] contract, and folds the result into a tagged [Fetch] outcome so that a
//! misbehaving neighbor can never move a cursor.
//!
//! Most violations are treated like an outage and retried next cycle. A response that
//! reaches below the cursor means the neighbor's log was rewritten, and a message at the
//! last representable [Position] leaves no cursor to advance to. Both are [Fetch::Fatal].

use crate::types::{Message, Neighbor, Position, ShardId};
use commonware_macros::select;
use commonware_runtime::Clock;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Errors a [Reader] may return.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Transient failure (retry next cycle).
    #[error("neighbor unavailable: {0}")]
    Unavailable(String),
    /// The shard does not exist or cannot be reached at all.
    #[error("neighbor unknown")]
    Unknown,
}

/// Ways a response can break the [Reader] contract.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("message from shard {found}, expected {expected}")]
    WrongShard { expected: ShardId, found: ShardId },
    #[error("message at {found} is before cursor {cursor}")]
    BeforeCursor { cursor: Position, found: Position },
    #[error("message at {next} does not follow {previous}")]
    Unordered { previous: Position, next: Position },
    #[error("returned {found} messages, limit is {max}")]
    TooMany { max: usize, found: usize },
    #[error("message at {position} has no successor")]
    Exhausted { position: Position },
}

impl Violation {
    /// Whether retrying the fetch can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BeforeCursor { .. } | Self::Exhausted { .. })
    }
}

/// Read access to the append-only transaction logs of neighbor shards.
pub trait Reader: Clone + Send + Sync + 'static {
    /// Fetch up to `max` messages emitted by `shard` at or after `from`.
    ///
    /// Messages must be returned in strictly ascending [Position] order without gaps in
    /// what the neighbor emitted. Fetching from the same cursor twice returns the same
    /// messages (the neighbor log is append-only).
    fn fetch(
        &self,
        shard: ShardId,
        from: Position,
        max: usize,
    ) -> impl Future<Output = Result<Vec<Message>, Error>> + Send;
}

/// Outcome of fetching from one neighbor during a cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetch {
    Fetched(Vec<Message>),
    Unavailable(String),
    Unknown,
    /// The neighbor can no longer be advanced.
    Fatal(Violation),
}

/// Check that `messages` is a valid response to a fetch at `cursor` limited to `max`.
pub fn validate(cursor: Neighbor, max: usize, messages: &[Message]) -> Result<(), Violation> {
    if messages.len() > max {
        return Err(Violation::TooMany {
            max,
            found: messages.len(),
        });
    }
    let mut previous: Option<Position> = None;
    for message in messages {
        if message.shard != cursor.shard {
            return Err(Violation::WrongShard {
                expected: cursor.shard,
                found: message.shard,
            });
        }
        match previous {
            None if message.position < cursor.position => {
                return Err(Violation::BeforeCursor {
                    cursor: cursor.position,
                    found: message.position,
                });
            }
            Some(previous) if message.position <= previous => {
                return Err(Violation::Unordered {
                    previous,
                    next: message.position,
                });
            }
            _ => {}
        }
        if message.position.next().is_none() {
            return Err(Violation::Exhausted {
                position: message.position,
            });
        }
        previous = Some(message.position);
    }
    Ok(())
}

/// Fetch from `cursor` with a deadline, classifying the result.
///
/// Timeouts and recoverable contract violations are reported as [Fetch::Unavailable].
pub async fn fetch<E: Clock, R: Reader>(
    context: &E,
    reader: &R,
    cursor: Neighbor,
    max: usize,
    timeout: Duration,
) -> Fetch {
    let result = select! {
        result = reader.fetch(cursor.shard, cursor.position, max) => {
            result
        },
        _ = context.sleep(timeout) => {
            return Fetch::Unavailable(format!("timed out after {timeout:?}"));
        },
    };
    match result {
        Ok(messages) => match validate(cursor, max, &messages) {
            Ok(()) => Fetch::Fetched(messages),
            Err(violation) => {
                warn!(
                    shard = cursor.shard,
                    position = %cursor.position,
                    %violation,
                    "rejected reader response"
                );
                if violation.is_fatal() {
                    Fetch::Fatal(violation)
                } else {
                    Fetch::Unavailable(violation.to_string())
                }
            }
        },
        Err(Error::Unavailable(reason)) => Fetch::Unavailable(reason),
        Err(Error::Unknown) => Fetch::Unknown,
    }
}
