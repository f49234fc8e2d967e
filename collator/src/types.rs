//! Identifiers, cursor positions, and the [CollatorState] snapshot.
//!
//! # Format
//!
//! A [CollatorState] is persisted as a varint count followed by fixed-width [Neighbor]
//! records, sorted by ascending [ShardId]:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | Count | ShardId (u32) |     BlockNumber (u64)         |   TransactionIndex (u64)      |...
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! All fixed-width integers are big-endian. The sort order makes the encoding (and therefore
//! [CollatorState::digest]) canonical.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Identifies a shard in the topology.
pub type ShardId = u32;

/// Height of a block within one shard's chain.
pub type BlockNumber = u64;

/// Zero-based position of a transaction within a block.
pub type TransactionIndex = u64;

/// Maximum number of neighbors a [CollatorState] may track.
pub const MAX_NEIGHBORS: usize = 10_000;

/// Errors that can occur when building a [CollatorState].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("too many neighbors: {0} > {MAX_NEIGHBORS}")]
    TooManyNeighbors(usize),
    #[error("duplicate shard: {0}")]
    DuplicateShard(ShardId),
}

/// A read position inside a neighbor's log.
///
/// Positions are ordered lexicographically by `(block, index)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "blockNumber")]
    pub block: BlockNumber,
    #[serde(rename = "transactionIndex")]
    pub index: TransactionIndex,
}

impl Position {
    /// The first position of every shard.
    pub const GENESIS: Self = Self { block: 0, index: 0 };

    pub const fn new(block: BlockNumber, index: TransactionIndex) -> Self {
        Self { block, index }
    }

    /// The position immediately after this one.
    ///
    /// Readers return messages at or after a cursor, so a cursor that points past the end
    /// of a block simply continues at the next block. The last index of a block is therefore
    /// followed by the start of the next block. Returns `None` only for the last
    /// representable position.
    pub fn next(&self) -> Option<Self> {
        match self.index.checked_add(1) {
            Some(index) => Some(Self::new(self.block, index)),
            None => self.block.checked_add(1).map(|block| Self::new(block, 0)),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block, self.index)
    }
}

/// The next cross-shard message to read from `shard` is at `position`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Neighbor {
    #[serde(rename = "shardId")]
    pub shard: ShardId,
    #[serde(flatten)]
    pub position: Position,
}

impl Neighbor {
    pub const fn new(shard: ShardId, position: Position) -> Self {
        Self { shard, position }
    }

    /// A neighbor that has not consumed anything yet.
    pub const fn genesis(shard: ShardId) -> Self {
        Self::new(shard, Position::GENESIS)
    }
}

impl Write for Position {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.index.write(buf);
    }
}

impl Read for Position {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let block = BlockNumber::read(buf)?;
        let index = TransactionIndex::read(buf)?;
        Ok(Self::new(block, index))
    }
}

impl FixedSize for Position {
    const SIZE: usize = BlockNumber::SIZE + TransactionIndex::SIZE;
}

impl Write for Neighbor {
    fn write(&self, buf: &mut impl BufMut) {
        self.shard.write(buf);
        self.position.write(buf);
    }
}

impl Read for Neighbor {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let shard = ShardId::read(buf)?;
        let position = Position::read(buf)?;
        Ok(Self::new(shard, position))
    }
}

impl FixedSize for Neighbor {
    const SIZE: usize = ShardId::SIZE + Position::SIZE;
}

/// A cross-shard message tagged with where it sits in the emitting shard's log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub shard: ShardId,
    pub position: Position,
    pub payload: Bytes,
}

impl Message {
    pub fn new(shard: ShardId, position: Position, payload: Bytes) -> Self {
        Self {
            shard,
            position,
            payload,
        }
    }
}

/// Snapshot of every tracked neighbor cursor.
///
/// Neighbors are always sorted by ascending [ShardId] and each [ShardId] appears at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Unchecked")]
pub struct CollatorState {
    neighbors: Vec<Neighbor>,
}

#[derive(Deserialize)]
struct Unchecked {
    neighbors: Vec<Neighbor>,
}

impl TryFrom<Unchecked> for CollatorState {
    type Error = Error;

    fn try_from(value: Unchecked) -> Result<Self, Self::Error> {
        Self::new(value.neighbors)
    }
}

impl CollatorState {
    /// Build a snapshot from neighbors in any order.
    pub fn new(mut neighbors: Vec<Neighbor>) -> Result<Self, Error> {
        if neighbors.len() > MAX_NEIGHBORS {
            return Err(Error::TooManyNeighbors(neighbors.len()));
        }
        neighbors.sort_by_key(|n| n.shard);
        for pair in neighbors.windows(2) {
            if pair[0].shard == pair[1].shard {
                return Err(Error::DuplicateShard(pair[0].shard));
            }
        }
        Ok(Self { neighbors })
    }

    /// Wrap neighbors that are already sorted, unique, and within capacity.
    pub(crate) fn from_sorted(neighbors: Vec<Neighbor>) -> Self {
        debug_assert!(neighbors.len() <= MAX_NEIGHBORS);
        debug_assert!(neighbors.windows(2).all(|w| w[0].shard < w[1].shard));
        Self { neighbors }
    }

    /// The state at shard genesis: every initial neighbor at [Position::GENESIS].
    pub fn genesis(shards: impl IntoIterator<Item = ShardId>) -> Result<Self, Error> {
        Self::new(shards.into_iter().map(Neighbor::genesis).collect())
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn get(&self, shard: ShardId) -> Option<&Neighbor> {
        self.neighbors
            .binary_search_by_key(&shard, |n| n.shard)
            .ok()
            .map(|i| &self.neighbors[i])
    }

    /// SHA-256 of the canonical encoding.
    pub fn digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(self.encode_size());
        self.write(&mut buf);
        Sha256::digest(&buf).into()
    }
}

impl Write for CollatorState {
    fn write(&self, buf: &mut impl BufMut) {
        self.neighbors.write(buf);
    }
}

impl EncodeSize for CollatorState {
    fn encode_size(&self) -> usize {
        self.neighbors.encode_size()
    }
}

impl Read for CollatorState {
    type Cfg = ();

    /// Decode a snapshot, rejecting anything that is not canonical.
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let neighbors = Vec::<Neighbor>::read_cfg(buf, &((0..=MAX_NEIGHBORS).into(), ()))?;
        if neighbors.windows(2).any(|pair| pair[0].shard >= pair[1].shard) {
            return Err(CodecError::Invalid(
                "CollatorState",
                "neighbors not strictly ascending",
            ));
        }
        Ok(Self { neighbors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use commonware_codec::{Decode, Encode};

    fn sample() -> CollatorState {
        CollatorState::new(vec![
            Neighbor::new(7, Position::new(5, 2)),
            Neighbor::new(3, Position::new(1, 0)),
            Neighbor::genesis(9),
        ])
        .unwrap()
    }

    fn decode(buf: impl Buf) -> Result<CollatorState, CodecError> {
        CollatorState::decode_cfg(buf, &())
    }

    #[test]
    fn test_position_order() {
        assert!(Position::new(5, 9) < Position::new(6, 0));
        assert!(Position::new(6, 0) < Position::new(6, 1));
        assert_eq!(Position::new(6, 0).next(), Some(Position::new(6, 1)));
        assert_eq!(Position::GENESIS, Position::default());
    }

    #[test]
    fn test_next_at_end_of_index_space() {
        // The last index of a block continues at the next block
        let last = Position::new(4, u64::MAX);
        assert_eq!(last.next(), Some(Position::new(5, 0)));
        assert!(last < Position::new(5, 0));

        assert_eq!(Position::new(u64::MAX, u64::MAX).next(), None);
    }

    #[test]
    fn test_new_sorts_and_rejects_duplicates() {
        let state = sample();
        let shards: Vec<_> = state.neighbors().iter().map(|n| n.shard).collect();
        assert_eq!(shards, vec![3, 7, 9]);
        assert_eq!(state.get(7).unwrap().position, Position::new(5, 2));
        assert!(state.get(8).is_none());

        let err = CollatorState::new(vec![Neighbor::genesis(1), Neighbor::genesis(1)]);
        assert_eq!(err, Err(Error::DuplicateShard(1)));
    }

    #[test]
    fn test_encoding_layout() {
        let state = sample();
        let encoded = state.encode();
        assert_eq!(encoded.len(), 1 + 3 * Neighbor::SIZE);
        assert_eq!(Neighbor::SIZE, 20);
        assert_eq!(encoded[0], 3);
        assert_eq!(&encoded[1..5], &3u32.to_be_bytes());
        assert_eq!(&encoded[5..13], &1u64.to_be_bytes());
        assert_eq!(decode(encoded.freeze()).unwrap(), state);
    }

    #[test]
    fn test_decode_rejects_non_canonical() {
        // Out of order
        let mut buf = BytesMut::new();
        vec![Neighbor::genesis(5), Neighbor::genesis(4)].write(&mut buf);
        assert!(matches!(decode(buf.freeze()), Err(CodecError::Invalid(_, _))));

        // Duplicate
        let mut buf = BytesMut::new();
        vec![Neighbor::genesis(5), Neighbor::genesis(5)].write(&mut buf);
        assert!(matches!(decode(buf.freeze()), Err(CodecError::Invalid(_, _))));

        // Too many
        let neighbors: Vec<_> = (0..=MAX_NEIGHBORS as ShardId).map(Neighbor::genesis).collect();
        let mut buf = BytesMut::new();
        neighbors.write(&mut buf);
        assert!(decode(buf.freeze()).is_err());

        // Truncated
        let encoded = sample().encode().freeze();
        assert!(matches!(
            decode(encoded.slice(..encoded.len() - 1)),
            Err(CodecError::EndOfBuffer)
        ));

        // Trailing bytes
        let mut buf = sample().encode();
        buf.extend_from_slice(&[0]);
        assert!(matches!(
            decode(buf.freeze()),
            Err(CodecError::ExtraData(1))
        ));
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = sample();
        let b = CollatorState::new(a.neighbors().iter().rev().copied().collect()).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest(), <[u8; 32]>::from(Sha256::digest(a.encode())));

        let c = CollatorState::new(vec![
            Neighbor::new(7, Position::new(5, 3)),
            Neighbor::new(3, Position::new(1, 0)),
            Neighbor::genesis(9),
        ])
        .unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_json_field_names() {
        let state = CollatorState::new(vec![Neighbor::new(1, Position::new(5, 2))]).unwrap();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "neighbors": [{"shardId": 1, "blockNumber": 5, "transactionIndex": 2}]
            })
        );

        let duplicate = serde_json::json!({
            "neighbors": [{"shardId": 1, "blockNumber": 0, "transactionIndex": 0},
                          {"shardId": 1, "blockNumber": 0, "transactionIndex": 0}]
        });
        assert!(serde_json::from_value::<CollatorState>(duplicate).is_err());
    }
}
