//! Consume cross-shard messages exactly once with durable per-neighbor cursors.
//!
//! A collator assembling blocks for one shard must also apply the messages other shards
//! ("neighbors") emit for it, each exactly once and in the order it was emitted. This crate
//! tracks a read cursor per neighbor and advances those cursors only in the same atomic
//! write that commits the local block applying the messages.
//!
//! # Overview
//!
//! * [types]: identifiers, [types::Position], and the canonical [types::CollatorState].
//! * [table]: in-memory cursor table that rejects regressions and enforces capacity.
//! * [store]: versioned snapshots in [commonware_storage::metadata], committed atomically
//!   with each local block.
//! * [reader]: the neighbor ledger interface and response validation.
//! * [topology]: reconciles tracked neighbors with the membership service.
//! * [engine]: the per-block cycle tying everything together.
//!
//! # Status
//!
//! `xshard-collator` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod engine;
pub mod reader;
pub mod store;
pub mod table;
pub mod topology;
pub mod types;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
