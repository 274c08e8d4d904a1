//! shard-merge library crate.
//!
//! The primary interface is the `shard-merge` binary. The orchestrators are
//! generic over [`index::ShardIndex`] so integration tests can drive them
//! with a fake collaborator as well as the on-disk [`index::FileIndex`].

pub mod cli;
pub mod config;
pub mod explode;
pub mod failpoints;
pub mod index;
pub mod merge;
pub mod merge_state;
pub mod recover;
pub mod resolve;
pub mod telemetry;
