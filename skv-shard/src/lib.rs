//! # ShardKV Router
//!
//! Purpose: Route key-value operations across static groups of mirrored
//! backends so application code sees one logical client.
//!
//! ## Design Principles
//! 1. **Static Shard Table**: A key's group is `murmur3(key) % groups` and
//!    never changes while the map lives.
//! 2. **Write All, Read One**: Writes fan out to every mirror of a group;
//!    reads use the first mirror.
//! 3. **Lazy Shared Connections**: One client per backend, opened on first
//!    use and shared by the facade and every pipeline.
//! 4. **Backend Agnostic**: Anything implementing `BackendManager` can sit
//!    behind the router (RESP pools, the in-memory engine, test doubles).

mod cache;
mod client;
mod codec;
mod config;
mod list;
mod pipeline;
mod strategy;

pub use cache::ConnectionCache;
pub use client::{ClientOptions, ShardedClient, WriteOutcome};
pub use codec::{decode, encode};
pub use config::{connect_sharded, ConfigError, PoolSettings, ShardConfig};
pub use list::ShardedList;
pub use pipeline::ShardedPipeline;
pub use strategy::{BackendId, ShardMap};
