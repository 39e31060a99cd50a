//! # ShardKV RESP Client
//!
//! Purpose: Provide a lightweight, synchronous Redis-compatible backend with
//! connection pooling, usable as one shard target of the router.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Real Pipelining**: Batches go out in one write, replies come back in order.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod pool;
mod resp;

pub use client::PooledClient;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use resp::RespValue;
