//! # ShardKV Memory Engine
//!
//! Purpose: Provide an in-process backend that speaks the same command set
//! as a remote store, for local development, tests and benchmarks.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Implements `BackendManager` so the router cannot
//!    tell it apart from a networked backend.
//! 2. **Sharded Locks**: Lock striping keeps concurrent callers apart.

mod backend;
mod memory;

pub use backend::{BackendStats, MemoryBackend, MemoryClient};
pub use memory::MemoryEngine;
