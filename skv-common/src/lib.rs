// skv-common - Shared backend contract, errors and hashing for ShardKV
//
// Every backend (RESP pool, in-memory engine, test doubles) speaks the
// command set defined here, and the shard router depends only on it.

pub mod backend;
pub mod error;
pub mod hash;

// Re-export for convenience
pub use backend::*;
pub use error::*;
pub use hash::*;
