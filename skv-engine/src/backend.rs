//! # Memory Backend
//!
//! Expose a `MemoryEngine` through the backend contract so the shard router
//! can use it exactly like a remote store.
//!
//! ## Notes
//! - Every client handed out by one `MemoryBackend` shares its engine, so
//!   data written through one client is visible through the others.
//! - Counters use `Ordering::Relaxed`; they are diagnostics, not
//!   synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use skv_common::{BackendClient, BackendManager, BackendResult, Command, Reply};

use crate::memory::MemoryEngine;

/// Point-in-time counters for one memory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    /// Number of `get_client` calls served.
    pub clients_opened: u64,
    /// Number of commands executed across all clients.
    pub commands_total: u64,
    /// Number of `execute_batch` calls across all clients.
    pub batches_total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    clients_opened: AtomicU64,
    commands_total: AtomicU64,
    batches_total: AtomicU64,
}

/// Backend manager over an in-process engine.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    engine: Arc<MemoryEngine>,
    counters: Arc<Counters>,
}

impl MemoryBackend {
    /// Creates a backend with its own engine.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_engine(name, Arc::new(MemoryEngine::new()))
    }

    /// Creates a backend over an existing engine.
    pub fn with_engine(name: impl Into<String>, engine: Arc<MemoryEngine>) -> Self {
        MemoryBackend {
            name: name.into(),
            engine,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the engine holding this backend's data.
    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Returns a snapshot of the backend counters.
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            clients_opened: self.counters.clients_opened.load(Ordering::Relaxed),
            commands_total: self.counters.commands_total.load(Ordering::Relaxed),
            batches_total: self.counters.batches_total.load(Ordering::Relaxed),
        }
    }
}

impl BackendManager for MemoryBackend {
    type Client = MemoryClient;

    fn get_client(&self) -> BackendResult<MemoryClient> {
        self.counters.clients_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryClient {
            engine: Arc::clone(&self.engine),
            counters: Arc::clone(&self.counters),
        })
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

/// Client bound to a memory backend.
#[derive(Debug)]
pub struct MemoryClient {
    engine: Arc<MemoryEngine>,
    counters: Arc<Counters>,
}

impl BackendClient for MemoryClient {
    fn execute(&self, command: &Command) -> BackendResult<Reply> {
        self.counters.commands_total.fetch_add(1, Ordering::Relaxed);
        self.engine.apply(command)
    }

    fn execute_batch(&self, commands: &[Command]) -> BackendResult<Vec<BackendResult<Reply>>> {
        self.counters.batches_total.fetch_add(1, Ordering::Relaxed);
        Ok(commands.iter().map(|command| self.execute(command)).collect())
    }
}
