//! Backend double that records every command and can fail on demand.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use skv_common::{BackendClient, BackendError, BackendManager, BackendResult, Command, Reply};
use skv_engine::{MemoryBackend, MemoryClient};
use skv_shard::{ClientOptions, ShardMap, ShardedClient};

/// Commands seen by every backend of a fixture, in execution order.
pub type Journal = Arc<Mutex<Vec<(String, Command)>>>;

pub struct Recording {
    name: String,
    backend: MemoryBackend,
    journal: Journal,
    failing: Arc<AtomicBool>,
    refuse_clients: AtomicBool,
    opened: AtomicUsize,
    open_delay: Duration,
}

impl Recording {
    pub fn new(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Recording {
            name: name.to_string(),
            backend: MemoryBackend::new(name),
            journal: Arc::clone(journal),
            failing: Arc::new(AtomicBool::new(false)),
            refuse_clients: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            open_delay: Duration::from_millis(5),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes every command (and every batch) on this backend fail with IO.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes `get_client` fail with `PoolExhausted`.
    pub fn refuse_clients(&self, refuse: bool) {
        self.refuse_clients.store(refuse, Ordering::SeqCst);
    }

    /// Number of clients handed out.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.backend.engine().len()
    }
}

impl BackendManager for Recording {
    type Client = RecordingClient;

    fn get_client(&self) -> BackendResult<RecordingClient> {
        if self.refuse_clients.load(Ordering::SeqCst) {
            return Err(BackendError::PoolExhausted);
        }
        // Widens the window for concurrent first use.
        thread::sleep(self.open_delay);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingClient {
            name: self.name.clone(),
            inner: self.backend.get_client()?,
            journal: Arc::clone(&self.journal),
            failing: Arc::clone(&self.failing),
        })
    }

    fn describe(&self) -> String {
        format!("recording://{}", self.name)
    }
}

pub struct RecordingClient {
    name: String,
    inner: MemoryClient,
    journal: Journal,
    failing: Arc<AtomicBool>,
}

fn injected() -> BackendError {
    io::Error::new(io::ErrorKind::ConnectionReset, "injected failure").into()
}

impl BackendClient for RecordingClient {
    fn execute(&self, command: &Command) -> BackendResult<Reply> {
        self.journal.lock().push((self.name.clone(), command.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.execute(command)
    }

    fn execute_batch(&self, commands: &[Command]) -> BackendResult<Vec<BackendResult<Reply>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(commands.iter().map(|command| self.execute(command)).collect())
    }
}

pub struct Cluster {
    pub client: ShardedClient<Recording>,
    pub groups: Vec<Vec<Arc<Recording>>>,
    pub journal: Journal,
}

impl Cluster {
    pub fn new(layout: &[&[&str]]) -> Self {
        Self::with_options(layout, ClientOptions::default())
    }

    pub fn with_options(layout: &[&[&str]], options: ClientOptions) -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let groups: Vec<Vec<Arc<Recording>>> = layout
            .iter()
            .map(|names| names.iter().map(|name| Recording::new(name, &journal)).collect())
            .collect();
        let map = ShardMap::new(groups.clone()).expect("shard map");
        Cluster {
            client: ShardedClient::with_options(map, options),
            groups,
            journal,
        }
    }

    pub fn backend(&self, name: &str) -> &Arc<Recording> {
        self.groups
            .iter()
            .flatten()
            .find(|backend| backend.name() == name)
            .expect("unknown backend")
    }

    /// Backend names in execution order.
    pub fn touched(&self) -> Vec<String> {
        self.journal.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn commands_on(&self, name: &str) -> Vec<Command> {
        self.journal
            .lock()
            .iter()
            .filter(|(backend, _)| backend == name)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }
}
