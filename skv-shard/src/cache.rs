//! # Connection Cache
//!
//! One live client per backend, created on first use and kept until the
//! owning `ShardedClient` is disposed.
//!
//! ## Design Principles
//! 1. **Arena Slots**: Clients live in a `Vec` indexed by `BackendId`.
//! 2. **Create Under Lock**: The slot mutex is held while a missing client is
//!    opened, so concurrent first use still yields a single client.
//! 3. **No Reconnect Policy**: A failed open is returned to the caller and
//!    nothing is cached; the next call simply tries again.

use std::sync::Arc;

use parking_lot::Mutex;
use skv_common::{BackendManager, ShardError, ShardResult};
use tracing::debug;

use crate::strategy::BackendId;

struct CacheState<C> {
    clients: Vec<Option<Arc<C>>>,
    disposed: bool,
}

/// Lazily populated `BackendId -> client` table.
pub struct ConnectionCache<M: BackendManager> {
    state: Mutex<CacheState<M::Client>>,
}

impl<M: BackendManager> ConnectionCache<M> {
    /// Creates an empty cache with one slot per backend.
    pub fn new(backend_count: usize) -> Self {
        let mut clients = Vec::with_capacity(backend_count);
        clients.resize_with(backend_count, || None);
        ConnectionCache {
            state: Mutex::new(CacheState {
                clients,
                disposed: false,
            }),
        }
    }

    /// Returns the cached client for `id`, opening it through `manager` on
    /// first use.
    ///
    /// # Errors
    /// `ClientDisposed` after `dispose_all`; `Backend` when the manager
    /// cannot open a client.
    pub fn get(&self, id: BackendId, manager: &M) -> ShardResult<Arc<M::Client>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(ShardError::ClientDisposed);
        }

        let slots = state.clients.len();
        let slot = state
            .clients
            .get_mut(id.index())
            .ok_or(ShardError::ShardOutOfRange {
                index: id.index(),
                groups: slots,
            })?;
        if let Some(client) = slot {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(manager.get_client()?);
        debug!(backend = %manager.describe(), %id, "cached new backend client");
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Number of clients currently cached.
    pub fn len(&self) -> usize {
        self.state.lock().clients.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true when no client is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once `dispose_all` has run.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Releases every cached client and refuses further lookups.
    ///
    /// Returns how many clients were released. A second call releases nothing.
    pub fn dispose_all(&self) -> usize {
        let released: Vec<Arc<M::Client>> = {
            let mut state = self.state.lock();
            if state.disposed {
                debug!("connection cache already disposed");
                return 0;
            }
            state.disposed = true;
            state.clients.iter_mut().filter_map(Option::take).collect()
        };
        let count = released.len();
        // Dropped outside the lock; pooled clients return their sockets here.
        drop(released);
        debug!(released = count, "disposed connection cache");
        count
    }
}
