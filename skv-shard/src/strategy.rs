//! # Shard Map
//!
//! Static table of shard groups. Each group is an ordered list of mirror
//! backends; writes go to every mirror, reads go to the first one.
//!
//! ## Design Principles
//! 1. **Static Placement**: `index = shard_hash(key) % groups`, fixed for the
//!    life of the map. Changing the group count remaps most keys and is an
//!    operator-driven migration, never something this type does on its own.
//! 2. **Arena Identity**: Each distinct manager (`Arc` identity) gets a dense
//!    `BackendId`, which the connection and pipeline caches index by.
//! 3. **Deterministic Reads**: The read target is always the first mirror.
//!
//! ```text
//! ShardMap
//!   ├── backends: [m0, m1, m2]          BackendId = position
//!   └── groups:   [[0, 1], [2]]         group index = hash % 2
//! ```

use std::sync::Arc;

use skv_common::{shard_hash, ShardError, ShardResult};

/// Dense handle for one distinct backend in a `ShardMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(usize);

impl BackendId {
    pub(crate) fn new(index: usize) -> Self {
        BackendId(index)
    }

    /// Position of the backend in its map's arena.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}

/// Immutable key-to-shard-group table.
#[derive(Debug)]
pub struct ShardMap<M> {
    backends: Vec<Arc<M>>,
    groups: Vec<Vec<BackendId>>,
}

impl<M> ShardMap<M> {
    /// Builds a map from ordered groups of mirror managers.
    ///
    /// The same `Arc` listed in several places is treated as one backend.
    ///
    /// # Errors
    /// `EmptyShardMap` when `groups` is empty, `EmptyGroup(i)` when group `i`
    /// lists no backends.
    pub fn new(groups: Vec<Vec<Arc<M>>>) -> ShardResult<Self> {
        if groups.is_empty() {
            return Err(ShardError::EmptyShardMap);
        }

        let mut backends: Vec<Arc<M>> = Vec::new();
        let mut table = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                return Err(ShardError::EmptyGroup(index));
            }
            let mut ids = Vec::with_capacity(group.len());
            for manager in group {
                let id = match backends.iter().position(|known| Arc::ptr_eq(known, &manager)) {
                    Some(position) => BackendId(position),
                    None => {
                        backends.push(manager);
                        BackendId(backends.len() - 1)
                    }
                };
                ids.push(id);
            }
            table.push(ids);
        }

        Ok(ShardMap {
            backends,
            groups: table,
        })
    }

    /// Number of shard groups (N).
    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of distinct backends across all groups.
    #[inline]
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Group index owning `key`: `shard_hash(key) % N`.
    #[inline]
    pub fn shard_index(&self, key: &str) -> usize {
        shard_hash(key) as usize % self.groups.len()
    }

    /// Mirrors that must all receive writes for `key`, in group order.
    pub fn write_group_for(&self, key: &str) -> ShardResult<&[BackendId]> {
        let index = self.shard_index(key);
        self.group(index)
            .ok_or(ShardError::ShardOutOfRange {
                index,
                groups: self.groups.len(),
            })
    }

    /// Backend serving reads for `key`: the first mirror of its group.
    pub fn read_target_for(&self, key: &str) -> ShardResult<BackendId> {
        let index = self.shard_index(key);
        self.write_group_for(key)?
            .first()
            .copied()
            .ok_or(ShardError::EmptyGroup(index))
    }

    /// Mirrors of group `index`.
    pub fn group(&self, index: usize) -> Option<&[BackendId]> {
        self.groups.get(index).map(Vec::as_slice)
    }

    /// Manager behind `id`, or `None` for an id minted by another map.
    pub fn manager(&self, id: BackendId) -> Option<&Arc<M>> {
        self.backends.get(id.0)
    }

    /// Iterates every distinct backend with its id.
    pub fn backends(&self) -> impl Iterator<Item = (BackendId, &Arc<M>)> {
        self.backends
            .iter()
            .enumerate()
            .map(|(index, manager)| (BackendId(index), manager))
    }
}
