//! # Sharded Client
//!
//! Purpose: Present several independent backends as one logical key-value
//! client. Every operation is routed by key through the `ShardMap`.
//!
//! ## Design Principles
//! 1. **Fan-out Writes**: A write runs against every mirror of the key's
//!    group and reports one result per mirror, in group order.
//! 2. **Single-Target Reads**: A read runs once against the first mirror.
//!    There is no fallback when that mirror fails.
//! 3. **One Connection per Backend**: Clients come from the shared
//!    `ConnectionCache`, so facade calls and pipelines reuse them.
//! 4. **No Retries**: Backend failures surface to the caller unchanged.
//!
//! ## Aggregation
//!
//! ```text
//! set("k") on group [m0, m1]
//!   m0 -> Ok(true)
//!   m1 -> Err(io)          WriteOutcome::into_bool() == Ok(false)
//!                          WriteOutcome::errors()    == [(m1, io)]
//! ```
//!
//! Multi-mirror writes are not atomic: a failed mirror does not undo the
//! ones that already succeeded.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use skv_common::{
    BackendClient, BackendError, BackendManager, BackendResult, KeyTtl, ShardError, ShardResult,
};
use tracing::warn;

use crate::cache::ConnectionCache;
use crate::codec::{decode, decode_text, encode};
use crate::list::ShardedList;
use crate::pipeline::ShardedPipeline;
use crate::strategy::{BackendId, ShardMap};

/// Execution options for a `ShardedClient`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Run mirror writes on scoped threads instead of one after another.
    /// Results stay ordered by mirror either way.
    pub parallel_writes: bool,
}

/// Per-mirror results of one boolean write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    mirrors: Vec<(BackendId, BackendResult<bool>)>,
}

impl WriteOutcome {
    /// Results in group order.
    pub fn mirrors(&self) -> &[(BackendId, BackendResult<bool>)] {
        &self.mirrors
    }

    /// True when every mirror returned `Ok(true)`.
    pub fn all_succeeded(&self) -> bool {
        self.mirrors.iter().all(|(_, result)| matches!(result, Ok(true)))
    }

    /// Mirrors that failed, with their errors.
    pub fn errors(&self) -> impl Iterator<Item = (BackendId, &BackendError)> {
        self.mirrors
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|err| (*id, err)))
    }

    /// Folds the outcome into one flag with logical AND.
    ///
    /// A group with a single mirror has nothing to fold, so its error is
    /// returned as is.
    pub fn into_bool(self) -> ShardResult<bool> {
        let all = self.all_succeeded();
        let mut mirrors = self.mirrors;
        if mirrors.len() == 1 {
            if let Some((_, Err(err))) = mirrors.pop() {
                return Err(err.into());
            }
        }
        Ok(all)
    }

    /// Returns the first mirror error, if any.
    pub fn into_unit(self) -> ShardResult<()> {
        first_error(self.mirrors.into_iter().map(|(_, result)| result))
    }
}

fn first_error<R>(results: impl IntoIterator<Item = BackendResult<R>>) -> ShardResult<()> {
    for result in results {
        result?;
    }
    Ok(())
}

fn owned_keys<K: AsRef<str>>(keys: &[K]) -> Vec<String> {
    keys.iter().map(|key| key.as_ref().to_string()).collect()
}

/// One logical client over a static table of mirrored backends.
pub struct ShardedClient<M: BackendManager> {
    map: ShardMap<M>,
    cache: ConnectionCache<M>,
    options: ClientOptions,
}

impl<M: BackendManager> ShardedClient<M> {
    /// Creates a client with sequential mirror writes.
    pub fn new(map: ShardMap<M>) -> Self {
        Self::with_options(map, ClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(map: ShardMap<M>, options: ClientOptions) -> Self {
        let cache = ConnectionCache::new(map.backend_count());
        ShardedClient {
            map,
            cache,
            options,
        }
    }

    /// Builds the shard map from ordered mirror groups and wraps it.
    pub fn from_groups(groups: Vec<Vec<Arc<M>>>) -> ShardResult<Self> {
        Ok(Self::new(ShardMap::new(groups)?))
    }

    /// Returns the routing table.
    pub fn shard_map(&self) -> &ShardMap<M> {
        &self.map
    }

    /// Returns the options this client was built with.
    pub fn options(&self) -> ClientOptions {
        self.options
    }

    /// Returns the cached client for `id`, opening it on first use.
    ///
    /// # Errors
    /// `ShardOutOfRange` for an id that does not belong to this client's map.
    pub fn connection(&self, id: BackendId) -> ShardResult<Arc<M::Client>> {
        let manager = self.map.manager(id).ok_or(ShardError::ShardOutOfRange {
            index: id.index(),
            groups: self.map.backend_count(),
        })?;
        self.cache.get(id, manager)
    }

    /// Number of backend clients opened so far.
    pub fn cached_connections(&self) -> usize {
        self.cache.len()
    }

    /// Returns true once `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.cache.is_disposed()
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.cache.is_disposed() {
            return Err(ShardError::ClientDisposed);
        }
        Ok(())
    }

    // Backend failures while opening a mirror belong to that mirror's slot;
    // anything else (disposal, bad id) aborts the whole write.
    fn mirror_client(&self, id: BackendId) -> ShardResult<BackendResult<Arc<M::Client>>> {
        match self.connection(id) {
            Ok(client) => Ok(Ok(client)),
            Err(ShardError::Backend(err)) => Ok(Err(err)),
            Err(err) => Err(err),
        }
    }

    /// Applies `op` to every mirror of `key`'s group.
    ///
    /// Returns one result per mirror, in group order.
    pub fn write<R, F>(&self, key: &str, op: F) -> ShardResult<Vec<BackendResult<R>>>
    where
        F: Fn(&M::Client) -> BackendResult<R> + Sync,
        R: Send,
    {
        self.ensure_open()?;
        let group = self.map.write_group_for(key)?;
        let mut clients = Vec::with_capacity(group.len());
        for &id in group {
            clients.push(self.mirror_client(id)?);
        }

        let run = |client: &BackendResult<Arc<M::Client>>| match client {
            Ok(client) => op(&**client),
            Err(err) => Err(err.clone()),
        };

        let results: Vec<BackendResult<R>> = if self.options.parallel_writes && clients.len() > 1 {
            thread::scope(|scope| {
                let handles: Vec<_> = clients
                    .iter()
                    .map(|client| scope.spawn(move || run(client)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
                    .collect()
            })
        } else {
            clients.iter().map(run).collect()
        };

        for (id, result) in group.iter().zip(&results) {
            if let (Err(err), Some(manager)) = (result, self.map.manager(*id)) {
                warn!(
                    key,
                    backend = %manager.describe(),
                    error = %err,
                    "mirror write failed"
                );
            }
        }
        Ok(results)
    }

    /// Runs a boolean write and keeps the per-mirror results.
    pub fn write_outcome<F>(&self, key: &str, op: F) -> ShardResult<WriteOutcome>
    where
        F: Fn(&M::Client) -> BackendResult<bool> + Sync,
    {
        let results = self.write(key, op)?;
        let group = self.map.write_group_for(key)?;
        Ok(WriteOutcome {
            mirrors: group.iter().copied().zip(results).collect(),
        })
    }

    /// Applies `op` once, on the first mirror of `key`'s group.
    pub fn read<R, F>(&self, key: &str, op: F) -> ShardResult<R>
    where
        F: FnOnce(&M::Client) -> BackendResult<R>,
    {
        self.ensure_open()?;
        let id = self.map.read_target_for(key)?;
        let client = self.connection(id)?;
        Ok(op(&*client)?)
    }

    fn batches_by_read_target(&self, keys: &[String]) -> ShardResult<Vec<(BackendId, Vec<String>)>> {
        let mut batches: Vec<(BackendId, Vec<String>)> = Vec::new();
        for key in keys {
            let id = self.map.read_target_for(key)?;
            match batches.iter_mut().find(|(known, _)| *known == id) {
                Some((_, subset)) => subset.push(key.clone()),
                None => batches.push((id, vec![key.clone()])),
            }
        }
        Ok(batches)
    }

    /// Reads many keys with one `batch_op` call per distinct read target.
    ///
    /// Targets are visited in order of first appearance in `keys`, and the
    /// per-target results are concatenated in that order. The output is
    /// therefore grouped by backend, not in input order.
    pub fn read_many_keys<R, F>(&self, keys: &[String], mut batch_op: F) -> ShardResult<Vec<R>>
    where
        F: FnMut(&M::Client, &[String]) -> BackendResult<Vec<R>>,
    {
        self.ensure_open()?;
        let mut merged = Vec::with_capacity(keys.len());
        for (id, subset) in self.batches_by_read_target(keys)? {
            let client = self.connection(id)?;
            merged.extend(batch_op(&*client, subset.as_slice())?);
        }
        Ok(merged)
    }

    /// Like `read_many_keys`, merging per-target maps into one.
    pub fn read_map<R, F>(&self, keys: &[String], mut batch_op: F) -> ShardResult<HashMap<String, R>>
    where
        F: FnMut(&M::Client, &[String]) -> BackendResult<HashMap<String, R>>,
    {
        self.ensure_open()?;
        let mut merged = HashMap::with_capacity(keys.len());
        for (id, subset) in self.batches_by_read_target(keys)? {
            let client = self.connection(id)?;
            merged.extend(batch_op(&*client, subset.as_slice())?);
        }
        Ok(merged)
    }

    /// Starts a pipeline bound to this client's connections.
    pub fn create_pipeline<T>(&self) -> ShardResult<ShardedPipeline<'_, M, T>> {
        self.ensure_open()?;
        Ok(ShardedPipeline::new(self))
    }

    /// Releases every cached connection. Later operations fail with
    /// `ClientDisposed`; calling it again releases nothing.
    ///
    /// Must not race with in-flight operations on the same client.
    pub fn dispose(&self) -> usize {
        self.cache.dispose_all()
    }

    fn store(&self, key: &str, data: &[u8], ttl: Option<Duration>) -> ShardResult<bool> {
        self.write_outcome(key, |client| client.set(key, data, ttl))?
            .into_bool()
    }

    /// Stores `value` only where `key` is absent. True when every mirror stored it.
    pub fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> ShardResult<bool> {
        let data = encode(value)?;
        self.write_outcome(key, |client| client.add(key, &data, ttl))?
            .into_bool()
    }

    /// Stores `value` without expiration.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ShardResult<bool> {
        self.store(key, &encode(value)?, None)
    }

    /// Stores `value`, expiring after `ttl`.
    pub fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> ShardResult<bool> {
        self.store(key, &encode(value)?, Some(ttl))
    }

    /// Stores a raw string, optionally expiring after `ttl`.
    pub fn set_entry(&self, key: &str, value: &str, ttl: Option<Duration>) -> ShardResult<()> {
        first_error(self.write(key, |client| client.set(key, value.as_bytes(), ttl))?)
    }

    /// Deletes `key`. True when every mirror removed it.
    pub fn remove(&self, key: &str) -> ShardResult<bool> {
        self.write_outcome(key, |client| client.remove(key))?
            .into_bool()
    }

    /// Renames `key` on the mirrors of its group.
    ///
    /// Routing uses the old key only. If `new_key` hashes to another group,
    /// later reads of `new_key` will not find it.
    pub fn rename(&self, key: &str, new_key: &str) -> ShardResult<()> {
        first_error(self.write(key, |client| client.rename(key, new_key))?)
    }

    /// Fetches and decodes a JSON value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ShardResult<Option<T>> {
        self.read(key, |client| client.get(key))?
            .map(|data| decode(&data))
            .transpose()
    }

    /// Fetches a raw string.
    pub fn get_string(&self, key: &str) -> ShardResult<Option<String>> {
        self.read(key, |client| client.get(key))?
            .map(decode_text)
            .transpose()
    }

    /// Returns the TTL state of `key` on its read target.
    pub fn time_to_live(&self, key: &str) -> ShardResult<KeyTtl> {
        self.read(key, |client| client.ttl(key))
    }

    /// Fetches raw strings for many keys, grouped by backend.
    pub fn get_values<K: AsRef<str>>(&self, keys: &[K]) -> ShardResult<Vec<Option<String>>> {
        self.read_many_keys(&owned_keys(keys), |client, subset| client.get_values(subset))?
            .into_iter()
            .map(|value| value.map(decode_text).transpose())
            .collect()
    }

    /// Fetches and decodes many JSON values, grouped by backend.
    pub fn get_values_as<T: DeserializeOwned, K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> ShardResult<Vec<Option<T>>> {
        self.read_many_keys(&owned_keys(keys), |client, subset| client.get_values(subset))?
            .into_iter()
            .map(|value| value.map(|data| decode(&data)).transpose())
            .collect()
    }

    /// Fetches and decodes many JSON values keyed by their key.
    pub fn get_values_map<T: DeserializeOwned, K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> ShardResult<HashMap<String, Option<T>>> {
        let raw = self.read_map(&owned_keys(keys), |client, subset| {
            let values = client.get_values(subset)?;
            Ok(subset.iter().cloned().zip(values).collect::<HashMap<_, _>>())
        })?;
        raw.into_iter()
            .map(|(key, value)| -> ShardResult<(String, Option<T>)> {
                Ok((key, value.map(|data| decode(&data)).transpose()?))
            })
            .collect()
    }

    /// Appends a JSON value to the list at `key`.
    pub fn push_item_to_list<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ShardResult<()> {
        let data = encode(value)?;
        first_error(self.write(key, |client| client.list_push(key, &data))?)
    }

    /// Returns every item of the list at `key` as raw strings.
    pub fn get_all_items_from_list(&self, key: &str) -> ShardResult<Vec<String>> {
        self.read(key, |client| client.list_range(key, 0, -1))?
            .into_iter()
            .map(decode_text)
            .collect()
    }

    /// Empties the list at `key` on every mirror.
    pub fn remove_all_from_list(&self, key: &str) -> ShardResult<()> {
        first_error(self.write(key, |client| client.list_clear(key))?)
    }

    /// Returns a typed handle on the list at `key`.
    pub fn list<T>(&self, key: impl Into<String>) -> ShardedList<'_, M, T> {
        ShardedList::new(self, key.into())
    }

    /// Sets one field of the hash `hash_id`.
    ///
    /// Routed by `hash_id`, the same key `get_all_entries_from_hash` reads.
    pub fn set_entry_in_hash<V: Serialize + ?Sized>(
        &self,
        hash_id: &str,
        field: &str,
        value: &V,
    ) -> ShardResult<()> {
        let data = encode(value)?;
        first_error(self.write(hash_id, |client| client.hash_set(hash_id, field, &data))?)
    }

    /// Returns every entry of the hash `hash_id`, parsing field names as `K`.
    pub fn get_all_entries_from_hash<K, V>(&self, hash_id: &str) -> ShardResult<HashMap<K, V>>
    where
        K: FromStr + Eq + Hash,
        V: DeserializeOwned,
    {
        self.read(hash_id, |client| client.hash_get_all(hash_id))?
            .into_iter()
            .map(|(field, data)| -> ShardResult<(K, V)> {
                let key = K::from_str(&field).map_err(|_| ShardError::InvalidHashKey(field.clone()))?;
                Ok((key, decode(&data)?))
            })
            .collect()
    }
}

impl<M: BackendManager> std::fmt::Debug for ShardedClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedClient")
            .field("groups", &self.map.group_count())
            .field("backends", &self.map.backend_count())
            .field("cached", &self.cache.len())
            .field("options", &self.options)
            .finish()
    }
}
