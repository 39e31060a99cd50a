//! # In-Memory Engine
//!
//! Provide an in-process key-value store that executes the backend
//! `Command` set with Redis semantics for strings, lists, hashes and TTLs.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` for a default sharded engine.
//! - Use `MemoryEngine::with_shard_count` to control lock striping.
//! - Wrap it in a `MemoryBackend` to plug it into the shard router.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Typed Entries**: One map holds strings, lists and hashes; commands
//!    against the wrong kind fail with `WrongType` like Redis.
//! 3. **TTL Fast Path**: Expiration is checked on access for O(1) reads.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<ShardInner>
//!                     └── map: HashMap<String, Entry>
//!                           └── Entry { value: Value, expires_at }
//! ```

use std::collections::VecDeque;
use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use skv_common::{BackendError, BackendResult, Command, KeyTtl, Reply};

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Stored value kinds.
#[derive(Debug, Clone)]
enum Value {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>, RandomState>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug)]
struct ShardInner {
    map: HashMap<String, Entry, RandomState>,
}

impl ShardInner {
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
        }
    }

    /// Returns the live entry for `key`, dropping it first if expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self.map.get(key).map(|entry| entry.is_expired(now))?;
        if expired {
            self.map.remove(key);
            return None;
        }
        self.map.get_mut(key)
    }

    /// Takes the live entry for `key` out of the map.
    fn take_live(&mut self, key: &str, now: Instant) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry)
    }
}

#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Sharded in-memory store executing backend commands.
#[derive(Debug)]
pub struct MemoryEngine {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            })
            .collect();

        MemoryEngine {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let inner = shard.inner.read();
                inner.map.values().filter(|entry| !entry.is_expired(now)).count()
            })
            .sum()
    }

    /// Returns true when no live key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Executes one backend command.
    pub fn apply(&self, command: &Command) -> BackendResult<Reply> {
        let now = Instant::now();
        match command {
            Command::Get { key } => self.get(key, now),
            Command::Set { key, value, ttl } => self.set(key, value, *ttl, false, now),
            Command::SetNx { key, value, ttl } => self.set(key, value, *ttl, true, now),
            Command::Del { key } => {
                let mut inner = self.shard_for(key).inner.write();
                let removed = inner.take_live(key, now).is_some();
                Ok(Reply::Integer(removed as i64))
            }
            Command::Rename { key, new_key } => self.rename(key, new_key, now),
            Command::Expire { key, ttl } => {
                let deadline = expiry_deadline(now, *ttl, "pexpire")?;
                let mut inner = self.shard_for(key).inner.write();
                match inner.live(key, now) {
                    Some(entry) => {
                        entry.expires_at = Some(deadline);
                        Ok(Reply::Integer(1))
                    }
                    None => Ok(Reply::Integer(0)),
                }
            }
            Command::Ttl { key } => {
                let mut inner = self.shard_for(key).inner.write();
                let ttl = match inner.live(key, now) {
                    None => KeyTtl::Missing,
                    Some(Entry { expires_at: None, .. }) => KeyTtl::NoExpiry,
                    Some(Entry {
                        expires_at: Some(deadline),
                        ..
                    }) => KeyTtl::ExpiresIn(deadline.saturating_duration_since(now)),
                };
                Ok(Reply::Ttl(ttl))
            }
            Command::MGet { keys } => {
                let mut items = Vec::with_capacity(keys.len());
                for key in keys {
                    let mut inner = self.shard_for(key).inner.write();
                    // MGET returns nil for non-string values instead of failing.
                    let item = match inner.live(key, now) {
                        Some(Entry {
                            value: Value::String(data),
                            ..
                        }) => Some(data.clone()),
                        _ => None,
                    };
                    items.push(item);
                }
                Ok(Reply::Array(items))
            }
            Command::RPush { key, value } => {
                let mut inner = self.shard_for(key).inner.write();
                if inner.live(key, now).is_none() {
                    inner
                        .map
                        .insert(key.clone(), Entry::new(Value::List(VecDeque::new())));
                }
                match inner.map.get_mut(key.as_str()).map(|entry| &mut entry.value) {
                    Some(Value::List(list)) => {
                        list.push_back(value.clone());
                        Ok(Reply::Integer(list.len() as i64))
                    }
                    _ => Err(BackendError::WrongType),
                }
            }
            Command::LRange { key, start, stop } => {
                let mut inner = self.shard_for(key).inner.write();
                match inner.live(key, now).map(|entry| &entry.value) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Value::List(list)) => {
                        let items = match clamp_range(list.len(), *start, *stop) {
                            Some((from, to)) => {
                                list.range(from..=to).cloned().map(Some).collect()
                            }
                            None => Vec::new(),
                        };
                        Ok(Reply::Array(items))
                    }
                    Some(_) => Err(BackendError::WrongType),
                }
            }
            Command::LTrim { key, start, stop } => {
                let mut inner = self.shard_for(key).inner.write();
                let emptied = match inner.live(key, now).map(|entry| &mut entry.value) {
                    None => return Ok(Reply::Ok),
                    Some(Value::List(list)) => {
                        match clamp_range(list.len(), *start, *stop) {
                            Some((from, to)) => {
                                list.truncate(to + 1);
                                list.drain(..from);
                            }
                            None => list.clear(),
                        }
                        list.is_empty()
                    }
                    Some(_) => return Err(BackendError::WrongType),
                };
                // Redis deletes keys whose list becomes empty.
                if emptied {
                    inner.map.remove(key.as_str());
                }
                Ok(Reply::Ok)
            }
            Command::HSet { key, field, value } => {
                let mut inner = self.shard_for(key).inner.write();
                if inner.live(key, now).is_none() {
                    let hash = HashMap::with_hasher(self.hash_state.clone());
                    inner.map.insert(key.clone(), Entry::new(Value::Hash(hash)));
                }
                match inner.map.get_mut(key.as_str()).map(|entry| &mut entry.value) {
                    Some(Value::Hash(hash)) => {
                        let created = hash.insert(field.clone(), value.clone()).is_none();
                        Ok(Reply::Integer(created as i64))
                    }
                    _ => Err(BackendError::WrongType),
                }
            }
            Command::HGetAll { key } => {
                let mut inner = self.shard_for(key).inner.write();
                match inner.live(key, now).map(|entry| &entry.value) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Value::Hash(hash)) => {
                        let mut items = Vec::with_capacity(hash.len() * 2);
                        for (field, value) in hash {
                            items.push(Some(field.as_bytes().to_vec()));
                            items.push(Some(value.clone()));
                        }
                        Ok(Reply::Array(items))
                    }
                    Some(_) => Err(BackendError::WrongType),
                }
            }
        }
    }

    fn get(&self, key: &str, now: Instant) -> BackendResult<Reply> {
        let mut inner = self.shard_for(key).inner.write();
        match inner.live(key, now).map(|entry| &entry.value) {
            None => Ok(Reply::Nil),
            Some(Value::String(data)) => Ok(Reply::Bulk(data.clone())),
            Some(_) => Err(BackendError::WrongType),
        }
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        only_if_absent: bool,
        now: Instant,
    ) -> BackendResult<Reply> {
        let deadline = match ttl {
            Some(ttl) if ttl.is_zero() => {
                return Err(BackendError::Server(
                    "ERR invalid expire time in 'set' command".to_string(),
                ))
            }
            Some(ttl) => Some(expiry_deadline(now, ttl, "set")?),
            None => None,
        };

        let mut inner = self.shard_for(key).inner.write();
        if only_if_absent && inner.live(key, now).is_some() {
            return Ok(Reply::Nil);
        }

        let mut entry = Entry::new(Value::String(value.to_vec()));
        entry.expires_at = deadline;
        inner.map.insert(key.to_string(), entry);
        Ok(Reply::Ok)
    }

    fn rename(&self, key: &str, new_key: &str, now: Instant) -> BackendResult<Reply> {
        let from = self.shard_index(key);
        let to = self.shard_index(new_key);

        if from == to {
            let mut inner = self.shards[from].inner.write();
            let entry = inner.take_live(key, now).ok_or(BackendError::NoSuchKey)?;
            inner.map.insert(new_key.to_string(), entry);
            return Ok(Reply::Ok);
        }

        // Lock in index order so concurrent renames cannot deadlock.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let mut first_guard = self.shards[first].inner.write();
        let mut second_guard = self.shards[second].inner.write();
        let (source, target) = if from < to {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };

        let entry = source.take_live(key, now).ok_or(BackendError::NoSuchKey)?;
        target.map.insert(new_key.to_string(), entry);
        Ok(Reply::Ok)
    }

    /// Hashes a key to its owning lock stripe.
    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        (hasher.finish() as usize) & self.shard_mask
    }

    fn shard_for(&self, key: &str) -> &Shard {
        &self.shards[self.shard_index(key)]
    }
}

/// Resolves Redis-style inclusive `[start, stop]` indices (negative = from the
/// end) against a list of `len` items. `None` means the range is empty.
fn expiry_deadline(now: Instant, ttl: Duration, command: &str) -> BackendResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| BackendError::Server(format!("ERR invalid expire time in '{command}' command")))
}

fn clamp_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &[u8]) -> Command {
        Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl: None,
        }
    }

    fn push(key: &str, value: &[u8]) -> Command {
        Command::RPush {
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn set_get_roundtrip() {
        let engine = MemoryEngine::with_shard_count(4);
        assert_eq!(engine.apply(&set("alpha", b"value")).unwrap(), Reply::Ok);
        let reply = engine.apply(&Command::Get { key: "alpha".into() }).unwrap();
        assert_eq!(reply, Reply::Bulk(b"value".to_vec()));
    }

    #[test]
    fn set_nx_keeps_existing_value() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.apply(&set("alpha", b"first")).unwrap();
        let reply = engine
            .apply(&Command::SetNx {
                key: "alpha".into(),
                value: b"second".to_vec(),
                ttl: Some(Duration::from_secs(10)),
            })
            .unwrap();
        assert_eq!(reply, Reply::Nil);
        let reply = engine.apply(&Command::Get { key: "alpha".into() }).unwrap();
        assert_eq!(reply, Reply::Bulk(b"first".to_vec()));
    }

    #[test]
    fn set_rejects_zero_ttl() {
        let engine = MemoryEngine::with_shard_count(1);
        let err = engine
            .apply(&Command::Set {
                key: "alpha".into(),
                value: b"v".to_vec(),
                ttl: Some(Duration::ZERO),
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::Server(_)));
    }

    #[test]
    fn unrepresentable_ttl_is_rejected() {
        let engine = MemoryEngine::with_shard_count(1);
        let err = engine
            .apply(&Command::Set {
                key: "alpha".into(),
                value: b"v".to_vec(),
                ttl: Some(Duration::from_secs(u64::MAX)),
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::Server(_)));
        assert!(engine.is_empty());

        engine.apply(&set("alpha", b"value")).unwrap();
        let err = engine
            .apply(&Command::Expire {
                key: "alpha".into(),
                ttl: Duration::MAX,
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::Server(_)));
        let ttl = engine.apply(&Command::Ttl { key: "alpha".into() }).unwrap();
        assert_eq!(ttl, Reply::Ttl(KeyTtl::NoExpiry));
    }

    #[test]
    fn delete_removes_key() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.apply(&set("alpha", b"value")).unwrap();
        let del = Command::Del { key: "alpha".into() };
        assert_eq!(engine.apply(&del).unwrap(), Reply::Integer(1));
        assert_eq!(engine.apply(&del).unwrap(), Reply::Integer(0));
        assert!(engine.is_empty());
    }

    #[test]
    fn expire_hides_value() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.apply(&set("alpha", b"value")).unwrap();
        let reply = engine
            .apply(&Command::Expire {
                key: "alpha".into(),
                ttl: Duration::from_millis(1),
            })
            .unwrap();
        assert_eq!(reply, Reply::Integer(1));
        std::thread::sleep(Duration::from_millis(5));
        let reply = engine.apply(&Command::Get { key: "alpha".into() }).unwrap();
        assert_eq!(reply, Reply::Nil);
    }

    #[test]
    fn ttl_reports_missing_or_expiry() {
        let engine = MemoryEngine::with_shard_count(2);
        let ttl = Command::Ttl { key: "alpha".into() };
        assert_eq!(engine.apply(&ttl).unwrap(), Reply::Ttl(KeyTtl::Missing));

        engine.apply(&set("alpha", b"value")).unwrap();
        assert_eq!(engine.apply(&ttl).unwrap(), Reply::Ttl(KeyTtl::NoExpiry));

        engine
            .apply(&Command::Set {
                key: "alpha".into(),
                value: b"value".to_vec(),
                ttl: Some(Duration::from_secs(60)),
            })
            .unwrap();
        match engine.apply(&ttl).unwrap() {
            Reply::Ttl(KeyTtl::ExpiresIn(left)) => assert!(left <= Duration::from_secs(60)),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn rename_moves_value_across_stripes() {
        let engine = MemoryEngine::with_shard_count(8);
        for idx in 0..16 {
            let from = format!("src:{idx}");
            let to = format!("dst:{idx}");
            engine.apply(&set(&from, b"v")).unwrap();
            let reply = engine
                .apply(&Command::Rename { key: from.clone(), new_key: to.clone() })
                .unwrap();
            assert_eq!(reply, Reply::Ok);
            assert_eq!(engine.apply(&Command::Get { key: from }).unwrap(), Reply::Nil);
            assert_eq!(
                engine.apply(&Command::Get { key: to }).unwrap(),
                Reply::Bulk(b"v".to_vec())
            );
        }
    }

    #[test]
    fn rename_missing_key_fails() {
        let engine = MemoryEngine::with_shard_count(2);
        let err = engine
            .apply(&Command::Rename { key: "nope".into(), new_key: "other".into() })
            .unwrap_err();
        assert!(matches!(err, BackendError::NoSuchKey));
    }

    #[test]
    fn lists_push_range_and_trim() {
        let engine = MemoryEngine::with_shard_count(2);
        assert_eq!(engine.apply(&push("list", b"a")).unwrap(), Reply::Integer(1));
        assert_eq!(engine.apply(&push("list", b"b")).unwrap(), Reply::Integer(2));
        assert_eq!(engine.apply(&push("list", b"c")).unwrap(), Reply::Integer(3));

        let range = Command::LRange { key: "list".into(), start: 0, stop: -1 };
        assert_eq!(
            engine.apply(&range).unwrap(),
            Reply::Array(vec![Some(b"a".to_vec()), Some(b"b".to_vec()), Some(b"c".to_vec())])
        );

        let tail = Command::LRange { key: "list".into(), start: -2, stop: -1 };
        assert_eq!(
            engine.apply(&tail).unwrap(),
            Reply::Array(vec![Some(b"b".to_vec()), Some(b"c".to_vec())])
        );

        let trim = Command::LTrim { key: "list".into(), start: 1, stop: 0 };
        assert_eq!(engine.apply(&trim).unwrap(), Reply::Ok);
        assert_eq!(engine.apply(&range).unwrap(), Reply::Array(Vec::new()));
        assert!(engine.is_empty());
    }

    #[test]
    fn wrong_type_is_reported() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.apply(&set("alpha", b"value")).unwrap();
        let err = engine.apply(&push("alpha", b"x")).unwrap_err();
        assert!(matches!(err, BackendError::WrongType));
    }

    #[test]
    fn hashes_set_and_get_all() {
        let engine = MemoryEngine::with_shard_count(2);
        let hset = |field: &str, value: &[u8]| Command::HSet {
            key: "h".into(),
            field: field.into(),
            value: value.to_vec(),
        };
        assert_eq!(engine.apply(&hset("f", b"1")).unwrap(), Reply::Integer(1));
        assert_eq!(engine.apply(&hset("f", b"2")).unwrap(), Reply::Integer(0));

        let reply = engine.apply(&Command::HGetAll { key: "h".into() }).unwrap();
        assert_eq!(reply, Reply::Array(vec![Some(b"f".to_vec()), Some(b"2".to_vec())]));
    }

    #[test]
    fn mget_returns_one_slot_per_key() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.apply(&set("a", b"1")).unwrap();
        engine.apply(&push("l", b"x")).unwrap();
        let reply = engine
            .apply(&Command::MGet { keys: vec!["a".into(), "missing".into(), "l".into()] })
            .unwrap();
        assert_eq!(reply, Reply::Array(vec![Some(b"1".to_vec()), None, None]));
    }

    #[test]
    fn clamp_range_matches_redis_indices() {
        assert_eq!(clamp_range(3, 0, -1), Some((0, 2)));
        assert_eq!(clamp_range(3, -100, 100), Some((0, 2)));
        assert_eq!(clamp_range(3, 2, 1), None);
        assert_eq!(clamp_range(0, 0, -1), None);
        assert_eq!(clamp_range(3, 5, 10), None);
    }
}
