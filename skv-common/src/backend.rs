//! # Backend Contract
//!
//! Purpose: Describe what the shard router needs from one physical
//! key-value store, without tying it to a wire protocol.
//!
//! ## Design Principles
//! 1. **Command Objects**: Every primitive is a `Command` value, so the same
//!    description can run immediately or sit in a pipeline queue.
//! 2. **Two Required Methods**: Implementors provide `execute` (and may
//!    override `execute_batch`); typed helpers are provided on top.
//! 3. **Manager Hands Out Clients**: `BackendManager::get_client` is the only
//!    way to obtain a connection, mirroring pooled Redis client managers.
//!
//! ## Reply Shapes
//!
//! ```text
//! GET / SET / SETNX        -> Bulk | Nil | Ok
//! DEL / PEXPIRE / RPUSH    -> Integer
//! HSET                     -> Integer (1 = new field)
//! PTTL                     -> Ttl
//! MGET / LRANGE / HGETALL  -> Array (HGETALL is flat: field, value, ...)
//! RENAME / LTRIM           -> Ok
//! ```

use std::time::Duration;

use crate::error::{BackendError, BackendResult};

/// TTL state of a key, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// One backend primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Option<Duration> },
    /// Set only when the key is absent.
    SetNx { key: String, value: Vec<u8>, ttl: Option<Duration> },
    Del { key: String },
    Rename { key: String, new_key: String },
    Expire { key: String, ttl: Duration },
    Ttl { key: String },
    MGet { keys: Vec<String> },
    RPush { key: String, value: Vec<u8> },
    LRange { key: String, start: i64, stop: i64 },
    LTrim { key: String, start: i64, stop: i64 },
    HSet { key: String, field: String, value: Vec<u8> },
    HGetAll { key: String },
}

impl Command {
    /// Redis command verb sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } | Command::SetNx { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Rename { .. } => "RENAME",
            Command::Expire { .. } => "PEXPIRE",
            Command::Ttl { .. } => "PTTL",
            Command::MGet { .. } => "MGET",
            Command::RPush { .. } => "RPUSH",
            Command::LRange { .. } => "LRANGE",
            Command::LTrim { .. } => "LTRIM",
            Command::HSet { .. } => "HSET",
            Command::HGetAll { .. } => "HGETALL",
        }
    }

    /// First key the command touches (the routing key for single-key commands).
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::SetNx { key, .. }
            | Command::Del { key }
            | Command::Rename { key, .. }
            | Command::Expire { key, .. }
            | Command::Ttl { key }
            | Command::RPush { key, .. }
            | Command::LRange { key, .. }
            | Command::LTrim { key, .. }
            | Command::HSet { key, .. }
            | Command::HGetAll { key } => Some(key.as_str()),
            Command::MGet { keys } => keys.first().map(String::as_str),
        }
    }
}

/// Decoded backend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK
    Ok,
    /// Null bulk string or null array.
    Nil,
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Option<Vec<u8>>>),
    Ttl(KeyTtl),
}

impl Reply {
    /// Interprets the reply of a SET-style command.
    pub fn into_set_flag(self) -> BackendResult<bool> {
        match self {
            Reply::Ok => Ok(true),
            Reply::Nil => Ok(false),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Interprets an integer reply as "at least one".
    pub fn into_positive(self) -> BackendResult<bool> {
        match self {
            Reply::Integer(count) => Ok(count > 0),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Interprets an array reply whose items are all present.
    pub fn into_items(self) -> BackendResult<Vec<Vec<u8>>> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| item.ok_or(BackendError::UnexpectedResponse))
                .collect(),
            Reply::Nil => Ok(Vec::new()),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }
}

/// A live connection to one backend.
///
/// Implementors must be shareable: the router hands one cached client to every
/// caller that routes to the same backend.
pub trait BackendClient: Send + Sync {
    /// Executes one command and returns its reply.
    fn execute(&self, command: &Command) -> BackendResult<Reply>;

    /// Executes commands in order as one batch.
    ///
    /// The outer error means the batch as a whole failed (e.g. the connection
    /// dropped); inner errors are per-command server replies.
    fn execute_batch(&self, commands: &[Command]) -> BackendResult<Vec<BackendResult<Reply>>> {
        Ok(commands.iter().map(|command| self.execute(command)).collect())
    }

    /// Fetches a value. Returns `Ok(None)` when the key is missing.
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        match self.execute(&Command::Get { key: key.to_string() })? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Nil => Ok(None),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Sets a value, optionally with expiration.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> BackendResult<bool> {
        self.execute(&Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?
        .into_set_flag()
    }

    /// Sets a value only when the key is absent. Returns true when stored.
    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> BackendResult<bool> {
        self.execute(&Command::SetNx {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?
        .into_set_flag()
    }

    /// Deletes a key. Returns true when a key was removed.
    fn remove(&self, key: &str) -> BackendResult<bool> {
        self.execute(&Command::Del { key: key.to_string() })?
            .into_positive()
    }

    /// Renames a key.
    fn rename(&self, key: &str, new_key: &str) -> BackendResult<()> {
        match self.execute(&Command::Rename {
            key: key.to_string(),
            new_key: new_key.to_string(),
        })? {
            Reply::Ok => Ok(()),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        self.execute(&Command::Expire {
            key: key.to_string(),
            ttl,
        })?
        .into_positive()
    }

    /// Returns TTL status for a key.
    fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        match self.execute(&Command::Ttl { key: key.to_string() })? {
            Reply::Ttl(ttl) => Ok(ttl),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Fetches several values, one slot per key in request order.
    fn get_values(&self, keys: &[String]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match self.execute(&Command::MGet { keys: keys.to_vec() })? {
            Reply::Array(items) if items.len() == keys.len() => Ok(items),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Appends to a list. Returns the new list length.
    fn list_push(&self, key: &str, value: &[u8]) -> BackendResult<u64> {
        match self.execute(&Command::RPush {
            key: key.to_string(),
            value: value.to_vec(),
        })? {
            Reply::Integer(len) if len >= 0 => Ok(len as u64),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Returns list items in `[start, stop]` (Redis index semantics).
    fn list_range(&self, key: &str, start: i64, stop: i64) -> BackendResult<Vec<Vec<u8>>> {
        self.execute(&Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })?
        .into_items()
    }

    /// Removes every item from a list.
    fn list_clear(&self, key: &str) -> BackendResult<()> {
        // start > stop trims to an empty list regardless of its length.
        match self.execute(&Command::LTrim {
            key: key.to_string(),
            start: 1,
            stop: 0,
        })? {
            Reply::Ok => Ok(()),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    /// Sets a hash field. Returns true when the field is new.
    fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> BackendResult<bool> {
        self.execute(&Command::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_vec(),
        })?
        .into_positive()
    }

    /// Returns every field/value pair of a hash.
    fn hash_get_all(&self, key: &str) -> BackendResult<Vec<(String, Vec<u8>)>> {
        let items = self
            .execute(&Command::HGetAll { key: key.to_string() })?
            .into_items()?;
        if items.len() % 2 != 0 {
            return Err(BackendError::UnexpectedResponse);
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            let field = String::from_utf8(field).map_err(|_| BackendError::UnexpectedResponse)?;
            pairs.push((field, value));
        }
        Ok(pairs)
    }
}

/// Hands out clients for one backend endpoint.
pub trait BackendManager: Send + Sync {
    type Client: BackendClient;

    /// Opens (or borrows) a client for this backend.
    fn get_client(&self) -> BackendResult<Self::Client>;

    /// Human-readable endpoint name for logs.
    fn describe(&self) -> String;
}
