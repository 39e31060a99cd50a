//! # Sharded Pipeline
//!
//! Purpose: Queue commands against shard-resolved backends and send them
//! only on `flush`, one batch per backend.
//!
//! ## Design Principles
//! 1. **Same Routing as the Client**: Writes are queued on every mirror,
//!    reads on the first mirror only.
//! 2. **Arena Sessions**: One session per `BackendId`, created on first use
//!    from the client's cached connection.
//! 3. **Deferred Callbacks**: A read callback runs exactly once, during the
//!    `flush` that executes its backend's batch.
//!
//! ## Lifecycle
//!
//! ```text
//! Empty --queue_*--> Queuing --flush--> Queuing (reusable)
//!                       |                  |
//!                       +----dispose-------+--> Disposed
//! ```
//!
//! Receivers take `&mut self`, so queuing cannot overlap a flush on the same
//! pipeline. Dropping a pipeline discards unflushed sessions without running
//! their callbacks.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use skv_common::{
    BackendClient, BackendError, BackendManager, BackendResult, Command, Reply, ShardError,
    ShardResult,
};
use tracing::{debug, warn};

use crate::client::ShardedClient;
use crate::codec::{decode, encode};
use crate::strategy::BackendId;

type Callback<'c> = Box<dyn FnOnce(ShardResult<Reply>) + 'c>;

struct Session<'c, C> {
    client: Arc<C>,
    commands: Vec<Command>,
    // Parallel to `commands`; `None` for write commands.
    callbacks: Vec<Option<Callback<'c>>>,
}

impl<'c, C> Session<'c, C> {
    fn new(client: Arc<C>) -> Self {
        Session {
            client,
            commands: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

/// Reads a flag from SET NX, DEL, PEXPIRE or HSET style replies.
fn reply_flag(reply: Reply) -> BackendResult<bool> {
    match reply {
        Reply::Ok => Ok(true),
        Reply::Nil => Ok(false),
        Reply::Integer(count) => Ok(count > 0),
        _ => Err(BackendError::UnexpectedResponse),
    }
}

/// Command batches for one value type, flushed together.
pub struct ShardedPipeline<'c, M: BackendManager, T> {
    client: &'c ShardedClient<M>,
    sessions: Vec<Option<Session<'c, M::Client>>>,
    disposed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'c, M: BackendManager, T> ShardedPipeline<'c, M, T> {
    pub(crate) fn new(client: &'c ShardedClient<M>) -> Self {
        let mut sessions = Vec::new();
        sessions.resize_with(client.shard_map().backend_count(), || None);
        ShardedPipeline {
            client,
            sessions,
            disposed: false,
            _marker: PhantomData,
        }
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.disposed {
            return Err(ShardError::PipelineDisposed);
        }
        if self.client.is_disposed() {
            return Err(ShardError::ClientDisposed);
        }
        Ok(())
    }

    fn enqueue(
        &mut self,
        id: BackendId,
        command: Command,
        callback: Option<Callback<'c>>,
    ) -> ShardResult<()> {
        let slots = self.sessions.len();
        let slot = self
            .sessions
            .get_mut(id.index())
            .ok_or(ShardError::ShardOutOfRange {
                index: id.index(),
                groups: slots,
            })?;
        let session = match slot {
            Some(session) => session,
            None => slot.insert(Session::new(self.client.connection(id)?)),
        };
        session.commands.push(command);
        session.callbacks.push(callback);
        Ok(())
    }

    /// Queues `command` on every mirror of `key`'s group.
    pub fn queue_write_command(&mut self, key: &str, command: Command) -> ShardResult<()> {
        self.ensure_open()?;
        let client = self.client;
        for &id in client.shard_map().write_group_for(key)? {
            self.enqueue(id, command.clone(), None)?;
        }
        Ok(())
    }

    /// Queues `command` on the read target of `key`.
    ///
    /// `callback` receives the command's reply during the next `flush`.
    pub fn queue_read_command<F>(&mut self, key: &str, command: Command, callback: F) -> ShardResult<()>
    where
        F: FnOnce(ShardResult<Reply>) + 'c,
    {
        self.ensure_open()?;
        let id = self.client.shard_map().read_target_for(key)?;
        self.enqueue(id, command, Some(Box::new(callback)))
    }

    /// Queues a read whose reply is a flag (SET NX, DEL, PEXPIRE, HSET).
    pub fn queue_read_bool<F>(&mut self, key: &str, command: Command, callback: F) -> ShardResult<()>
    where
        F: FnOnce(ShardResult<bool>) + 'c,
    {
        self.queue_read_command(key, command, move |reply| {
            callback(reply.and_then(|reply| Ok(reply_flag(reply)?)))
        })
    }

    /// Total commands waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.sessions
            .iter()
            .flatten()
            .map(|session| session.commands.len())
            .sum()
    }

    /// Number of backends this pipeline has opened a session on.
    pub fn sessions(&self) -> usize {
        self.sessions.iter().flatten().count()
    }

    /// Sends every queued batch, one backend at a time in `BackendId` order.
    ///
    /// Each backend runs its commands in enqueue order; read callbacks fire as
    /// soon as their backend's batch returns. Every backend is attempted. The
    /// first failure of a whole batch or of a queued write is returned; read
    /// failures go to their callbacks only.
    pub fn flush(&mut self) -> ShardResult<()> {
        self.ensure_open()?;
        let mut first_error: Option<ShardError> = None;

        for (index, slot) in self.sessions.iter_mut().enumerate() {
            let session = match slot {
                Some(session) if !session.commands.is_empty() => session,
                _ => continue,
            };
            let commands = std::mem::take(&mut session.commands);
            let callbacks = std::mem::take(&mut session.callbacks);
            debug!(backend = index, commands = commands.len(), "flushing pipeline batch");

            let replies = session
                .client
                .execute_batch(&commands)
                .and_then(|replies| {
                    if replies.len() == commands.len() {
                        Ok(replies)
                    } else {
                        Err(BackendError::UnexpectedResponse)
                    }
                });

            match replies {
                Ok(replies) => {
                    for (reply, callback) in replies.into_iter().zip(callbacks) {
                        match (callback, reply) {
                            (Some(callback), reply) => callback(reply.map_err(ShardError::from)),
                            (None, Ok(_)) => {}
                            (None, Err(err)) => {
                                warn!(backend = index, error = %err, "pipelined write failed");
                                first_error.get_or_insert(err.into());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(backend = index, error = %err, "pipeline batch failed");
                    for callback in callbacks.into_iter().flatten() {
                        callback(Err(err.clone().into()));
                    }
                    first_error.get_or_insert(err.into());
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops every session and its pending callbacks. The client's
    /// connections stay open. Later calls fail with `PipelineDisposed`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        let dropped = self.queued();
        self.sessions.clear();
        self.disposed = true;
        debug!(dropped, "disposed pipeline");
    }

    /// Returns true once `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<'c, M: BackendManager, T: Serialize> ShardedPipeline<'c, M, T> {
    /// Queues a JSON-encoded SET of `value` on every mirror of `key`.
    pub fn queue_set(&mut self, key: &str, value: &T, ttl: Option<Duration>) -> ShardResult<()> {
        let command = Command::Set {
            key: key.to_string(),
            value: encode(value)?,
            ttl,
        };
        self.queue_write_command(key, command)
    }

    /// Queues a JSON-encoded RPUSH of `value` on every mirror of `key`.
    pub fn queue_push(&mut self, key: &str, value: &T) -> ShardResult<()> {
        let command = Command::RPush {
            key: key.to_string(),
            value: encode(value)?,
        };
        self.queue_write_command(key, command)
    }
}

impl<'c, M: BackendManager, T: DeserializeOwned + 'c> ShardedPipeline<'c, M, T> {
    /// Queues a read whose reply is a list of JSON-encoded `T`.
    pub fn queue_read_values<F>(&mut self, key: &str, command: Command, callback: F) -> ShardResult<()>
    where
        F: FnOnce(ShardResult<Vec<T>>) + 'c,
    {
        self.queue_read_command(key, command, move |reply| {
            let values = reply.and_then(|reply| {
                reply
                    .into_items()?
                    .iter()
                    .map(|data| decode(data))
                    .collect::<ShardResult<Vec<T>>>()
            });
            callback(values)
        })
    }

    /// Queues a read of every item in the list at `key`.
    pub fn queue_get_items<F>(&mut self, key: &str, callback: F) -> ShardResult<()>
    where
        F: FnOnce(ShardResult<Vec<T>>) + 'c,
    {
        let command = Command::LRange {
            key: key.to_string(),
            start: 0,
            stop: -1,
        };
        self.queue_read_values(key, command, callback)
    }
}

impl<'c, M: BackendManager, T> std::fmt::Debug for ShardedPipeline<'c, M, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedPipeline")
            .field("sessions", &self.sessions())
            .field("queued", &self.queued())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use skv_engine::MemoryBackend;

    use super::*;

    fn two_groups() -> (ShardedClient<MemoryBackend>, Vec<Arc<MemoryBackend>>) {
        let backends: Vec<Arc<MemoryBackend>> = ["a0", "a1", "b0"]
            .iter()
            .map(|name| Arc::new(MemoryBackend::new(*name)))
            .collect();
        let client = ShardedClient::from_groups(vec![
            vec![Arc::clone(&backends[0]), Arc::clone(&backends[1])],
            vec![Arc::clone(&backends[2])],
        ])
        .unwrap();
        (client, backends)
    }

    #[test]
    fn nothing_runs_before_flush() {
        let (client, backends) = two_groups();
        let mut pipeline = client.create_pipeline::<String>().unwrap();
        pipeline.queue_set("a", &"one".to_string(), None).unwrap();
        assert_eq!(pipeline.queued(), 2);
        assert_eq!(pipeline.sessions(), 2);
        assert!(backends.iter().all(|backend| backend.stats().commands_total == 0));

        pipeline.flush().unwrap();
        assert_eq!(pipeline.queued(), 0);
        assert_eq!(backends[0].stats().batches_total, 1);
        assert_eq!(backends[1].stats().batches_total, 1);
        assert_eq!(backends[2].stats().batches_total, 0);
        assert_eq!(client.get::<String>("a").unwrap().as_deref(), Some("one"));
    }

    #[test]
    fn callbacks_fire_once_after_flush_in_order() {
        let (client, _) = two_groups();
        let seen = RefCell::new(Vec::new());
        {
            let mut pipeline = client.create_pipeline::<u32>().unwrap();
            pipeline.queue_push("b", &1).unwrap();
            pipeline.queue_push("b", &2).unwrap();
            pipeline
                .queue_get_items("b", |items| seen.borrow_mut().push(items.unwrap()))
                .unwrap();
            pipeline.queue_push("b", &3).unwrap();
            pipeline
                .queue_get_items("b", |items| seen.borrow_mut().push(items.unwrap()))
                .unwrap();
            assert!(seen.borrow().is_empty());

            pipeline.flush().unwrap();
            pipeline.flush().unwrap();
        }
        assert_eq!(*seen.borrow(), vec![vec![1, 2], vec![1, 2, 3]]);
    }

    #[test]
    fn read_bool_reports_flags() {
        let (client, _) = two_groups();
        client.set_entry("b", "x", None).unwrap();
        let flags = RefCell::new(Vec::new());
        let mut pipeline = client.create_pipeline::<String>().unwrap();
        pipeline
            .queue_read_bool("b", Command::Del { key: "b".into() }, |flag| {
                flags.borrow_mut().push(flag.unwrap())
            })
            .unwrap();
        pipeline
            .queue_read_bool("b", Command::Del { key: "b".into() }, |flag| {
                flags.borrow_mut().push(flag.unwrap())
            })
            .unwrap();
        pipeline.flush().unwrap();
        drop(pipeline);
        assert_eq!(*flags.borrow(), vec![true, false]);
    }

    #[test]
    fn failed_write_is_reported_after_all_batches() {
        let (client, backends) = two_groups();
        client.push_item_to_list("a", &1u8).unwrap();
        let mut pipeline = client.create_pipeline::<String>().unwrap();
        // SET on a list key succeeds in Redis; GET on it does not.
        pipeline
            .queue_write_command("a", Command::Get { key: "a".into() })
            .unwrap();
        pipeline.queue_set("b", &"later".to_string(), None).unwrap();

        let err = pipeline.flush().unwrap_err();
        assert!(matches!(err.as_backend(), Some(BackendError::WrongType)));
        assert_eq!(backends[2].stats().batches_total, 1);
        assert_eq!(client.get_string("b").unwrap().as_deref(), Some("\"later\""));
    }

    #[test]
    fn dispose_drops_pending_work() {
        let (client, backends) = two_groups();
        let called = RefCell::new(false);
        let mut pipeline = client.create_pipeline::<String>().unwrap();
        pipeline
            .queue_read_command("a", Command::Get { key: "a".into() }, |_| {
                *called.borrow_mut() = true
            })
            .unwrap();
        pipeline.dispose();
        pipeline.dispose();

        assert!(pipeline.is_disposed());
        assert!(matches!(pipeline.flush(), Err(ShardError::PipelineDisposed)));
        assert!(matches!(
            pipeline.queue_write_command("a", Command::Del { key: "a".into() }),
            Err(ShardError::PipelineDisposed)
        ));
        drop(pipeline);
        assert!(!*called.borrow());
        assert_eq!(backends[0].stats().commands_total, 0);
        // Connections belong to the client and survive the pipeline.
        assert_eq!(client.cached_connections(), 1);
    }
}
