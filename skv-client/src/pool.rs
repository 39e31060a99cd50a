//! # Connection Pool
//!
//! Purpose: Bound and reuse TCP connections to one backend address. The pool
//! is the backend "manager": the shard router asks it for a client once per
//! backend and keeps that client until it is disposed.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections are parked and handed out
//!    again before any new socket is opened.
//! 2. **One Lock per Checkout**: Taking an idle connection and reserving a
//!    fresh slot happen under a single lock acquisition; the connect itself
//!    runs unlocked.
//! 3. **Fail Fast**: A full pool returns `PoolExhausted` immediately.
//! 4. **Poisoned Sockets Never Return**: A connection that saw an IO or
//!    framing error is closed immediately and never parked or reused.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skv_common::{BackendError, BackendResult, Command};
use tracing::{debug, warn};

use crate::resp::{encode, read_response, RespValue};

/// Pool configuration for one backend address.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Connections kept parked while unused.
    pub max_idle: usize,
    /// Upper bound on open connections, parked or checked out.
    pub max_total: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            addr: "127.0.0.1:6379".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

#[derive(Default)]
struct Slots {
    parked: VecDeque<RespStream>,
    open: usize,
}

enum Checkout {
    Parked(RespStream),
    Reserved,
    Full,
}

struct Shared {
    config: PoolConfig,
    slots: Mutex<Slots>,
}

impl Shared {
    fn checkout(&self) -> Checkout {
        let mut slots = self.slots.lock();
        if let Some(stream) = slots.parked.pop_front() {
            return Checkout::Parked(stream);
        }
        if slots.open >= self.config.max_total {
            return Checkout::Full;
        }
        slots.open += 1;
        Checkout::Reserved
    }

    fn open_stream(&self) -> BackendResult<RespStream> {
        match self.checkout() {
            Checkout::Parked(stream) => Ok(stream),
            Checkout::Full => Err(BackendError::PoolExhausted),
            Checkout::Reserved => match RespStream::open(&self.config) {
                Ok(stream) => {
                    debug!(addr = %self.config.addr, "opened backend connection");
                    Ok(stream)
                }
                Err(err) => {
                    self.release(None);
                    Err(err)
                }
            },
        }
    }

    fn release(&self, stream: Option<RespStream>) {
        let mut slots = self.slots.lock();
        match stream {
            Some(stream) if slots.parked.len() < self.config.max_idle => slots.parked.push_back(stream),
            _ => slots.open = slots.open.saturating_sub(1),
        }
    }
}

/// Cloneable handle on one address's connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.shared.config.addr)
            .field("open", &self.open_connections())
            .finish()
    }
}

impl ConnectionPool {
    /// Pool for `addr` with default limits.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::new(PoolConfig {
            addr: addr.into(),
            ..PoolConfig::default()
        })
    }

    /// Creates a pool. Sockets are opened lazily by `acquire`.
    pub fn new(config: PoolConfig) -> Self {
        ConnectionPool {
            shared: Arc::new(Shared {
                config,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.shared.config.addr
    }

    /// Open connections, parked or checked out.
    pub fn open_connections(&self) -> usize {
        self.shared.slots.lock().open
    }

    /// Connections currently parked.
    pub fn idle_connections(&self) -> usize {
        self.shared.slots.lock().parked.len()
    }

    /// Checks out a connection, opening one if none is parked.
    ///
    /// # Errors
    /// `PoolExhausted` at `max_total`, `InvalidAddress` for an unparsable
    /// address, `Io` when the connect fails.
    pub fn acquire(&self) -> BackendResult<PooledConnection> {
        let stream = self.shared.open_stream()?;
        Ok(PooledConnection {
            shared: Arc::clone(&self.shared),
            stream: Some(stream),
        })
    }
}

/// Checked-out connection; goes back to its pool on drop.
///
/// A failed round trip leaves unread replies behind, so the socket is closed
/// at once and the next `exec` checks out a replacement.
pub struct PooledConnection {
    shared: Arc<Shared>,
    stream: Option<RespStream>,
}

impl PooledConnection {
    /// Writes every command in one buffer, then reads one reply per command.
    pub fn exec(&mut self, commands: &[Command]) -> BackendResult<Vec<RespValue>> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.shared.open_stream()?,
        };
        let replies = stream.round_trip(commands);
        if replies.is_ok() {
            self.stream = Some(stream);
        } else {
            warn!(addr = %self.shared.config.addr, "discarding broken backend connection");
            drop(stream);
            self.shared.release(None);
        }
        replies
    }

    /// Returns false after a failed round trip until the next `exec`
    /// reconnects.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.shared.release(Some(stream));
        }
    }
}

/// One socket plus its reusable framing buffers.
struct RespStream {
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    out: Vec<u8>,
}

impl RespStream {
    fn open(config: &PoolConfig) -> BackendResult<Self> {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|_| BackendError::InvalidAddress(config.addr.clone()))?;
        let socket = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        socket.set_read_timeout(config.read_timeout)?;
        socket.set_write_timeout(config.write_timeout)?;
        // Small request frames; Nagle would only add latency.
        socket.set_nodelay(true)?;

        Ok(RespStream {
            reader: BufReader::new(socket),
            line_buf: Vec::with_capacity(128),
            out: Vec::with_capacity(256),
        })
    }

    fn round_trip(&mut self, commands: &[Command]) -> BackendResult<Vec<RespValue>> {
        self.out.clear();
        for command in commands {
            encode(command, &mut self.out);
        }
        let socket = self.reader.get_mut();
        socket.write_all(&self.out)?;
        socket.flush()?;

        commands
            .iter()
            .map(|_| read_response(&mut self.reader, &mut self.line_buf))
            .collect()
    }
}
