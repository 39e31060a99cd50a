//! # Pooled Backend Client
//!
//! Purpose: Expose one pooled RESP2 connection through the backend contract.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `PooledClient` hides pooling and protocol details.
//! 2. **One Round Trip per Batch**: `execute_batch` writes every command in a
//!    single buffer and then reads the replies back in order.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.

use parking_lot::Mutex;
use skv_common::{BackendClient, BackendError, BackendManager, BackendResult, Command, Reply};

use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::interpret;

/// A connection borrowed from a `ConnectionPool`, returned to it on drop.
///
/// Calls are serialized on the connection mutex; the RESP stream carries one
/// conversation at a time.
pub struct PooledClient {
    addr: String,
    conn: Mutex<PooledConnection>,
}

impl PooledClient {
    /// Server address this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient").field("addr", &self.addr).finish()
    }
}

impl BackendClient for PooledClient {
    fn execute(&self, command: &Command) -> BackendResult<Reply> {
        let mut responses = self.conn.lock().exec(std::slice::from_ref(command))?;
        match responses.pop() {
            Some(value) => interpret(command, value),
            None => Err(BackendError::Protocol),
        }
    }

    fn execute_batch(&self, commands: &[Command]) -> BackendResult<Vec<BackendResult<Reply>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let responses = self.conn.lock().exec(commands)?;
        Ok(commands
            .iter()
            .zip(responses)
            .map(|(command, value)| interpret(command, value))
            .collect())
    }
}

impl BackendManager for ConnectionPool {
    type Client = PooledClient;

    fn get_client(&self) -> BackendResult<PooledClient> {
        let conn = self.acquire()?;
        Ok(PooledClient {
            addr: self.addr().to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn describe(&self) -> String {
        format!("resp://{}", self.addr())
    }
}
