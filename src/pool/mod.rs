//! Multi-server NNTP connection pool
//!
//! Per upstream server the pool maintains a bounded set of authenticated
//! sessions with idle expiry, FIFO waiter queues and lazy allocation. A
//! single controller task owns every piece of state (see [`controller`]);
//! handlers hold a transient [`PooledConn`] borrow for one command sequence
//! and hand it back through [`Pool::put`] (session still healthy) or
//! [`Pool::close`] (session must be discarded). The pool never probes
//! returned connections; staleness surfaces on next use and the dispatcher
//! decides the disposition.

mod buffer;
mod controller;

pub use buffer::{BufferPool, PooledBuffer};

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::nntp::{NntpConnection, NntpError};

/// Errors surfaced by [`Pool::get`]
#[derive(Debug, Error)]
pub enum PoolError {
    /// Allocating a fresh connection to the upstream failed
    #[error("connection allocation failed: {0}")]
    Connect(#[source] NntpError),

    /// The controller task is gone (process shutting down)
    #[error("connection pool is shut down")]
    Shutdown,
}

enum Command {
    Get {
        server: usize,
        reply: controller::Waiter,
    },
    Put {
        conn: PooledConn,
    },
    Close {
        server: usize,
    },
}

/// One pooled NNTP session, checked out of the pool
///
/// Derefs to [`NntpConnection`] for issuing commands. Must be returned via
/// [`Pool::put`] or [`Pool::close`]; dropping it without either leaks the
/// server slot until process exit, so the handlers never do that.
pub struct PooledConn {
    conn: NntpConnection,
    server: usize,
    #[allow(dead_code)]
    id: u64,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("server", &self.server)
            .field("id", &self.id)
            .finish()
    }
}

impl PooledConn {
    pub(crate) fn new(conn: NntpConnection, server: usize, id: u64) -> Self {
        Self { conn, server, id }
    }

    /// Index of the server definition this session is bound to
    #[must_use]
    #[inline]
    pub fn server_index(&self) -> usize {
        self.server
    }

    pub(crate) fn into_inner(self) -> NntpConnection {
        self.conn
    }
}

impl Deref for PooledConn {
    type Target = NntpConnection;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Handle to the pool controller; cheap to clone
#[derive(Clone)]
pub struct Pool {
    cmd_tx: mpsc::UnboundedSender<Command>,
    servers: Arc<Vec<ServerConfig>>,
}

impl Pool {
    /// Start the controller task over the given server definitions
    #[must_use]
    pub fn new(servers: Vec<ServerConfig>, idle_expiry: Duration) -> Self {
        let servers = Arc::new(servers);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = controller::Controller::new(Arc::clone(&servers), idle_expiry, cmd_rx);
        tokio::spawn(ctrl.run());
        Self { cmd_tx, servers }
    }

    /// The server definitions this pool serves
    #[must_use]
    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    /// Acquire a connection to server `server`.
    ///
    /// Pops an idle session when one exists, allocates while under the
    /// server's cap, otherwise parks until a session is released. Dropping
    /// the future withdraws the request; the controller notices the dead
    /// reply channel and recycles whatever it was about to hand over.
    pub async fn get(&self, server: usize) -> Result<PooledConn, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get { server, reply })
            .map_err(|_| PoolError::Shutdown)?;
        match rx.await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(PoolError::Connect(err)),
            Err(_) => Err(PoolError::Shutdown),
        }
    }

    /// Return a healthy connection for reuse
    pub fn put(&self, conn: PooledConn) {
        let _ = self.cmd_tx.send(Command::Put { conn });
    }

    /// Discard a connection; its socket closes here and the server slot is
    /// freed
    pub fn close(&self, conn: PooledConn) {
        let server = conn.server_index();
        drop(conn);
        let _ = self.cmd_tx.send(Command::Close { server });
    }
}
