//! The pool controller task
//!
//! All pool state lives in one task; handles communicate with it over
//! channels and every mutation happens here, which makes the per-server
//! accounting invariant (`outstanding = allocating + checked-out + idle ≤
//! cap`) a local property of this file.
//!
//! Event sources, mirrored by the `select!` in [`Controller::run`]:
//! - `Get` / `Put` / `Close` commands from [`Pool`](super::Pool) handles
//! - allocation results from connection attempts spawned by `Get`
//! - a periodic tick that purges idle connections past their expiry
//!
//! A waiter that went away (request cancelled) is detected when its oneshot
//! reply channel refuses the send; the connection involved is re-idled
//! rather than leaked.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Command, PooledConn};
use crate::config::ServerConfig;
use crate::nntp::{NntpConnection, NntpError};

/// How often the idle purge runs
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub(super) type Waiter = oneshot::Sender<Result<PooledConn, NntpError>>;

struct IdleConn {
    conn: PooledConn,
    since: Instant,
}

struct AllocResult {
    server: usize,
    reply: Waiter,
    result: Result<NntpConnection, NntpError>,
}

pub(super) struct Controller {
    servers: Arc<Vec<ServerConfig>>,
    idle_expiry: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    alloc_tx: mpsc::UnboundedSender<AllocResult>,
    alloc_rx: mpsc::UnboundedReceiver<AllocResult>,
    /// allocating + checked-out + idle, per server
    outstanding: Vec<u32>,
    /// FIFO idle lists, ordered by release time
    idle: Vec<VecDeque<IdleConn>>,
    /// FIFO waiter queues, one per server
    waiters: Vec<VecDeque<Waiter>>,
    next_id: u64,
}

impl Controller {
    pub(super) fn new(
        servers: Arc<Vec<ServerConfig>>,
        idle_expiry: Duration,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let n = servers.len();
        let (alloc_tx, alloc_rx) = mpsc::unbounded_channel();
        Self {
            servers,
            idle_expiry,
            cmd_rx,
            alloc_tx,
            alloc_rx,
            outstanding: vec![0; n],
            idle: (0..n).map(|_| VecDeque::new()).collect(),
            waiters: (0..n).map(|_| VecDeque::new()).collect(),
            next_id: 0,
        }
    }

    pub(super) async fn run(mut self) {
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it
        purge.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // Every Pool handle dropped: shut down
                    None => break,
                },
                Some(result) = self.alloc_rx.recv() => self.handle_alloc(result),
                _ = purge.tick() => self.purge_idle(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Get { server, reply } => {
                if let Some(reply) = self.try_serve(server, reply) {
                    // At capacity with no idle entry: park the waiter
                    self.waiters[server].push_back(reply);
                }
            }
            Command::Put { conn } => self.handle_put(conn),
            Command::Close { server } => {
                self.outstanding[server] -= 1;
                debug!(
                    host = %self.servers[server].host,
                    outstanding = self.outstanding[server],
                    "connection closed"
                );
                self.drive_queue(server);
            }
        }
    }

    /// Serve a `Get` from the idle list or a fresh allocation. Returns the
    /// reply sender back when the server is saturated.
    fn try_serve(&mut self, server: usize, reply: Waiter) -> Option<Waiter> {
        if let Some(idle) = self.idle[server].pop_front() {
            debug!(
                host = %self.servers[server].host,
                outstanding = self.outstanding[server],
                "connection reassigned"
            );
            if let Err(Ok(conn)) = reply.send(Ok(idle.conn)) {
                // Waiter cancelled between send and park: keep the entry,
                // its release timestamp still orders the idle list
                self.idle[server].push_front(IdleConn {
                    conn,
                    since: idle.since,
                });
            }
            return None;
        }

        if self.outstanding[server] < self.servers[server].connections {
            self.outstanding[server] += 1;
            let def = self.servers[server].clone();
            let alloc_tx = self.alloc_tx.clone();
            tokio::spawn(async move {
                let result = NntpConnection::connect(&def).await;
                let _ = alloc_tx.send(AllocResult {
                    server,
                    reply,
                    result,
                });
            });
            return None;
        }

        Some(reply)
    }

    fn handle_put(&mut self, conn: PooledConn) {
        let server = conn.server_index();
        let mut conn = conn;
        while let Some(waiter) = self.waiters[server].pop_front() {
            match waiter.send(Ok(conn)) {
                Ok(()) => {
                    debug!(
                        host = %self.servers[server].host,
                        outstanding = self.outstanding[server],
                        "connection recycled"
                    );
                    return;
                }
                // Cancelled waiter: try the next one
                Err(Ok(returned)) => conn = returned,
                Err(Err(_)) => unreachable!("put sends Ok"),
            }
        }
        debug!(
            host = %self.servers[server].host,
            outstanding = self.outstanding[server],
            "connection idled"
        );
        self.idle[server].push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
    }

    fn handle_alloc(&mut self, result: AllocResult) {
        let AllocResult {
            server,
            reply,
            result,
        } = result;
        match result {
            Ok(conn) => {
                self.next_id += 1;
                let pooled = PooledConn::new(conn, server, self.next_id);
                debug!(
                    host = %self.servers[server].host,
                    outstanding = self.outstanding[server],
                    "new connection"
                );
                if let Err(Ok(conn)) = reply.send(Ok(pooled)) {
                    // The requester gave up while we were dialing; the
                    // session is healthy, so recycle it
                    self.handle_put(conn);
                }
            }
            Err(err) => {
                warn!(
                    host = %self.servers[server].host,
                    error = %err,
                    "connection allocation failed"
                );
                let _ = reply.send(Err(err));
                self.outstanding[server] -= 1;
                self.drive_queue(server);
            }
        }
    }

    /// Re-drive queued waiters after a slot opened up
    fn drive_queue(&mut self, server: usize) {
        while let Some(waiter) = self.waiters[server].pop_front() {
            if let Some(waiter) = self.try_serve(server, waiter) {
                self.waiters[server].push_front(waiter);
                break;
            }
        }
    }

    fn purge_idle(&mut self) {
        for server in 0..self.servers.len() {
            let mut purged = 0;
            while let Some(front) = self.idle[server].front() {
                if front.since.elapsed() < self.idle_expiry {
                    break;
                }
                let idle = self.idle[server].pop_front().expect("front exists");
                self.outstanding[server] -= 1;
                purged += 1;
                tokio::spawn(async move {
                    let mut conn = idle.conn.into_inner();
                    conn.quit().await;
                });
            }
            if purged > 0 {
                debug!(
                    host = %self.servers[server].host,
                    purged,
                    outstanding = self.outstanding[server],
                    "purged idle connections"
                );
                self.drive_queue(server);
            }
        }
    }
}
