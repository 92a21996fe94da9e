//! Bounded per-node connection recycling.
//!
//! Checked-out connections are wrapped in [`PooledConnection`], which holds the node and global
//! permits. Only an explicit [`PooledConnection::release`] puts a connection back; dropping it on
//! an error path or on task cancellation disconnects it instead, so a connection with a reply in
//! flight is never handed to another caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arcstr::ArcStr;
use log::{debug, trace, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cluster_handling::client::ClusterParams;
use crate::cluster_handling::slot_map::Node;
use crate::cmd::cmd;
use crate::connection::{Connect, ConnectionLike};
use crate::types::{RedisFuture, Value};
use crate::{ErrorKind, RedisError, RedisResult};

struct NodeConnections<C> {
    idle: Vec<C>,
    permits: Arc<Semaphore>,
}

struct PoolState<C> {
    pid: u32,
    nodes: HashMap<ArcStr, NodeConnections<C>>,
    global: Arc<Semaphore>,
}

struct PoolInner<C> {
    state: Mutex<PoolState<C>>,
    generation: AtomicU64,
    params: ClusterParams,
}

/// Idle connections per node, capped per node and in total.
pub(crate) struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

fn pool_exhausted(node: &str, which: &'static str) -> RedisError {
    RedisError::from((
        ErrorKind::PoolExhausted,
        which,
        node.to_string(),
    ))
}

impl<C> ConnectionPool<C>
where
    C: Connect,
{
    pub(crate) fn new(params: ClusterParams) -> Self {
        let state = PoolState {
            pid: std::process::id(),
            nodes: HashMap::new(),
            global: Arc::new(Semaphore::new(params.max_connections)),
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
                params,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns an idle connection to `node`, or opens a new one.
    ///
    /// Fails with `PoolExhausted` instead of waiting when a cap is reached.
    pub(crate) async fn get_connection(&self, node: &Node) -> RedisResult<PooledConnection<C>> {
        let name = node.name().clone();
        let (node_permit, global_permit, idle, pid) = {
            let mut state = self.lock();
            self.check_pid(&mut state);
            let per_node = self.inner.params.max_connections_per_node;
            let node_permits = state
                .nodes
                .entry(name.clone())
                .or_insert_with(|| NodeConnections {
                    idle: Vec::new(),
                    permits: Arc::new(Semaphore::new(per_node)),
                })
                .permits
                .clone();
            let node_permit = node_permits
                .try_acquire_owned()
                .map_err(|_| pool_exhausted(&name, "Too many connections to node"))?;
            let global_permit = state
                .global
                .clone()
                .try_acquire_owned()
                .map_err(|_| pool_exhausted(&name, "Too many connections"))?;

            let mut idle = None;
            if let Some(connections) = state.nodes.get_mut(&name) {
                while let Some(mut conn) = connections.idle.pop() {
                    if conn.is_open() {
                        idle = Some(conn);
                        break;
                    }
                    conn.disconnect();
                }
            }
            (node_permit, global_permit, idle, state.pid)
        };
        let generation = self.inner.generation.load(Ordering::Acquire);

        let conn = match idle {
            Some(conn) => {
                trace!("reusing connection to {name}");
                conn
            }
            None => self.open(&name).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            node: name,
            pool: self.clone(),
            generation,
            pid,
            _node_permit: node_permit,
            _global_permit: global_permit,
        })
    }

    async fn open(&self, name: &ArcStr) -> RedisResult<C> {
        let params = &self.inner.params;
        debug!("connecting to {name}");
        let mut conn = C::connect(name, params.connection_timeout, params.response_timeout).await?;
        if params.read_from_replicas {
            let reply = conn
                .req_packed_command(&cmd("READONLY").get_packed_command())
                .await
                .and_then(Value::extract_error);
            if let Err(err) = reply {
                conn.disconnect();
                return Err(err);
            }
        }
        Ok(conn)
    }

    // Connections must not be shared with a forked child.
    fn check_pid(&self, state: &mut PoolState<C>) {
        let pid = std::process::id();
        if state.pid == pid {
            return;
        }
        warn!("process id changed from {} to {pid}, discarding pooled connections", state.pid);
        state.nodes.clear();
        state.global = Arc::new(Semaphore::new(self.inner.params.max_connections));
        state.pid = pid;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns a connection to its node's idle set.
    pub(crate) fn release(&self, conn: PooledConnection<C>) {
        conn.release();
    }

    fn put_back(&self, node: &ArcStr, mut conn: C, generation: u64, pid: u32) {
        let mut state = self.lock();
        let current = self.inner.generation.load(Ordering::Acquire);
        if !conn.is_open() || generation != current || pid != state.pid {
            conn.disconnect();
            return;
        }
        match state.nodes.get_mut(node) {
            Some(connections) => connections.idle.push(conn),
            None => conn.disconnect(),
        }
    }

    /// Disconnects every idle connection. Connections that are checked out are disconnected
    /// instead of being returned.
    pub(crate) fn disconnect_all(&self) {
        let mut state = self.lock();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        for connections in state.nodes.values_mut() {
            for mut conn in connections.idle.drain(..) {
                conn.disconnect();
            }
        }
        debug!("disconnected every pooled connection");
    }

    /// Number of idle connections kept for the node named `name`.
    pub(crate) fn idle_count(&self, name: &str) -> usize {
        self.lock()
            .nodes
            .get(name)
            .map_or(0, |connections| connections.idle.len())
    }

    #[cfg(test)]
    pub(crate) fn set_recorded_pid(&self, pid: u32) {
        self.lock().pid = pid;
    }
}

/// A connection checked out of the pool.
pub(crate) struct PooledConnection<C: Connect> {
    conn: Option<C>,
    node: ArcStr,
    pool: ConnectionPool<C>,
    generation: u64,
    pid: u32,
    _node_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl<C: Connect> PooledConnection<C> {
    /// Name of the node this connection is bound to.
    pub(crate) fn node(&self) -> &ArcStr {
        &self.node
    }

    /// Puts the connection back into the idle set of its node.
    pub(crate) fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .put_back(&self.node, conn, self.generation, self.pid);
        }
    }
}

impl<C: Connect> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            trace!("dropping connection to {} without release", self.node);
            conn.disconnect();
        }
    }
}

fn closed() -> RedisError {
    RedisError::from(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "connection was released",
    ))
}

impl<C: Connect> ConnectionLike for PooledConnection<C> {
    fn send_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, ()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_packed_command(cmd),
            None => Box::pin(async { Err(closed()) }),
        }
    }

    fn recv_response(&mut self) -> RedisFuture<'_, Value> {
        match self.conn.as_mut() {
            Some(conn) => conn.recv_response(),
            None => Box::pin(async { Err(closed()) }),
        }
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.disconnect();
        }
    }

    fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.is_open())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::cluster_handling::slot_map::NodeRole;

    static CONNECTS: AtomicUsize = AtomicUsize::new(0);

    struct FakeConnection {
        open: bool,
        sent: Vec<Vec<u8>>,
    }

    impl ConnectionLike for FakeConnection {
        fn send_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, ()> {
            self.sent.push(cmd.to_vec());
            Box::pin(async { Ok(()) })
        }

        fn recv_response(&mut self) -> RedisFuture<'_, Value> {
            Box::pin(async { Ok(Value::Okay) })
        }

        fn disconnect(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    impl Connect for FakeConnection {
        fn connect<'a>(
            _addr: &'a str,
            _connection_timeout: Duration,
            _response_timeout: Duration,
        ) -> RedisFuture<'a, Self> {
            CONNECTS.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(FakeConnection {
                    open: true,
                    sent: Vec::new(),
                })
            })
        }
    }

    fn params(per_node: usize, total: usize) -> ClusterParams {
        ClusterParams {
            max_connections_per_node: per_node,
            max_connections: total,
            ..Default::default()
        }
    }

    fn node(port: u16) -> Node {
        Node::new("pool-test", port, NodeRole::Master)
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn released_connections_are_reused() {
        block_on(async {
            let pool = ConnectionPool::<FakeConnection>::new(params(2, 4));
            let conn = pool.get_connection(&node(1)).await.unwrap();
            assert_eq!(conn.node().as_str(), "pool-test:1");
            pool.release(conn);
            assert_eq!(pool.idle_count("pool-test:1"), 1);

            let conn = pool.get_connection(&node(1)).await.unwrap();
            assert_eq!(pool.idle_count("pool-test:1"), 0);
            assert!(conn.is_open());
            conn.release();
            assert_eq!(pool.idle_count("pool-test:1"), 1);
        });
    }

    #[test]
    fn dropped_connections_are_not_returned() {
        block_on(async {
            let pool = ConnectionPool::<FakeConnection>::new(params(1, 4));
            let conn = pool.get_connection(&node(2)).await.unwrap();
            drop(conn);
            assert_eq!(pool.idle_count("pool-test:2"), 0);
            // The permit was freed with it.
            assert!(pool.get_connection(&node(2)).await.is_ok());
        });
    }

    #[test]
    fn caps_fail_fast() {
        block_on(async {
            let pool = ConnectionPool::<FakeConnection>::new(params(1, 2));
            let _a = pool.get_connection(&node(3)).await.unwrap();
            let err = pool.get_connection(&node(3)).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::PoolExhausted);

            let _b = pool.get_connection(&node(4)).await.unwrap();
            let err = pool.get_connection(&node(5)).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        });
    }

    #[test]
    fn disconnect_all_invalidates_checked_out_connections() {
        block_on(async {
            let pool = ConnectionPool::<FakeConnection>::new(params(4, 8));
            let idle = pool.get_connection(&node(6)).await.unwrap();
            let busy = pool.get_connection(&node(6)).await.unwrap();
            idle.release();
            assert_eq!(pool.idle_count("pool-test:6"), 1);

            pool.disconnect_all();
            assert_eq!(pool.idle_count("pool-test:6"), 0);
            busy.release();
            assert_eq!(pool.idle_count("pool-test:6"), 0);
        });
    }

    #[test]
    fn a_changed_process_id_empties_the_pool() {
        block_on(async {
            let pool = ConnectionPool::<FakeConnection>::new(params(4, 8));
            let before = pool.get_connection(&node(7)).await.unwrap();
            let held = pool.get_connection(&node(7)).await.unwrap();
            before.release();
            assert_eq!(pool.idle_count("pool-test:7"), 1);

            pool.set_recorded_pid(std::process::id().wrapping_add(1));
            let connects = CONNECTS.load(Ordering::SeqCst);
            let fresh = pool.get_connection(&node(7)).await.unwrap();
            assert!(CONNECTS.load(Ordering::SeqCst) > connects);
            assert_eq!(pool.idle_count("pool-test:7"), 0);

            // Connections from before the fork are not taken back.
            held.release();
            assert_eq!(pool.idle_count("pool-test:7"), 0);
            fresh.release();
            assert_eq!(pool.idle_count("pool-test:7"), 1);
        });
    }

    #[test]
    fn readonly_is_sent_to_new_connections() {
        block_on(async {
            let mut params = params(4, 8);
            params.read_from_replicas = true;
            let pool = ConnectionPool::<FakeConnection>::new(params);
            let conn = pool.get_connection(&node(8)).await.unwrap();
            let sent = &conn.conn.as_ref().unwrap().sent;
            assert_eq!(sent.len(), 1);
            assert!(sent[0].ends_with(b"READONLY\r\n"));
        });
    }
}
