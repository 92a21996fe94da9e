//! An async cluster connection.
//!
//! Commands are routed by slot to the owning node, redirected on `MOVED`/`ASK` and retried on
//! transient failures within a bounded number of attempts. The node registry and the connection
//! pool are shared by every clone of a [`ClusterConnection`], so many tasks can dispatch through
//! the same topology concurrently.
//!
//! # Example
//! ```rust,no_run
//! use redis_cluster::{cluster::ClusterClient, cmd};
//!
//! async fn fetch_an_integer() -> redis_cluster::RedisResult<redis_cluster::Value> {
//!     let nodes = vec!["redis://127.0.0.1:7000"];
//!     let client = ClusterClient::new(nodes)?;
//!     let connection = client.get_connection().await?;
//!     connection
//!         .execute_command(cmd("SET").arg("test").arg("test_data"))
//!         .await?;
//!     connection.execute_command(&cmd("GET").arg("test").clone()).await
//! }
//! ```

pub(crate) mod request;

use std::sync::Arc;

use arcstr::ArcStr;
use futures_util::future::join_all;
use log::{debug, trace, warn};
use rand::{rng, seq::IndexedRandom};
use tokio::sync::Mutex;

use self::request::{
    choose_response, Next, PollFlushAction, Response, Retry, RetryParams, RetryState,
};
use crate::cluster_handling::client::{ClusterParams, RefreshPolicy};
use crate::cluster_handling::pool::ConnectionPool;
use crate::cluster_handling::routing::{
    aggregate, all_equal_result, checked_command, combine_array_results, logical_aggregate,
    MultipleNodeRoutingInfo, Redirect, ResponsePolicy, RoutingInfo, SingleNodeRoutingInfo,
};
use crate::cluster_handling::slot_map::{Node, NodeRegistry, NodeRole};
use crate::cluster_handling::{asking_cmd, topology};
use crate::cmd::Cmd;
use crate::connection::{split_node_address, Connect, ConnectionLike, TcpConnection};
use crate::{ErrorKind, RedisError, RedisResult, Value};

struct Core<C> {
    registry: Arc<NodeRegistry>,
    pool: ConnectionPool<C>,
    // Serializes lazy refreshes so concurrent callers reuse one discovery.
    refresh_lock: Mutex<()>,
    params: ClusterParams,
    retry_params: RetryParams,
}

/// A connection to a Redis cluster. Cloning it is cheap and shares the topology and the pool.
pub struct ClusterConnection<C = TcpConnection> {
    core: Arc<Core<C>>,
}

impl<C> Clone for ClusterConnection<C> {
    fn clone(&self) -> Self {
        ClusterConnection {
            core: self.core.clone(),
        }
    }
}

impl<C> ClusterConnection<C>
where
    C: Connect,
{
    pub(crate) async fn new(initial_nodes: Vec<Node>, params: ClusterParams) -> RedisResult<Self> {
        let registry = Arc::new(NodeRegistry::new(
            initial_nodes,
            params.reinitialize_steps,
            params.read_from_replicas,
        ));
        let connection = ClusterConnection {
            core: Arc::new(Core {
                registry,
                pool: ConnectionPool::new(params.clone()),
                refresh_lock: Mutex::new(()),
                retry_params: RetryParams::from(&params),
                params,
            }),
        };
        connection.refresh_slots().await?;
        Ok(connection)
    }

    /// Sends a command to the node(s) its routing selects and returns the reply.
    ///
    /// Blocked commands, cross-slot commands and key-based commands without a key fail before
    /// anything is sent.
    pub async fn execute_command(&self, cmd: &Cmd) -> RedisResult<Value> {
        let routing = RoutingInfo::for_routable(cmd)?;
        self.route_command(cmd, routing).await
    }

    /// Sends a command using the given routing instead of the one derived from the command.
    pub async fn route_command(&self, cmd: &Cmd, routing: RoutingInfo) -> RedisResult<Value> {
        checked_command(cmd)?;
        self.refresh_if_needed().await?;
        match routing {
            RoutingInfo::SingleNode(route) => {
                let packed = cmd.get_packed_command();
                let response = self.request(&packed, 1, &route).await?;
                single_value(response)
            }
            RoutingInfo::MultiNode((target, policy)) => self.broadcast(cmd, target, policy).await,
        }
    }

    /// Rediscovers the topology from the startup nodes (or the known nodes, when following the
    /// cluster).
    pub async fn refresh_slots(&self) -> RedisResult<()> {
        topology::initialize::<C>(&self.core.registry, &self.core.params).await
    }

    /// Drops every pooled connection and forgets the topology. The next command rediscovers it.
    pub fn reset(&self) {
        self.core.pool.disconnect_all();
        self.core.registry.reset();
    }

    /// The node registry shared by this connection and its clones.
    pub fn registry(&self) -> &NodeRegistry {
        &self.core.registry
    }

    /// Number of idle pooled connections to the node named `host:port`.
    pub fn idle_connections(&self, node: &str) -> usize {
        self.core.pool.idle_count(node)
    }

    pub(crate) fn params(&self) -> &ClusterParams {
        &self.core.params
    }

    /// Runs a pending refresh. Only one concurrent caller performs it, the others wait for it and
    /// use the table it installed.
    pub(crate) async fn refresh_if_needed(&self) -> RedisResult<()> {
        let registry = &self.core.registry;
        if registry.is_initialized() && !registry.is_refresh_pending() {
            return Ok(());
        }
        let _guard = self.core.refresh_lock.lock().await;
        if !registry.is_initialized() || registry.take_refresh_pending() {
            debug!("refreshing cluster topology");
            if let Err(err) = self.refresh_slots().await {
                registry.flag_refresh();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resolves a single node routing against the registry.
    pub(crate) fn resolve(&self, route: &SingleNodeRoutingInfo) -> RedisResult<Node> {
        let registry = &self.core.registry;
        match route {
            SingleNodeRoutingInfo::Random => registry.random_node(),
            SingleNodeRoutingInfo::RandomPrimary => registry
                .all_masters()
                .choose(&mut rng())
                .cloned()
                .ok_or_else(|| {
                    RedisError::from((ErrorKind::ClusterUnreachable, "No known master nodes"))
                }),
            SingleNodeRoutingInfo::SpecificNode(route) => registry.node_for_route(route),
            SingleNodeRoutingInfo::ByAddress { host, port } => {
                Ok(Node::new(host, *port, NodeRole::Master))
            }
        }
    }

    fn target(&self, route: &SingleNodeRoutingInfo, state: &mut RetryState) -> RedisResult<Node> {
        state.asking = false;
        if let Some(redirect) = state.redirect.take() {
            let addr = match redirect {
                Redirect::Moved(addr) => addr,
                Redirect::Ask(addr) => {
                    state.asking = true;
                    addr
                }
            };
            return Node::from_addr(&addr);
        }
        if state.try_random_node {
            state.try_random_node = false;
            return self.core.registry.random_node();
        }
        self.resolve(route)
    }

    /// Writes `count` packed commands to `node` in one go and reads their replies. With `asking`
    /// an `ASKING` command is written in front of them and its reply dropped.
    pub(crate) async fn send_batch(
        &self,
        node: &Node,
        packed: &[u8],
        count: usize,
        asking: bool,
    ) -> RedisResult<Vec<Value>> {
        let mut conn = self.core.pool.get_connection(node).await?;
        trace!("sending {count} command(s) to {}", conn.node());
        let replies = if asking {
            let mut buffer = asking_cmd().get_packed_command();
            buffer.extend_from_slice(packed);
            let mut replies = conn.req_packed_commands(&buffer, count + 1).await?;
            replies.remove(0);
            replies
        } else {
            conn.req_packed_commands(packed, count).await?
        };
        self.core.pool.release(conn);
        Ok(replies)
    }

    /// Runs the retry loop for `count` packed commands that must all go to the same node.
    pub(crate) async fn request(
        &self,
        packed: &[u8],
        count: usize,
        route: &SingleNodeRoutingInfo,
    ) -> RedisResult<Response> {
        let mut state = RetryState::new(self.core.retry_params.request_ttl);
        let mut last_error = None;
        while state.start_attempt() {
            let result = match self.target(route, &mut state) {
                Ok(node) => self
                    .send_batch(&node, packed, count, state.asking)
                    .await
                    .map(|mut replies| match (count, replies.pop()) {
                        (1, Some(reply)) => Response::Single(reply),
                        (_, last) => {
                            replies.extend(last);
                            Response::Multiple(replies)
                        }
                    }),
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                last_error = Some(err.clone_mostly());
            }

            let (next, action) = choose_response(result, &mut state, &self.core.retry_params);
            self.apply(action).await?;
            match next {
                Next::Done(result) => return result,
                Next::Retry(Retry::Immediately) => {}
                Next::Retry(Retry::AfterSleep { sleep_duration }) => {
                    trace!("retrying after {sleep_duration:?}");
                    tokio::time::sleep(sleep_duration).await;
                }
            }
        }
        Err(match last_error {
            Some(err) => request::ttl_exhausted(&err),
            None => RedisError::from((ErrorKind::TTLExhausted, "Too many cluster redirections")),
        })
    }

    async fn apply(&self, action: PollFlushAction) -> RedisResult<()> {
        match action {
            PollFlushAction::None => Ok(()),
            PollFlushAction::Reconnect => {
                trace!("dropped a broken connection");
                Ok(())
            }
            PollFlushAction::PatchSlot { slot, node } => self.patch_moved_slot(slot, &node).await,
            PollFlushAction::ReconnectFromInitialConnections => {
                warn!("cluster is down, dropping connections and topology");
                self.reset();
                Ok(())
            }
        }
    }

    /// Records a `MOVED` redirect: the slot is patched right away and a full refresh is
    /// scheduled. The refresh runs immediately when the redirect counter crosses a step or the
    /// policy is inline.
    pub(crate) async fn patch_moved_slot(&self, slot: u16, addr: &ArcStr) -> RedisResult<()> {
        let registry = &self.core.registry;
        registry.flag_refresh();
        let (host, port) = split_node_address(addr)?;
        let node = registry.set_node(host, port, NodeRole::Master);
        debug!("slot {slot} moved to {node}");
        registry.patch_slot_owner(slot, node);
        let due = registry.increment_reinitialize_counter(1);
        if due || self.core.params.refresh_policy == RefreshPolicy::Inline {
            let _guard = self.core.refresh_lock.lock().await;
            if registry.take_refresh_pending() {
                debug!("refreshing cluster topology after redirects");
                self.refresh_slots().await?;
            }
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        cmd: &Cmd,
        target: MultipleNodeRoutingInfo,
        policy: Option<ResponsePolicy>,
    ) -> RedisResult<Value> {
        let registry = &self.core.registry;
        let nodes = match target {
            MultipleNodeRoutingInfo::AllMasters => registry.all_masters(),
            MultipleNodeRoutingInfo::AllNodes => registry.all_nodes(),
        };
        let packed = cmd.get_packed_command();
        let is_shutdown = cmd
            .arg_idx(0)
            .is_some_and(|name| name.eq_ignore_ascii_case(b"SHUTDOWN"));

        let results = join_all(nodes.iter().map(|node| {
            let packed = &packed;
            async move {
                let result = self.broadcast_to_node(node, packed, is_shutdown).await;
                (node.name().clone(), result)
            }
        }))
        .await;
        aggregate_results(results, policy)
    }

    // Each node gets one more try after a broken connection.
    async fn broadcast_to_node(
        &self,
        node: &Node,
        packed: &[u8],
        is_shutdown: bool,
    ) -> RedisResult<Value> {
        let result = match self.send_batch(node, packed, 1, false).await {
            Err(err) if err.is_io_error() => {
                if is_shutdown {
                    return Ok(Value::Okay);
                }
                warn!("{node} failed ({err}), retrying once");
                self.send_batch(node, packed, 1, false).await
            }
            result => result,
        };
        result.map(|mut replies| replies.pop().unwrap_or(Value::Nil))
    }
}

fn single_value(response: Response) -> RedisResult<Value> {
    match response {
        Response::Single(value) => Ok(value),
        Response::Multiple(values) => Ok(Value::Array(values)),
    }
}

/// Merges the per-node replies of a broadcast.
fn aggregate_results(
    results: Vec<(ArcStr, RedisResult<Value>)>,
    response_policy: Option<ResponsePolicy>,
) -> RedisResult<Value> {
    if results.is_empty() {
        return Err((
            ErrorKind::ClusterUnreachable,
            "No nodes found for multi-node operation",
        )
            .into());
    }

    let all_values = |results: Vec<(ArcStr, RedisResult<Value>)>| {
        results
            .into_iter()
            .map(|(_, result)| result.and_then(Value::extract_error))
            .collect::<RedisResult<Vec<Value>>>()
    };

    match response_policy {
        Some(ResponsePolicy::AllSucceeded) => {
            Ok(all_values(results)?.into_iter().next().unwrap_or(Value::Nil))
        }
        Some(ResponsePolicy::OneSucceeded) => {
            let mut last_err = None;
            for (_, result) in results {
                match result.and_then(Value::extract_error) {
                    Ok(value) => return Ok(value),
                    Err(err) => last_err = Some(err),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                (ErrorKind::ClusterUnreachable, "Couldn't find any connection").into()
            }))
        }
        Some(ResponsePolicy::FirstSucceededNonEmptyOrAllEmpty) => {
            let num_results = results.len();
            let mut nil_counter = 0;
            let mut last_err = None;
            for (_, result) in results {
                match result.and_then(Value::extract_error) {
                    Ok(Value::Nil) => nil_counter += 1,
                    Ok(value) => return Ok(value),
                    Err(err) => last_err = Some(err),
                }
            }
            if nil_counter == num_results {
                Ok(Value::Nil)
            } else {
                Err(last_err.unwrap_or_else(|| {
                    (ErrorKind::ClusterUnreachable, "Couldn't find any connection").into()
                }))
            }
        }
        Some(ResponsePolicy::AllEqual) => all_equal_result(all_values(results)?),
        Some(ResponsePolicy::Aggregate(op)) => aggregate(all_values(results)?, op),
        Some(ResponsePolicy::AggregateLogical(op)) => logical_aggregate(all_values(results)?, op),
        Some(ResponsePolicy::CombineArrays) => combine_array_results(all_values(results)?),
        None => {
            // No coherent way to merge: hand every node's reply to the caller, errors in-band.
            let results = results
                .into_iter()
                .map(|(addr, result)| {
                    Ok::<_, RedisError>((Value::BulkString(addr.as_bytes().to_vec()), result?))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Map(results))
        }
    }
}
