use std::collections::HashMap;

use arcstr::ArcStr;
use futures_util::future::join_all;
use log::{debug, trace};

use crate::cluster_handling::async_connection::request::Response;
use crate::cluster_handling::async_connection::ClusterConnection;
use crate::cluster_handling::routing::{Route, RoutingInfo, SingleNodeRoutingInfo, SlotAddr};
use crate::cluster_handling::slot_map::Node;
use crate::cmd::{cmd, Cmd};
use crate::connection::Connect;
use crate::errors::RetryMethod;
use crate::types::ToRedisArgs;
use crate::{ErrorKind, RedisError, RedisResult, Value};

/// Represents a Redis Cluster command pipeline.
///
/// Commands are grouped by the node that serves them and each group is written to its node in a
/// single batch; the groups run concurrently. A pipeline is not atomic across nodes.
///
/// A pipeline switched to [`atomic`](ClusterPipeline::atomic) mode is sent as `MULTI ... EXEC`
/// and every command in it must be served by the same node.
///
/// Commands that are sent to several nodes (`KEYS`, `FLUSHALL`, ...) or that are not allowed in
/// a cluster at all cannot be used in a cluster pipeline.
#[derive(Clone, Default)]
pub struct ClusterPipeline {
    commands: Vec<Cmd>,
    transaction_mode: bool,
}

impl ClusterPipeline {
    /// Create an empty pipeline.
    pub fn new() -> ClusterPipeline {
        Self::with_capacity(0)
    }

    /// Creates an empty pipeline with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> ClusterPipeline {
        ClusterPipeline {
            commands: Vec::with_capacity(capacity),
            transaction_mode: false,
        }
    }

    /// Sends the pipeline as a `MULTI`/`EXEC` transaction.
    pub fn atomic(&mut self) -> &mut ClusterPipeline {
        self.transaction_mode = true;
        self
    }

    /// Starts a new command.
    pub fn cmd(&mut self, name: &str) -> &mut ClusterPipeline {
        self.add_command(cmd(name))
    }

    /// Adds an argument to the last started command.
    ///
    /// # Panics
    ///
    /// When no command was started yet.
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut ClusterPipeline {
        match self.commands.last_mut() {
            Some(cmd) => {
                cmd.arg(arg);
            }
            None => panic!("No command on stack"),
        }
        self
    }

    /// Adds an already built command.
    pub fn add_command(&mut self, cmd: Cmd) -> &mut ClusterPipeline {
        self.commands.push(cmd);
        self
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true when no command is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executes the pipeline and returns one result per command, in the order they were added.
    ///
    /// Error replies are returned in-band as `Err` entries. With `raise_on_error` the first of them
    /// is returned as the error of the whole call instead.
    ///
    /// ```rust,no_run
    /// # async fn run() -> redis_cluster::RedisResult<()> {
    /// # let client = redis_cluster::cluster::ClusterClient::new(vec!["redis://127.0.0.1:7000"])?;
    /// # let con = client.get_connection().await?;
    /// let results = redis_cluster::cluster::cluster_pipe()
    ///     .cmd("SET").arg("key_1").arg(42)
    ///     .cmd("GET").arg("key_1")
    ///     .exec(&con, false)
    ///     .await?;
    /// assert_eq!(results.len(), 2);
    /// # Ok(()) }
    /// ```
    pub async fn exec<C: Connect>(
        &self,
        con: &ClusterConnection<C>,
        raise_on_error: bool,
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        if self.commands.is_empty() {
            return Ok(vec![]);
        }

        let routes = self
            .commands
            .iter()
            .map(route_in_pipeline)
            .collect::<RedisResult<Vec<_>>>()?;
        con.refresh_if_needed().await?;

        let results = if self.transaction_mode {
            self.exec_transaction(con, &routes).await?
        } else {
            self.exec_batches(con, &routes).await?
        };

        if raise_on_error {
            return results.into_iter().map(|result| result.map(Ok)).collect();
        }
        Ok(results)
    }

    /// Executes the pipeline and fails on the first error reply.
    pub async fn query<C: Connect>(&self, con: &ClusterConnection<C>) -> RedisResult<Vec<Value>> {
        self.exec(con, true).await?.into_iter().collect()
    }

    async fn exec_transaction<C: Connect>(
        &self,
        con: &ClusterConnection<C>,
        routes: &[SingleNodeRoutingInfo],
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        // MULTI/EXEC is always served by the master, reads included.
        let mut target: Option<(Node, SingleNodeRoutingInfo)> = None;
        for route in routes {
            let route = match route {
                SingleNodeRoutingInfo::Random => continue,
                SingleNodeRoutingInfo::SpecificNode(route) => SingleNodeRoutingInfo::SpecificNode(
                    Route::new(route.slot(), SlotAddr::Master),
                ),
                other => other.clone(),
            };
            let node = con.resolve(&route)?;
            match &target {
                Some((first, _)) if first.name() != node.name() => {
                    fail!((
                        ErrorKind::CrossSlot,
                        "Transaction commands must be served by a single node",
                        format!("{first} and {node}")
                    ));
                }
                Some(_) => {}
                None => target = Some((node, route)),
            }
        }
        let route = match target {
            Some((_, route)) => route,
            None => SingleNodeRoutingInfo::RandomPrimary,
        };

        let mut packed = cmd("MULTI").get_packed_command();
        for command in &self.commands {
            command.write_packed_command(&mut packed);
        }
        cmd("EXEC").write_packed_command(&mut packed);

        let replies = match con.request(&packed, self.commands.len() + 2, &route).await? {
            Response::Multiple(replies) => replies,
            Response::Single(reply) => vec![reply],
        };
        match replies.into_iter().last() {
            Some(Value::Array(values)) => {
                Ok(values.into_iter().map(Value::extract_error).collect())
            }
            // A watched key changed: nothing was executed.
            Some(Value::Nil) => Ok(vec![]),
            Some(Value::ServerError(err)) => Err(err.into()),
            other => fail!((
                ErrorKind::UnexpectedReturnType,
                "Invalid response to EXEC",
                format!("{other:?}")
            )),
        }
    }

    async fn exec_batches<C: Connect>(
        &self,
        con: &ClusterConnection<C>,
        routes: &[SingleNodeRoutingInfo],
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        let mut groups: Vec<(Node, Vec<usize>)> = Vec::new();
        let mut group_of_node: HashMap<ArcStr, usize> = HashMap::new();
        for (index, route) in routes.iter().enumerate() {
            let node = con.resolve(route)?;
            let group = *group_of_node.entry(node.name().clone()).or_insert_with(|| {
                groups.push((node, Vec::new()));
                groups.len() - 1
            });
            groups[group].1.push(index);
        }
        debug!(
            "sending {} commands to {} node(s)",
            self.commands.len(),
            groups.len()
        );

        let batches = join_all(groups.iter().map(|(node, indices)| {
            let mut packed = Vec::new();
            for index in indices {
                self.commands[*index].write_packed_command(&mut packed);
            }
            async move { con.send_batch(node, &packed, indices.len(), false).await }
        }))
        .await;

        let mut results: Vec<Option<RedisResult<Value>>> = Vec::new();
        results.resize_with(self.commands.len(), || None);
        let mut to_replay = Vec::new();
        let mut moved = Vec::new();
        for ((node, indices), batch) in groups.iter().zip(batches) {
            let replies = match batch {
                Ok(replies) => replies,
                Err(err) if err.is_io_error() => {
                    trace!("batch to {node} failed ({err}), replaying its commands");
                    to_replay.extend(indices.iter().copied());
                    continue;
                }
                Err(err) => {
                    for index in indices {
                        results[*index] = Some(Err(err.clone_mostly()));
                    }
                    continue;
                }
            };
            for (index, reply) in indices.iter().copied().zip(replies) {
                let err = match reply {
                    Value::ServerError(err) => RedisError::from(err),
                    reply => {
                        results[index] = Some(Ok(reply));
                        continue;
                    }
                };
                match err.retry_method() {
                    RetryMethod::MovedRedirect => {
                        if let Some((addr, slot)) = err.redirect_node() {
                            moved.push((slot, ArcStr::from(addr)));
                        }
                        to_replay.push(index);
                    }
                    RetryMethod::AskRedirect | RetryMethod::WaitAndRetry => to_replay.push(index),
                    _ => results[index] = Some(Err(err)),
                }
            }
        }

        for (slot, addr) in &moved {
            con.patch_moved_slot(*slot, addr).await?;
        }
        to_replay.sort_unstable();
        for index in to_replay {
            let routing = RoutingInfo::SingleNode(routes[index].clone());
            results[index] = Some(con.route_command(&self.commands[index], routing).await);
        }

        Ok(results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    Err(RedisError::from((
                        ErrorKind::ClientError,
                        "Missing reply in pipeline",
                    )))
                })
            })
            .collect())
    }
}

fn route_in_pipeline(cmd: &Cmd) -> RedisResult<SingleNodeRoutingInfo> {
    match RoutingInfo::for_routable(cmd)? {
        RoutingInfo::SingleNode(route) => Ok(route),
        RoutingInfo::MultiNode(_) => {
            let name = cmd
                .arg_idx(0)
                .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
                .unwrap_or_default();
            fail!((
                ErrorKind::CommandNotAllowed,
                "This command cannot be safely routed in cluster mode",
                format!("Command '{name}' can't be executed in a cluster pipeline.")
            ))
        }
    }
}

/// Shortcut for creating a new cluster pipeline.
pub fn cluster_pipe() -> ClusterPipeline {
    ClusterPipeline::new()
}
