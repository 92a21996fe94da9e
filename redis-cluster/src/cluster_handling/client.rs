use std::time::Duration;

use crate::cluster_handling::async_connection::ClusterConnection;
use crate::cluster_handling::slot_map::Node;
use crate::connection::{Connect, TcpConnection};
use crate::{ErrorKind, RedisError, RedisResult};

/// When a full topology refresh runs after a `MOVED` redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum RefreshPolicy {
    /// Patch the moved slot right away and rebuild the whole table before the next command.
    /// Every `reinitialize_steps` redirects the rebuild happens immediately instead.
    #[default]
    Lazy,
    /// Rebuild the whole table before retrying every redirected command.
    Inline,
}

/// Redis cluster specific parameters.
#[derive(Debug, Clone)]
pub(crate) struct ClusterParams {
    pub(crate) max_connections: usize,
    pub(crate) max_connections_per_node: usize,
    pub(crate) reinitialize_steps: usize,
    pub(crate) skip_full_coverage_check: bool,
    pub(crate) nodemanager_follow_cluster: bool,
    pub(crate) request_ttl: usize,
    pub(crate) read_from_replicas: bool,
    pub(crate) refresh_policy: RefreshPolicy,
    pub(crate) connection_error_backoff: Duration,
    pub(crate) try_again_backoff: Duration,
    pub(crate) connection_timeout: Duration,
    pub(crate) response_timeout: Duration,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            max_connections: 64,
            max_connections_per_node: 16,
            reinitialize_steps: 25,
            skip_full_coverage_check: false,
            nodemanager_follow_cluster: false,
            request_ttl: 16,
            read_from_replicas: false,
            refresh_policy: RefreshPolicy::Lazy,
            connection_error_backoff: Duration::from_millis(100),
            try_again_backoff: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
        }
    }
}

/// Used to configure and build a [`ClusterClient`].
pub struct ClusterClientBuilder {
    initial_nodes: Vec<String>,
    cluster_params: ClusterParams,
}

impl ClusterClientBuilder {
    /// Creates a new `ClusterClientBuilder` with the provided initial nodes, given as
    /// `host:port` or `redis://host:port`.
    ///
    /// This is the same as `ClusterClient::builder(initial_nodes)`.
    pub fn new<T: AsRef<str>>(initial_nodes: Vec<T>) -> ClusterClientBuilder {
        ClusterClientBuilder {
            initial_nodes: initial_nodes
                .iter()
                .map(|node| node.as_ref().to_string())
                .collect(),
            cluster_params: ClusterParams::default(),
        }
    }

    /// Creates a new [`ClusterClient`] with the parameters.
    ///
    /// This does not create connections to the Redis Cluster, but only checks the node
    /// addresses and the limits.
    pub fn build(self) -> RedisResult<ClusterClient> {
        if self.initial_nodes.is_empty() {
            return Err(RedisError::from((
                ErrorKind::InvalidClientConfig,
                "Initial nodes can't be empty.",
            )));
        }

        let params = self.cluster_params;
        if params.request_ttl == 0 {
            return Err(RedisError::from((
                ErrorKind::InvalidClientConfig,
                "Request TTL must be at least 1",
            )));
        }
        if params.max_connections == 0 || params.max_connections_per_node == 0 {
            return Err(RedisError::from((
                ErrorKind::InvalidClientConfig,
                "Connection limits must be at least 1",
            )));
        }

        let initial_nodes = self
            .initial_nodes
            .iter()
            .map(|node| Node::from_addr(node))
            .collect::<RedisResult<Vec<_>>>()?;

        Ok(ClusterClient {
            initial_nodes,
            cluster_params: params,
        })
    }

    /// Sets the total number of connections the client may keep open (default 64).
    pub fn max_connections(mut self, max_connections: usize) -> ClusterClientBuilder {
        self.cluster_params.max_connections = max_connections;
        self
    }

    /// Sets the number of connections the client may keep open to one node (default 16).
    pub fn max_connections_per_node(mut self, max_connections: usize) -> ClusterClientBuilder {
        self.cluster_params.max_connections_per_node = max_connections;
        self
    }

    /// Sets after how many `MOVED` redirects the topology is rebuilt immediately (default 25).
    /// Zero disables the counter.
    pub fn reinitialize_steps(mut self, steps: usize) -> ClusterClientBuilder {
        self.cluster_params.reinitialize_steps = steps;
        self
    }

    /// Accepts topologies that leave slots unassigned without asking the cluster whether it
    /// requires full coverage (default false).
    pub fn skip_full_coverage_check(mut self, skip: bool) -> ClusterClientBuilder {
        self.cluster_params.skip_full_coverage_check = skip;
        self
    }

    /// Discovers the topology from the currently known nodes instead of the startup nodes
    /// (default false).
    pub fn nodemanager_follow_cluster(mut self, follow: bool) -> ClusterClientBuilder {
        self.cluster_params.nodemanager_follow_cluster = follow;
        self
    }

    /// Sets how many attempts a single command gets (default 16).
    pub fn request_ttl(mut self, request_ttl: usize) -> ClusterClientBuilder {
        self.cluster_params.request_ttl = request_ttl;
        self
    }

    /// Enables read from replicas for new ClusterClient (default is false).
    ///
    /// If True, then read queries will go to the replica nodes & write queries will go to the
    /// primary nodes. If there are no replica nodes, then all queries will go to the primary nodes.
    pub fn read_from_replicas(mut self) -> ClusterClientBuilder {
        self.cluster_params.read_from_replicas = true;
        self
    }

    /// Same as [`Self::read_from_replicas`], taking the flag explicitly.
    pub fn readonly(mut self, read_from_replicas: bool) -> ClusterClientBuilder {
        self.cluster_params.read_from_replicas = read_from_replicas;
        self
    }

    /// Sets when a `MOVED` redirect rebuilds the whole topology.
    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> ClusterClientBuilder {
        self.cluster_params.refresh_policy = policy;
        self
    }

    /// Sets the pause after a connection error late in a command's attempts (default 100ms).
    pub fn connection_error_backoff(mut self, backoff: Duration) -> ClusterClientBuilder {
        self.cluster_params.connection_error_backoff = backoff;
        self
    }

    /// Sets the pause after a `TRYAGAIN` reply late in a command's attempts (default 50ms).
    pub fn try_again_backoff(mut self, backoff: Duration) -> ClusterClientBuilder {
        self.cluster_params.try_again_backoff = backoff;
        self
    }

    /// Sets the timeout for opening a connection (default 1s).
    pub fn connection_timeout(mut self, timeout: Duration) -> ClusterClientBuilder {
        self.cluster_params.connection_timeout = timeout;
        self
    }

    /// Sets the timeout for a single reply (default 1s).
    pub fn response_timeout(mut self, timeout: Duration) -> ClusterClientBuilder {
        self.cluster_params.response_timeout = timeout;
        self
    }
}

/// This is a Redis cluster client.
#[derive(Clone)]
pub struct ClusterClient {
    initial_nodes: Vec<Node>,
    cluster_params: ClusterParams,
}

impl ClusterClient {
    /// Creates a `ClusterClient` with the default parameters.
    ///
    /// This does not create connections to the Redis Cluster, but only checks the node
    /// addresses.
    pub fn new<T: AsRef<str>>(initial_nodes: Vec<T>) -> RedisResult<ClusterClient> {
        ClusterClientBuilder::new(initial_nodes).build()
    }

    /// Creates a [`ClusterClientBuilder`] with the the provided initial_nodes.
    pub fn builder<T: AsRef<str>>(initial_nodes: Vec<T>) -> ClusterClientBuilder {
        ClusterClientBuilder::new(initial_nodes)
    }

    /// Discovers the topology and returns a [`ClusterConnection`] over TCP.
    ///
    /// Every call builds its own node registry and connection pool; clone the returned
    /// connection to share them between tasks.
    pub async fn get_connection(&self) -> RedisResult<ClusterConnection> {
        self.get_generic_connection::<TcpConnection>().await
    }

    /// Like [`Self::get_connection`], over a caller supplied transport.
    pub async fn get_generic_connection<C>(&self) -> RedisResult<ClusterConnection<C>>
    where
        C: Connect,
    {
        ClusterConnection::new(self.initial_nodes.clone(), self.cluster_params.clone()).await
    }
}
