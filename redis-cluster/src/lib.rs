//! redis-cluster is a client for Redis Cluster. It keeps a map of which node serves which of the
//! 16384 hash slots, routes every command to the right node and follows the cluster as slots
//! move between nodes.
//!
//! # Basic Operation
//!
//! A [`ClusterClient`](cluster::ClusterClient) is built from a list of startup nodes. Asking it
//! for a connection discovers the topology; the connection then routes commands by the slot of
//! their keys.
//!
//! ```rust,no_run
//! use redis_cluster::{cluster::ClusterClient, cmd};
//!
//! async fn do_something() -> redis_cluster::RedisResult<()> {
//!     let client = ClusterClient::new(vec!["redis://127.0.0.1:7000", "127.0.0.1:7001"])?;
//!     let con = client.get_connection().await?;
//!
//!     con.execute_command(cmd("SET").arg("my_key").arg(42)).await?;
//!     let value = con.execute_command(cmd("GET").arg("my_key")).await?;
//!     println!("{value:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Routing
//!
//! * Key-based commands go to the primary serving the slot of their key. All keys of a multi-key
//!   command must share a slot; hashtags (`{user1}:name`, `{user1}:age`) force that.
//! * Read-only commands go to a replica when the client was built with
//!   [`read_from_replicas`](cluster::ClusterClientBuilder::read_from_replicas).
//! * Server-wide commands (`FLUSHALL`, `DBSIZE`, `KEYS`, ...) are sent to every primary or every
//!   node and their replies merged.
//! * Commands that make no sense against a cluster (`SELECT`, `MOVE`, `MULTI`, ...) are refused.
//!
//! ## Redirects and retries
//!
//! `MOVED` replies patch the slot map and schedule a full refresh, `ASK` replies redirect a
//! single command and `TRYAGAIN` or connection failures are retried. Each command gets
//! `request_ttl` attempts before failing with
//! [`ErrorKind::TTLExhausted`].
//!
//! ## Pipelines
//!
//! [`cluster_pipe`](cluster::cluster_pipe) groups commands by node and sends one batch per node.
//! An atomic pipeline is sent as `MULTI`/`EXEC` and must stay on a single node.

#![deny(non_camel_case_types)]
#![warn(missing_docs)]

pub use crate::cmd::{cmd, pack_command, Cmd};
pub use crate::connection::{Connect, ConnectionLike, TcpConnection};
pub use crate::errors::{ErrorKind, RedisError, RetryMethod, ServerError, ServerErrorKind};
pub use crate::parser::{parse_redis_value, parse_redis_values, Parser, ValueCodec};
pub use crate::types::{RedisFuture, RedisResult, RedisWrite, ToRedisArgs, Value};

#[macro_use]
mod macros;

/// Redis Cluster support: client, connection, routing and pipelines.
pub mod cluster;

mod cluster_handling;
mod cluster_pipeline;
mod cmd;
mod connection;
mod errors;
mod parser;
mod types;
