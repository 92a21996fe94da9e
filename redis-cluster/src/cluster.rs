//! This module extends the library to support Redis Cluster.
//!
//! Note that this module does not currently provide pubsub functionality.
//!
//! # Example
//! ```rust,no_run
//! use redis_cluster::cluster::{cluster_pipe, ClusterClient};
//! use redis_cluster::cmd;
//!
//! async fn run() -> redis_cluster::RedisResult<()> {
//!     let nodes = vec![
//!         "redis://127.0.0.1:6379/",
//!         "redis://127.0.0.1:6378/",
//!         "redis://127.0.0.1:6377/",
//!     ];
//!     let client = ClusterClient::new(nodes)?;
//!     let connection = client.get_connection().await?;
//!
//!     connection.execute_command(cmd("SET").arg("test").arg("test_data")).await?;
//!     let rv = connection.execute_command(cmd("GET").arg("test")).await?;
//!     println!("{rv:?}");
//!
//!     let results = cluster_pipe()
//!         .cmd("SET").arg("key_1").arg(42)
//!         .cmd("SET").arg("key_2").arg(43)
//!         .query(&connection)
//!         .await?;
//!     assert_eq!(results.len(), 2);
//!     Ok(())
//! }
//! ```

pub use crate::cluster_handling::async_connection::ClusterConnection;
pub use crate::cluster_handling::client::{ClusterClient, ClusterClientBuilder, RefreshPolicy};
pub use crate::cluster_handling::routing::{
    get_slot, AggregateOp, LogicalAggregateOp, MultipleNodeRoutingInfo, ResponsePolicy,
    Routable, Route, RoutingInfo, SingleNodeRoutingInfo, SlotAddr,
};
pub use crate::cluster_handling::slot_map::{Node, NodeRegistry, NodeRole, SLOT_SIZE};
pub use crate::cluster_pipeline::{cluster_pipe, ClusterPipeline};
