//! A mocked cluster: canned `CLUSTER SLOTS` replies and an environment holding a connection
//! whose nodes all answer through one handler.

use std::ops::Range;

use redis_cluster::cluster::{ClusterClient, ClusterClientBuilder, ClusterConnection};
use redis_cluster::{RedisResult, Value};

use crate::{contains_slice, install_handler, MockConnection, HANDLERS, WRITES, YIELDING};

/// Removes the handlers it names when dropped.
pub struct RemoveHandler(pub(crate) Vec<String>);

impl Drop for RemoveHandler {
    fn drop(&mut self) {
        for id in &self.0 {
            HANDLERS.write().unwrap().remove(id);
            YIELDING.write().unwrap().remove(id);
            WRITES.write().unwrap().retain(|(name, _), _| name != id);
        }
    }
}

/// A slot range served by a primary and its replicas, all on the mocked host.
#[derive(Clone)]
pub struct MockSlotRange {
    pub primary_port: u16,
    pub replica_ports: Vec<u16>,
    pub slot_range: Range<u16>,
}

impl MockSlotRange {
    pub fn new(slot_range: Range<u16>, primary_port: u16, replica_ports: Vec<u16>) -> Self {
        MockSlotRange {
            primary_port,
            replica_ports,
            slot_range,
        }
    }
}

fn node_value(name: &str, port: u16) -> Value {
    Value::Array(vec![
        Value::BulkString(name.as_bytes().to_vec()),
        Value::Int(port as i64),
        Value::BulkString(format!("{name}-{port}").into_bytes()),
    ])
}

/// The `CLUSTER SLOTS` reply describing `slots_config`. Range ends are inclusive in the reply.
pub fn slots_reply(name: &str, slots_config: &[MockSlotRange]) -> Value {
    Value::Array(
        slots_config
            .iter()
            .map(|slot_config| {
                let mut entry = vec![
                    Value::Int(slot_config.slot_range.start as i64),
                    Value::Int(slot_config.slot_range.end as i64),
                    node_value(name, slot_config.primary_port),
                ];
                entry.extend(
                    slot_config
                        .replica_ports
                        .iter()
                        .map(|port| node_value(name, *port)),
                );
                Value::Array(entry)
            })
            .collect(),
    )
}

/// Answers topology discovery with a single node on port 6379 serving every slot.
pub fn respond_startup(name: &str, cmd: &[u8]) -> Result<(), RedisResult<Value>> {
    respond_startup_with_config(name, cmd, &[MockSlotRange::new(0..16383, 6379, vec![])])
}

/// Two primaries, 6379 and 6380, splitting the slots in half.
pub fn respond_startup_two_nodes(name: &str, cmd: &[u8]) -> Result<(), RedisResult<Value>> {
    respond_startup_with_config(
        name,
        cmd,
        &[
            MockSlotRange::new(0..8191, 6379, vec![]),
            MockSlotRange::new(8192..16383, 6380, vec![]),
        ],
    )
}

/// Two primaries (6379, 6381), each with one replica (6380, 6382).
pub fn respond_startup_with_replica(name: &str, cmd: &[u8]) -> Result<(), RedisResult<Value>> {
    respond_startup_with_config(
        name,
        cmd,
        &[
            MockSlotRange::new(0..8191, 6379, vec![6380]),
            MockSlotRange::new(8192..16383, 6381, vec![6382]),
        ],
    )
}

/// Answers `CLUSTER SLOTS`, `READONLY` and `PING` for the given layout. Any other command is
/// left to the caller.
pub fn respond_startup_with_config(
    name: &str,
    cmd: &[u8],
    slots_config: &[MockSlotRange],
) -> Result<(), RedisResult<Value>> {
    if contains_slice(cmd, b"PING") || contains_slice(cmd, b"READONLY") {
        Err(Ok(Value::Okay))
    } else if contains_slice(cmd, b"CLUSTER") && contains_slice(cmd, b"SLOTS") {
        Err(Ok(slots_reply(name, slots_config)))
    } else {
        Ok(())
    }
}

/// A cluster client and a connection to a mocked cluster.
pub struct MockEnv {
    pub client: ClusterClient,
    pub connection: ClusterConnection<MockConnection>,
    #[allow(unused)]
    pub handler: RemoveHandler,
}

impl MockEnv {
    /// Connects to the mocked node `{id}:6379`.
    pub async fn new(
        id: &str,
        handler: impl Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self::with_client_builder(
            ClusterClient::builder(vec![format!("{id}:6379")]),
            id,
            handler,
        )
        .await
    }

    pub async fn with_client_builder(
        client_builder: ClusterClientBuilder,
        id: &str,
        handler: impl Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self::try_with_client_builder(client_builder, id, handler)
            .await
            .unwrap()
    }

    /// Like [`Self::with_client_builder`], returning the discovery error instead of panicking.
    pub async fn try_with_client_builder(
        client_builder: ClusterClientBuilder,
        id: &str,
        handler: impl Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync + 'static,
    ) -> RedisResult<Self> {
        let handler = install_handler(id, handler);
        let client = client_builder.build()?;
        let connection = client.get_generic_connection::<MockConnection>().await?;
        Ok(MockEnv {
            client,
            connection,
            handler,
        })
    }
}
