use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use redis_cluster::cluster::{cluster_pipe, ClusterClient};
use redis_cluster::{cmd, ErrorKind, Value};
use redis_cluster_test::cluster::{
    respond_startup, respond_startup_two_nodes, respond_startup_with_config,
    respond_startup_with_replica, MockSlotRange,
};
use redis_cluster_test::{connection_error, contains_slice, server_error, write_count, MockEnv};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bulk(value: &str) -> Value {
    Value::BulkString(value.as_bytes().to_vec())
}

// "foo" hashes to 12182 (6380), "bar" to 5061 (6379).
fn two_node_handler(
    name: &'static str,
) -> impl Fn(&[u8], u16) -> Result<(), redis_cluster::RedisResult<Value>> + Send + Sync + 'static {
    move |cmd, port| {
        respond_startup_two_nodes(name, cmd)?;
        if contains_slice(cmd, b"SET") {
            return Err(Ok(Value::Okay));
        }
        if contains_slice(cmd, b"GET") {
            return Err(Ok(bulk(&port.to_string())));
        }
        if contains_slice(cmd, b"INCR") {
            return Err(Ok(server_error(
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )));
        }
        panic!("unexpected command");
    }
}

#[tokio::test]
async fn test_cluster_pipeline_one_write_per_node() {
    init_logger();
    let name = "test_cluster_pipeline_one_write_per_node";
    let env = MockEnv::new(name, two_node_handler(name)).await;
    let before = (write_count(name, 6379), write_count(name, 6380));

    let results = cluster_pipe()
        .cmd("SET")
        .arg("foo")
        .arg(1)
        .cmd("SET")
        .arg("bar")
        .arg(2)
        .cmd("GET")
        .arg("foo")
        .cmd("GET")
        .arg("bar")
        .cmd("GET")
        .arg("{foo}.other")
        .query(&env.connection)
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![Value::Okay, Value::Okay, bulk("6380"), bulk("6379"), bulk("6380")]
    );
    assert_eq!(write_count(name, 6379), before.0 + 1);
    assert_eq!(write_count(name, 6380), before.1 + 1);
}

#[tokio::test]
async fn test_cluster_pipeline_error_replies_stay_in_band() {
    init_logger();
    let name = "test_cluster_pipeline_error_replies_stay_in_band";
    let env = MockEnv::new(name, two_node_handler(name)).await;

    let mut pipe = cluster_pipe();
    pipe.cmd("SET")
        .arg("foo")
        .arg("x")
        .cmd("INCR")
        .arg("foo")
        .cmd("GET")
        .arg("bar");

    let results = pipe.exec(&env.connection, false).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], Ok(Value::Okay));
    assert_eq!(results[1].as_ref().unwrap_err().code(), Some("WRONGTYPE"));
    assert_eq!(results[2], Ok(bulk("6379")));

    let err = pipe.query(&env.connection).await.unwrap_err();
    assert_eq!(err.code(), Some("WRONGTYPE"));
}

#[tokio::test]
async fn test_cluster_pipeline_rejects_unroutable_commands() {
    init_logger();
    let name = "test_cluster_pipeline_rejects_unroutable_commands";
    let env = MockEnv::new(name, move |cmd, _port| {
        respond_startup_two_nodes(name, cmd)?;
        panic!("nothing should be sent");
    })
    .await;

    let err = cluster_pipe()
        .cmd("SET")
        .arg("foo")
        .arg(1)
        .cmd("KEYS")
        .arg("*")
        .exec(&env.connection, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandNotAllowed);

    let err = cluster_pipe()
        .cmd("MSET")
        .arg("foo")
        .arg(1)
        .arg("bar")
        .arg(2)
        .exec(&env.connection, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossSlot);

    assert_eq!(cluster_pipe().exec(&env.connection, true).await, Ok(vec![]));
}

#[tokio::test]
async fn test_cluster_pipeline_replays_redirected_commands() {
    init_logger();
    let name = "test_cluster_pipeline_replays_redirected_commands";
    let moved = Arc::new(AtomicBool::new(false));
    let env = {
        let moved = moved.clone();
        MockEnv::new(name, move |cmd, port| {
            let layout = if moved.load(Ordering::SeqCst) {
                vec![MockSlotRange::new(0..16383, 6379, vec![])]
            } else {
                vec![
                    MockSlotRange::new(0..8191, 6379, vec![]),
                    MockSlotRange::new(8192..16383, 6380, vec![]),
                ]
            };
            respond_startup_with_config(name, cmd, &layout)?;
            match port {
                6380 => {
                    moved.store(true, Ordering::SeqCst);
                    Err(Ok(server_error(&format!("MOVED 12182 {name}:6379"))))
                }
                6379 if contains_slice(cmd, b"GET") => Err(Ok(bulk("moved"))),
                6379 => Err(Ok(Value::Okay)),
                _ => panic!("Wrong node {port}"),
            }
        })
        .await
    };

    let results = cluster_pipe()
        .cmd("SET")
        .arg("bar")
        .arg(1)
        .cmd("GET")
        .arg("foo")
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Okay, bulk("moved")]);
    assert_eq!(
        env.connection
            .registry()
            .get_node_for_slot(12182)
            .unwrap()
            .port(),
        6379
    );
}

#[tokio::test]
async fn test_cluster_pipeline_replays_after_connection_error() {
    init_logger();
    let name = "test_cluster_pipeline_replays_after_connection_error";
    let gets_6380 = Arc::new(AtomicUsize::new(0));
    let env = {
        let gets_6380 = gets_6380.clone();
        MockEnv::new(name, move |cmd, port| {
            respond_startup_two_nodes(name, cmd)?;
            match port {
                6380 if gets_6380.fetch_add(1, Ordering::SeqCst) == 0 => Err(connection_error()),
                _ => Err(Ok(bulk(&port.to_string()))),
            }
        })
        .await
    };

    let results = cluster_pipe()
        .cmd("GET")
        .arg("foo")
        .cmd("GET")
        .arg("bar")
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![bulk("6380"), bulk("6379")]);
    assert_eq!(gets_6380.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cluster_pipeline_transaction() {
    init_logger();
    let name = "test_cluster_pipeline_transaction";
    let env = MockEnv::new(name, move |cmd, _port| {
        respond_startup(name, cmd)?;
        if contains_slice(cmd, b"MULTI") {
            return Err(Ok(Value::Okay));
        }
        if contains_slice(cmd, b"EXEC") {
            return Err(Ok(Value::Array(vec![Value::Okay, bulk("1")])));
        }
        Err(Ok(Value::SimpleString("QUEUED".to_string())))
    })
    .await;

    let results = cluster_pipe()
        .atomic()
        .cmd("SET")
        .arg("{user1}:name")
        .arg(1)
        .cmd("GET")
        .arg("{user1}:name")
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Okay, bulk("1")]);
}

#[tokio::test]
async fn test_cluster_pipeline_transaction_aborted_by_watch() {
    init_logger();
    let name = "test_cluster_pipeline_transaction_aborted_by_watch";
    let env = MockEnv::new(name, move |cmd, _port| {
        respond_startup(name, cmd)?;
        if contains_slice(cmd, b"EXEC") {
            return Err(Ok(Value::Nil));
        }
        if contains_slice(cmd, b"MULTI") {
            return Err(Ok(Value::Okay));
        }
        Err(Ok(Value::SimpleString("QUEUED".to_string())))
    })
    .await;

    let results = cluster_pipe()
        .atomic()
        .cmd("INCR")
        .arg("counter")
        .exec(&env.connection, true)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_cluster_pipeline_transaction_must_stay_on_one_node() {
    init_logger();
    let name = "test_cluster_pipeline_transaction_must_stay_on_one_node";
    let env = MockEnv::new(name, move |cmd, _port| {
        respond_startup_two_nodes(name, cmd)?;
        panic!("nothing should be sent");
    })
    .await;

    let err = cluster_pipe()
        .atomic()
        .cmd("SET")
        .arg("foo")
        .arg(1)
        .cmd("SET")
        .arg("bar")
        .arg(2)
        .exec(&env.connection, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossSlot);
}

#[tokio::test]
async fn test_cluster_pipeline_transaction_follows_redirects() {
    init_logger();
    let name = "test_cluster_pipeline_transaction_follows_redirects";
    let env = MockEnv::new(name, move |cmd, port| {
        respond_startup_two_nodes(name, cmd)?;
        if contains_slice(cmd, b"MULTI") {
            return Err(Ok(Value::Okay));
        }
        match port {
            6380 if contains_slice(cmd, b"EXEC") => Err(Ok(server_error(
                "EXECABORT Transaction discarded because of previous errors.",
            ))),
            6380 => Err(Ok(server_error(&format!("ASK 12182 {name}:6381")))),
            6381 if contains_slice(cmd, b"ASKING") => Err(Ok(Value::Okay)),
            6381 if contains_slice(cmd, b"EXEC") => Err(Ok(Value::Array(vec![Value::Int(1)]))),
            6381 => Err(Ok(Value::SimpleString("QUEUED".to_string()))),
            _ => panic!("Wrong node {port}"),
        }
    })
    .await;

    let results = cluster_pipe()
        .atomic()
        .cmd("INCR")
        .arg("foo")
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Int(1)]);
}

#[tokio::test]
async fn test_cluster_pipeline_transaction_with_replica_reads() {
    init_logger();
    let name = "test_cluster_pipeline_transaction_with_replica_reads";
    // "{a}x" hashes to 15495, owned by 6381 with replica 6382.
    let env = MockEnv::with_client_builder(
        ClusterClient::builder(vec![format!("{name}:6379")]).read_from_replicas(),
        name,
        move |cmd, port| {
            respond_startup_with_replica(name, cmd)?;
            assert_eq!(port, 6381, "transactions go to the primary");
            if contains_slice(cmd, b"EXEC") {
                return Err(Ok(Value::Array(vec![bulk("1"), Value::Okay])));
            }
            if contains_slice(cmd, b"MULTI") {
                return Err(Ok(Value::Okay));
            }
            Err(Ok(Value::SimpleString("QUEUED".to_string())))
        },
    )
    .await;

    let results = cluster_pipe()
        .atomic()
        .cmd("GET")
        .arg("{a}x")
        .cmd("SET")
        .arg("{a}x")
        .arg(1)
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![bulk("1"), Value::Okay]);

    // A read-only transaction still runs on the primary.
    let results = cluster_pipe()
        .atomic()
        .cmd("GET")
        .arg("{a}x")
        .query(&env.connection)
        .await
        .unwrap();
    assert_eq!(results, vec![bulk("1"), Value::Okay]);
}
