//! Testing support
//!
//! This crate provides `MockConnection`, an in-memory transport that implements `Connect` and
//! `ConnectionLike` and can be used in place of a TCP connection to cluster nodes. Every node of
//! a mocked cluster answers through a handler installed under the host name used in the node
//! addresses; the handler sees each command together with the port it was sent to.
//!
//! # Example
//!
//! ```rust
//! use redis_cluster::Value;
//! use redis_cluster_test::{cluster::respond_startup, contains_slice, MockEnv};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let env = MockEnv::new("doc_example", |cmd, _port| {
//!     respond_startup("doc_example", cmd)?;
//!     if contains_slice(cmd, b"GET") {
//!         return Err(Ok(Value::BulkString(b"bar".to_vec())));
//!     }
//!     Err(Ok(Value::Okay))
//! })
//! .await;
//! let value = env
//!     .connection
//!     .execute_command(redis_cluster::cmd("GET").arg("foo"))
//!     .await
//!     .unwrap();
//! assert_eq!(value, Value::BulkString(b"bar".to_vec()));
//! # });
//! ```

pub mod cluster;

pub use cluster::{MockEnv, RemoveHandler};

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future;
use log::trace;
use once_cell::sync::Lazy;
use redis_cluster::{
    pack_command, parse_redis_value, parse_redis_values, Connect, ConnectionLike, RedisError,
    RedisFuture, RedisResult, Value,
};

/// Answers a single command sent to the node listening on the given port.
///
/// `Err(reply)` is the reply (or the transport failure) for the command; `Ok(())` means the
/// handler has nothing to say, which fails the test.
pub type Handler = Arc<dyn Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync>;

static HANDLERS: Lazy<RwLock<HashMap<String, Handler>>> = Lazy::new(Default::default);

// Hosts whose connections yield to the runtime on every write.
static YIELDING: Lazy<RwLock<HashSet<String>>> = Lazy::new(Default::default);

// Writes received per (host, port).
static WRITES: Lazy<RwLock<HashMap<(String, u16), usize>>> = Lazy::new(Default::default);

/// Number of writes (one per batch, however many commands it carries) the node `name:port`
/// received so far.
pub fn write_count(name: &str, port: u16) -> usize {
    WRITES
        .read()
        .unwrap()
        .get(&(name.to_string(), port))
        .copied()
        .unwrap_or(0)
}

/// Installs `handler` for every node whose host is `name`. The handler is removed when the
/// returned guard is dropped.
pub fn install_handler(
    name: &str,
    handler: impl Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync + 'static,
) -> RemoveHandler {
    HANDLERS
        .write()
        .unwrap()
        .insert(name.to_string(), Arc::new(handler));
    RemoveHandler(vec![name.to_string()])
}

/// Like [`install_handler`], but every write suspends the writing task once before completing,
/// so concurrent callers interleave the way they would over a real socket.
pub fn install_yielding_handler(
    name: &str,
    handler: impl Fn(&[u8], u16) -> Result<(), RedisResult<Value>> + Send + Sync + 'static,
) -> RemoveHandler {
    YIELDING.write().unwrap().insert(name.to_string());
    install_handler(name, handler)
}

/// Helper trait for converting test values into a `Value` returned from a handler.
pub trait IntoRedisValue {
    /// Convert a value into `Value`.
    fn into_redis_value(self) -> Value;
}

macro_rules! into_redis_value_impl_int {
    ($t:ty) => {
        impl IntoRedisValue for $t {
            fn into_redis_value(self) -> Value {
                Value::Int(self as i64)
            }
        }
    };
}

into_redis_value_impl_int!(i32);
into_redis_value_impl_int!(i64);
into_redis_value_impl_int!(u16);
into_redis_value_impl_int!(usize);

impl IntoRedisValue for &str {
    fn into_redis_value(self) -> Value {
        Value::BulkString(self.as_bytes().to_vec())
    }
}

impl IntoRedisValue for String {
    fn into_redis_value(self) -> Value {
        Value::BulkString(self.into_bytes())
    }
}

impl IntoRedisValue for Vec<Value> {
    fn into_redis_value(self) -> Value {
        Value::Array(self)
    }
}

impl IntoRedisValue for Value {
    fn into_redis_value(self) -> Value {
        self
    }
}

/// Builds an error reply from its raw line, e.g. `MOVED 12182 node:6380`.
pub fn server_error(line: &str) -> Value {
    parse_redis_value(format!("-{line}\r\n").as_bytes()).unwrap()
}

/// A transport failure, as a handler result.
pub fn connection_error() -> RedisResult<Value> {
    Err(RedisError::from(io::Error::from(
        io::ErrorKind::ConnectionReset,
    )))
}

pub fn contains_slice(xs: &[u8], ys: &[u8]) -> bool {
    for i in 0..xs.len() {
        if xs[i..].starts_with(ys) {
            return true;
        }
    }
    false
}

/// An in-memory link to one node of a mocked cluster.
pub struct MockConnection {
    name: String,
    handler: Handler,
    port: u16,
    replies: VecDeque<RedisResult<Value>>,
    open: bool,
    yield_on_send: bool,
}

impl MockConnection {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Connect for MockConnection {
    fn connect<'a>(
        addr: &'a str,
        _connection_timeout: Duration,
        _response_timeout: Duration,
    ) -> RedisFuture<'a, Self> {
        let (name, port) = addr
            .rsplit_once(':')
            .map(|(name, port)| (name, port.parse::<u16>().unwrap()))
            .unwrap_or_else(|| panic!("Invalid address `{addr}`"));
        let handler = HANDLERS.read().unwrap().get(name).cloned();
        let yield_on_send = YIELDING.read().unwrap().contains(name);
        Box::pin(future::ready(match handler {
            Some(handler) => Ok(MockConnection {
                name: name.to_string(),
                handler,
                port,
                replies: VecDeque::new(),
                open: true,
                yield_on_send,
            }),
            None => Err(RedisError::from(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))),
        }))
    }
}

impl ConnectionLike for MockConnection {
    fn send_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, ()> {
        if !self.open {
            return Box::pin(future::ready(Err(RedisError::from(io::Error::from(
                io::ErrorKind::NotConnected,
            )))));
        }
        *WRITES
            .write()
            .unwrap()
            .entry((self.name.clone(), self.port))
            .or_default() += 1;
        for value in parse_redis_values(cmd).unwrap() {
            let Value::Array(args) = value else {
                panic!("Commands are sent as arrays, got {value:?}");
            };
            let args: Vec<Vec<u8>> = args
                .into_iter()
                .map(|arg| match arg {
                    Value::BulkString(arg) => arg,
                    arg => panic!("Arguments are sent as bulk strings, got {arg:?}"),
                })
                .collect();
            let packed = pack_command(&args);
            trace!(
                "port {}: {}",
                self.port,
                String::from_utf8_lossy(&args.join(&b' '))
            );
            let reply =
                (self.handler)(&packed, self.port).expect_err("Handler did not specify a response");
            self.replies.push_back(reply);
        }
        if self.yield_on_send {
            return Box::pin(async {
                tokio::task::yield_now().await;
                Ok(())
            });
        }
        Box::pin(future::ok(()))
    }

    fn recv_response(&mut self) -> RedisFuture<'_, Value> {
        let reply = match self.replies.pop_front() {
            Some(Err(err)) if err.is_io_error() => {
                self.disconnect();
                Err(err)
            }
            Some(reply) => reply,
            None => Err(RedisError::from(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            ))),
        };
        Box::pin(future::ready(reply))
    }

    fn disconnect(&mut self) {
        self.open = false;
        self.replies.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
