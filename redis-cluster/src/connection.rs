//! The transport boundary the cluster layer is written against.
//!
//! A cluster connection never talks to sockets directly: it opens links through [`Connect`] and
//! drives them through [`ConnectionLike`]. [`TcpConnection`] is the default implementation; tests
//! substitute an in-memory one.

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::trace;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::parser::ValueCodec;
use crate::types::{RedisFuture, Value};
use crate::{ErrorKind, RedisError, RedisResult};

/// An established link to a single node.
pub trait ConnectionLike: Send {
    /// Writes an already packed command (or several of them) to the node.
    fn send_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, ()>;

    /// Reads the next reply. Error replies are returned in-band as [`Value::ServerError`];
    /// `Err` is reserved for transport failures.
    fn recv_response(&mut self) -> RedisFuture<'_, Value>;

    /// Releases the underlying resources. Calling it more than once is a no-op.
    fn disconnect(&mut self);

    /// Returns false once the link is known to be unusable.
    fn is_open(&self) -> bool;

    /// Sends a packed command and reads its reply.
    fn req_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, Value> {
        Box::pin(async move {
            self.send_packed_command(cmd).await?;
            self.recv_response().await
        })
    }

    /// Sends `count` packed commands in a single write and reads their replies in order.
    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a [u8],
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            self.send_packed_command(cmd).await?;
            let mut replies = Vec::with_capacity(count);
            for _ in 0..count {
                replies.push(self.recv_response().await?);
            }
            Ok(replies)
        })
    }
}

/// Opens connections to cluster nodes.
pub trait Connect: ConnectionLike + Sized + 'static {
    /// Connects to `addr`, given as `host:port`.
    fn connect<'a>(
        addr: &'a str,
        connection_timeout: Duration,
        response_timeout: Duration,
    ) -> RedisFuture<'a, Self>;
}

/// A plain TCP link speaking RESP.
pub struct TcpConnection {
    framed: Option<Framed<TcpStream, ValueCodec>>,
    response_timeout: Duration,
}

fn not_connected() -> RedisError {
    RedisError::from(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection is closed",
    ))
}

impl Connect for TcpConnection {
    fn connect<'a>(
        addr: &'a str,
        connection_timeout: Duration,
        response_timeout: Duration,
    ) -> RedisFuture<'a, Self> {
        Box::pin(async move {
            let stream = tokio::time::timeout(connection_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| RedisError::from(io::Error::from(io::ErrorKind::TimedOut)))??;
            stream.set_nodelay(true)?;
            trace!("connected to {addr}");
            Ok(TcpConnection {
                framed: Some(Framed::new(stream, ValueCodec::default())),
                response_timeout,
            })
        })
    }
}

impl ConnectionLike for TcpConnection {
    fn send_packed_command<'a>(&'a mut self, cmd: &'a [u8]) -> RedisFuture<'a, ()> {
        Box::pin(async move {
            let framed = self.framed.as_mut().ok_or_else(not_connected)?;
            let result = framed.send(cmd.to_vec()).await;
            if result.is_err() {
                self.disconnect();
            }
            result
        })
    }

    fn recv_response(&mut self) -> RedisFuture<'_, Value> {
        Box::pin(async move {
            let framed = self.framed.as_mut().ok_or_else(not_connected)?;
            let result = match tokio::time::timeout(self.response_timeout, framed.next()).await {
                Ok(Some(result)) => result,
                Ok(None) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            };
            if result.is_err() {
                // A failed or abandoned read leaves the stream position unknown.
                self.disconnect();
            }
            result
        })
    }

    fn disconnect(&mut self) {
        self.framed = None;
    }

    fn is_open(&self) -> bool {
        self.framed.is_some()
    }
}

/// Splits `host:port`, stripping the `redis://` scheme, a trailing `/` and the brackets of an
/// IPv6 host.
pub(crate) fn split_node_address(addr: &str) -> RedisResult<(&str, u16)> {
    let invalid = || {
        RedisError::from((
            ErrorKind::InvalidClientConfig,
            "Invalid node string",
            addr.to_string(),
        ))
    };
    let addr = addr.strip_prefix("redis://").unwrap_or(addr);
    let addr = addr.strip_suffix('/').unwrap_or(addr);
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}
