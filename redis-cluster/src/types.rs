use std::fmt;
use std::str::from_utf8;

use crate::errors::{ErrorKind, RedisError, ServerError};

/// Library generic result type.
pub type RedisResult<T> = Result<T, RedisError>;

/// Library generic future type.
pub type RedisFuture<'a, T> = futures_util::future::BoxFuture<'a, RedisResult<T>>;

/// Internal low-level redis value enum.
///
/// Error replies are kept in-band as [`Value::ServerError`]; use [`Value::extract_error`] to turn
/// them into a [`RedisError`].
#[derive(PartialEq, Clone)]
pub enum Value {
    /// A nil response from the server.
    Nil,
    /// An integer response.  Note that there are a few situations
    /// in which redis actually returns a string for an integer which
    /// is why this library generally treats integers and strings
    /// the same for all numeric responses.
    Int(i64),
    /// An arbitrary binary data, usually represents a binary-safe string.
    BulkString(Vec<u8>),
    /// A response containing an array with more data. This is generally used by redis
    /// to express nested structures.
    Array(Vec<Value>),
    /// A simple string response, without line breaks and not binary safe.
    SimpleString(String),
    /// A status response which represents the string "OK".
    Okay,
    /// Per-node results of a broadcast command, keyed by node address.
    Map(Vec<(Value, Value)>),
    /// An error reply.
    ServerError(ServerError),
}

impl Value {
    /// Returns the bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(s) => Some(s.as_bytes()),
            Value::Okay => Some(b"OK"),
            _ => None,
        }
    }

    /// Returns the error reply carried by this value, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Value::ServerError(err) => Some(err),
            _ => None,
        }
    }

    /// Converts an in-band error reply, at the top level or nested in an array, into an `Err`.
    pub fn extract_error(self) -> RedisResult<Self> {
        match self {
            Self::Array(val) => Ok(Self::Array(Self::extract_error_vec(val)?)),
            Self::ServerError(err) => Err(err.into()),
            _ => Ok(self),
        }
    }

    pub(crate) fn extract_error_vec(vec: Vec<Self>) -> RedisResult<Vec<Self>> {
        vec.into_iter()
            .map(Self::extract_error)
            .collect::<RedisResult<Vec<Value>>>()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Nil => write!(fmt, "nil"),
            Value::Int(val) => write!(fmt, "int({val:?})"),
            Value::BulkString(ref val) => match from_utf8(val) {
                Ok(x) => write!(fmt, "bulk-string('{x:?}')"),
                Err(_) => write!(fmt, "binary-data({val:?})"),
            },
            Value::Array(ref values) => write!(fmt, "array({values:?})"),
            Value::Okay => write!(fmt, "ok"),
            Value::SimpleString(ref s) => write!(fmt, "simple-string({s:?})"),
            Value::Map(ref values) => write!(fmt, "map({values:?})"),
            Value::ServerError(ref err) => write!(fmt, "server-error({err})"),
        }
    }
}

/// Reads an integer reply, accepting the string form some servers use for numbers.
pub(crate) fn value_to_int(value: &Value) -> RedisResult<i64> {
    match value {
        Value::Int(int) => Ok(*int),
        Value::BulkString(bytes) => from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                RedisError::from((
                    ErrorKind::UnexpectedReturnType,
                    "Expected an integer",
                    format!("{value:?}"),
                ))
            }),
        _ => Err(RedisError::from((
            ErrorKind::UnexpectedReturnType,
            "Expected an integer",
            format!("{value:?}"),
        ))),
    }
}

/// Abstraction trait for redis command abstractions.
pub trait RedisWrite {
    /// Accepts a serialized redis command.
    fn write_arg(&mut self, arg: &[u8]);

    /// Accepts a serialized redis command.
    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        self.write_arg(arg.to_string().as_bytes())
    }
}

impl RedisWrite for Vec<Vec<u8>> {
    fn write_arg(&mut self, arg: &[u8]) {
        self.push(arg.to_owned());
    }

    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        self.push(arg.to_string().into_bytes())
    }
}

/// Used to convert a value into one or multiple redis argument
/// strings.  Most values will produce exactly one item but in
/// some cases it might make sense to produce more than one.
pub trait ToRedisArgs: Sized {
    /// This converts the value into a vector of bytes.  Each item
    /// is a single argument.  Most items generate a vector of a
    /// single item.
    fn to_redis_args(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.write_redis_args(&mut out);
        out
    }

    /// This writes the value into a vector of bytes.  Each item
    /// is a single argument.  Most items generate a single item.
    ///
    /// The exception to this rule currently are vectors of items.
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite;

    /// This only exists internally as a workaround for the lack of
    /// specialization.
    #[doc(hidden)]
    fn write_args_from_slice<W>(items: &[Self], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        for item in items {
            item.write_redis_args(out);
        }
    }
}

macro_rules! itoa_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::itoa::Buffer::new();
                let s = buf.format(*self);
                out.write_arg(s.as_bytes())
            }
        }
    };
}

impl ToRedisArgs for u8 {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        let mut buf = ::itoa::Buffer::new();
        let s = buf.format(*self);
        out.write_arg(s.as_bytes())
    }

    fn write_args_from_slice<W>(items: &[u8], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(items);
    }
}

itoa_based_to_redis_impl!(i8);
itoa_based_to_redis_impl!(i16);
itoa_based_to_redis_impl!(u16);
itoa_based_to_redis_impl!(i32);
itoa_based_to_redis_impl!(u32);
itoa_based_to_redis_impl!(i64);
itoa_based_to_redis_impl!(u64);
itoa_based_to_redis_impl!(isize);
itoa_based_to_redis_impl!(usize);

impl ToRedisArgs for String {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl ToRedisArgs for &str {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl<T: ToRedisArgs> ToRedisArgs for Vec<T> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &[T] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs, const N: usize> ToRedisArgs for &[T; N] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        ToRedisArgs::write_args_from_slice(self.as_slice(), out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &T {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        (*self).write_redis_args(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_slices_are_single_arguments() {
        assert_eq!(b"foo".to_redis_args(), vec![b"foo".to_vec()]);
        assert_eq!(vec![1u8, 2].to_redis_args(), vec![vec![1u8, 2]]);
        assert_eq!(
            vec!["a", "b"].to_redis_args(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(42i64.to_redis_args(), vec![b"42".to_vec()]);
    }

    #[test]
    fn extract_error_reaches_into_arrays() {
        let value = Value::Array(vec![
            Value::Okay,
            Value::ServerError(ServerError::from_line("ERR boom")),
        ]);
        assert!(value.extract_error().is_err());
        assert_eq!(Value::Int(1).extract_error(), Ok(Value::Int(1)));
    }

    #[test]
    fn integers_can_be_read_from_strings() {
        assert_eq!(value_to_int(&Value::BulkString(b"12".to_vec())), Ok(12));
        assert!(value_to_int(&Value::Nil).is_err());
    }
}
