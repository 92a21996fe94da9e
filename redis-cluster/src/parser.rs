use std::{
    io::{self, Read},
    str,
};

use crate::errors::{ErrorKind, RedisError, ServerError};
use crate::types::{RedisResult, Value};

use bytes::{Buf, BytesMut};
use combine::{
    any,
    error::StreamError,
    opaque,
    parser::{
        byte::{crlf, take_until_bytes},
        combinator::{any_send_sync_partial_state, AnySendSyncPartialState},
        range::{recognize, take},
    },
    stream::{PointerOffset, RangeStream, StreamErrorFor},
    ParseError, Parser as _,
};
use tokio_util::codec::{Decoder, Encoder};

const MAX_RECURSE_DEPTH: usize = 100;

fn value<'a, I>(
    count: Option<usize>,
) -> impl combine::Parser<I, Output = Value, PartialState = AnySendSyncPartialState>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: combine::ParseError<u8, &'a [u8], I::Position>,
{
    let count = count.unwrap_or(1);

    opaque!(any_send_sync_partial_state(
        any()
            .then_partial(move |&mut b| {
                if b == b'*' && count > MAX_RECURSE_DEPTH {
                    combine::unexpected_any("Maximum recursion depth exceeded").left()
                } else {
                    combine::value(b).right()
                }
            })
            .then_partial(move |&mut b| {
                let line = || {
                    recognize(take_until_bytes(&b"\r\n"[..]).with(take(2).map(|_| ()))).and_then(
                        |line: &[u8]| {
                            str::from_utf8(&line[..line.len() - 2])
                                .map_err(StreamErrorFor::<I>::other)
                        },
                    )
                };

                let simple_string = || {
                    line().map(|line| {
                        if line == "OK" {
                            Value::Okay
                        } else {
                            Value::SimpleString(line.into())
                        }
                    })
                };

                let int = || {
                    line().and_then(|line| {
                        line.trim().parse::<i64>().map_err(|_| {
                            StreamErrorFor::<I>::message_static_message(
                                "Expected integer, got garbage",
                            )
                        })
                    })
                };

                let bulk_string = || {
                    int().then_partial(move |size| {
                        if *size < 0 {
                            combine::produce(|| Value::Nil).left()
                        } else {
                            take(*size as usize)
                                .map(|bs: &[u8]| Value::BulkString(bs.to_vec()))
                                .skip(crlf())
                                .right()
                        }
                    })
                };

                let array = || {
                    int().then_partial(move |&mut length| {
                        if length < 0 {
                            combine::produce(|| Value::Nil).left()
                        } else {
                            let length = length as usize;
                            combine::count_min_max(length, length, value(Some(count + 1)))
                                .map(Value::Array)
                                .right()
                        }
                    })
                };

                let error = || line().map(ServerError::from_line);

                combine::dispatch!(b;
                    b'+' => simple_string(),
                    b':' => int().map(Value::Int),
                    b'$' => bulk_string(),
                    b'*' => array(),
                    b'-' => error().map(Value::ServerError),
                    b => combine::unexpected_any(combine::error::Token(b))
                )
            })
    ))
}

/// A `tokio_util` codec that writes packed commands and decodes replies.
#[derive(Default)]
pub struct ValueCodec {
    state: AnySendSyncPartialState,
}

impl ValueCodec {
    fn decode_stream(&mut self, bytes: &mut BytesMut, eof: bool) -> RedisResult<Option<Value>> {
        let (opt, removed_len) = {
            let buffer = &bytes[..];
            let mut stream =
                combine::easy::Stream(combine::stream::MaybePartialStream(buffer, !eof));
            match combine::stream::decode_tokio(value(None), &mut stream, &mut self.state) {
                Ok(x) => x,
                Err(err) => {
                    let err = err
                        .map_position(|pos| pos.translate_position(buffer))
                        .map_range(|range| format!("{range:?}"))
                        .to_string();
                    return Err(RedisError::from((
                        ErrorKind::ParseError,
                        "parse error",
                        err,
                    )));
                }
            }
        };

        bytes.advance(removed_len);
        Ok(opt)
    }
}

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RedisError;
    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, false)
    }

    fn decode_eof(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, true)
    }
}

/// The internal redis response parser.
pub struct Parser {
    decoder: combine::stream::decoder::Decoder<AnySendSyncPartialState, PointerOffset<[u8]>>,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

/// The parser can be used to parse redis responses into values.  More than one value can be
/// behind the reader, in which case the parser can be invoked multiple times.
impl Parser {
    /// Creates a new parser that parses the data behind the reader.
    pub fn new() -> Parser {
        Parser {
            decoder: combine::stream::decoder::Decoder::new(),
        }
    }

    /// Parses synchronously into a single value from the reader.
    pub fn parse_value<T: Read>(&mut self, mut reader: T) -> RedisResult<Value> {
        let mut decoder = &mut self.decoder;
        let result = combine::decode!(decoder, reader, value(None), |input, _| {
            combine::stream::easy::Stream::from(input)
        });
        match result {
            Err(err) => Err(match err {
                combine::stream::decoder::Error::Io { error, .. } => error.into(),
                combine::stream::decoder::Error::Parse(err) => {
                    if err.is_unexpected_end_of_input() {
                        RedisError::from(io::Error::from(io::ErrorKind::UnexpectedEof))
                    } else {
                        let err = err
                            .map_range(|range| format!("{range:?}"))
                            .map_position(|pos| pos.translate_position(decoder.buffer()))
                            .to_string();
                        RedisError::from((ErrorKind::ParseError, "parse error", err))
                    }
                }
            }),
            Ok(result) => Ok(result),
        }
    }
}

/// Parses bytes into a redis value.
///
/// This is the most straightforward way to parse something into a low
/// level redis value instead of having to use a whole parser.
pub fn parse_redis_value(bytes: &[u8]) -> RedisResult<Value> {
    let mut parser = Parser::new();
    parser.parse_value(bytes)
}

/// Splits a buffer holding several packed values (e.g. a pipelined write) into its values.
pub fn parse_redis_values(bytes: &[u8]) -> RedisResult<Vec<Value>> {
    let mut codec = ValueCodec::default();
    let mut buffer = BytesMut::from(bytes);
    let mut values = Vec::new();
    while let Some(value) = codec.decode_eof(&mut buffer)? {
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServerErrorKind;

    #[test]
    fn decode_eof_returns_none_at_eof() {
        let mut codec = ValueCodec::default();

        let mut bytes = bytes::BytesMut::from(&b"+GET 123\r\n"[..]);
        assert_eq!(
            codec.decode_eof(&mut bytes),
            Ok(Some(parse_redis_value(b"+GET 123\r\n").unwrap()))
        );
        assert_eq!(codec.decode_eof(&mut bytes), Ok(None));
        assert_eq!(codec.decode_eof(&mut bytes), Ok(None));
    }

    #[test]
    fn decode_waits_for_the_rest_of_a_partial_reply() {
        let mut codec = ValueCodec::default();

        let mut bytes = bytes::BytesMut::from(&b"*2\r\n$3\r\nfoo"[..]);
        assert_eq!(codec.decode(&mut bytes), Ok(None));
        bytes.extend_from_slice(b"\r\n:7\r\n");
        assert_eq!(
            codec.decode(&mut bytes),
            Ok(Some(Value::Array(vec![
                Value::BulkString(b"foo".to_vec()),
                Value::Int(7)
            ])))
        );
    }

    #[test]
    fn errors_stay_in_band_inside_arrays() {
        let bytes = b"*3\r\n+OK\r\n-MOVED 3999 127.0.0.1:6381\r\n+QUEUED\r\n";
        let result = parse_redis_value(bytes).unwrap();

        let Value::Array(items) = result else {
            panic!("expected an array, got {result:?}");
        };
        assert_eq!(items[0], Value::Okay);
        assert_eq!(
            items[1].server_error().and_then(|err| err.kind()),
            Some(ServerErrorKind::Moved)
        );
        assert_eq!(items[2], Value::SimpleString("QUEUED".to_string()));
    }

    #[test]
    fn parses_several_values_from_one_buffer() {
        let values = parse_redis_values(b"+OK\r\n$-1\r\n:3\r\n").unwrap();
        assert_eq!(values, vec![Value::Okay, Value::Nil, Value::Int(3)]);
    }

    #[test]
    fn test_max_recursion_depth() {
        let bytes = b"*1\r\n".repeat(MAX_RECURSE_DEPTH + 10);
        match parse_redis_value(&bytes) {
            Ok(_) => panic!("Expected Err"),
            Err(e) => assert!(matches!(e.kind(), ErrorKind::ParseError)),
        }
    }
}
