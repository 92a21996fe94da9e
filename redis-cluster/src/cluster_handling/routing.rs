use std::cmp::{max, min};

use arcstr::ArcStr;

use crate::cluster_handling::slot_map::SLOT_SIZE;
use crate::cmd::Cmd;
use crate::types::{value_to_int, Value};
use crate::{ErrorKind, RedisError, RedisResult};

fn slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_SIZE
}

/// Returns the slot that matches `key`.
///
/// Only the hash tag is hashed when the key has one, so `{user1}.name` and `{user1}.age` share a
/// slot.
pub fn get_slot(key: &[u8]) -> u16 {
    let key = match get_hashtag(key) {
        Some(tag) => tag,
        None => key,
    };

    slot(key)
}

fn get_hashtag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|v| *v == b'{')?;

    let close = key[open..].iter().position(|v| *v == b'}')?;

    let rv = &key[open + 1..open + close];
    (!rv.is_empty()).then_some(rv)
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) enum Redirect {
    Moved(ArcStr),
    Ask(ArcStr),
}

/// Logical bitwise aggregating operators.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum LogicalAggregateOp {
    /// Aggregate by bitwise &&
    And,
    /// Aggregate by bitwise ||
    Or,
}

/// Numerical aggregating operators.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum AggregateOp {
    /// Choose minimal value
    Min,
    /// Sum all values
    Sum,
    /// Choose maximal value
    Max,
}

/// Policy defining how to combine multiple responses into one.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum ResponsePolicy {
    /// Wait for one request to succeed and return its results. Return error if all requests fail.
    OneSucceeded,
    /// Returns the first succeeded non-empty result; if all results are empty, returns `Nil`;
    /// otherwise, returns the last received error.
    FirstSucceededNonEmptyOrAllEmpty,
    /// Waits for all requests to succeed, and the returns one of the successes. Returns the error
    /// on the first received error.
    AllSucceeded,
    /// Waits for all requests to succeed and checks that every node answered the same value.
    AllEqual,
    /// Aggregate success results according to a logical bitwise operator. Return error on any
    /// failed request or on a response that doesn't conform to 0 or 1.
    AggregateLogical(LogicalAggregateOp),
    /// Aggregate success results according to a numeric operator. Return error on any failed
    /// request or on a response that isn't an integer, or when a sum overflows.
    Aggregate(AggregateOp),
    /// Aggregate array responses into a single array. Return error on any failed request or on a
    /// response that isn't an array.
    CombineArrays,
}

/// Defines whether a request should be routed to a single node, or multiple ones.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RoutingInfo {
    /// Route to single node
    SingleNode(SingleNodeRoutingInfo),
    /// Route to multiple nodes
    MultiNode((MultipleNodeRoutingInfo, Option<ResponsePolicy>)),
}

/// Defines which single node should receive a request.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SingleNodeRoutingInfo {
    /// Route to any node at random
    Random,
    /// Route to any *primary* node
    RandomPrimary,
    /// Route to the node that matches the [Route]
    SpecificNode(Route),
    /// Route to the node with the given address.
    ByAddress {
        /// DNS hostname of the node
        host: String,
        /// port of the node
        port: u16,
    },
}

/// Defines which collection of nodes should receive a request
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum MultipleNodeRoutingInfo {
    /// Route to all nodes in the clusters
    AllNodes,
    /// Route to all primaries in the cluster
    AllMasters,
}

/// Defines which node of a slot should serve a request.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
#[non_exhaustive]
pub enum SlotAddr {
    /// The request must be routed to primary node
    Master,
    /// The request may be routed to a replica node.
    /// For example, a GET command can be routed either to replica or primary.
    ReplicaOptional,
}

/// Defines the slot and the [`SlotAddr`] to which
/// a command should be sent
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
pub struct Route(u16, SlotAddr);

impl Route {
    /// Returns a new Route.
    pub fn new(slot: u16, slot_addr: SlotAddr) -> Self {
        Self(slot, slot_addr)
    }

    /// Returns the slot number of the route.
    pub fn slot(&self) -> u16 {
        self.0
    }

    /// Returns the slot address of the route.
    pub fn slot_addr(&self) -> SlotAddr {
        self.1
    }
}

/// Aggreagte numeric responses.
pub(crate) fn aggregate(values: Vec<Value>, op: AggregateOp) -> RedisResult<Value> {
    let initial_value = match op {
        AggregateOp::Min => i64::MAX,
        AggregateOp::Sum => 0,
        AggregateOp::Max => i64::MIN,
    };
    let result = values.into_iter().try_fold(initial_value, |acc, curr| {
        let int = value_to_int(&curr)?;
        Ok::<_, RedisError>(match op {
            AggregateOp::Min => min(acc, int),
            AggregateOp::Sum => acc.checked_add(int).ok_or_else(|| {
                RedisError::from((
                    ErrorKind::UnexpectedReturnType,
                    "integer overflow while summing responses",
                ))
            })?,
            AggregateOp::Max => max(acc, int),
        })
    })?;
    Ok(Value::Int(result))
}

/// Aggreagte numeric responses by a boolean operator.
pub(crate) fn logical_aggregate(values: Vec<Value>, op: LogicalAggregateOp) -> RedisResult<Value> {
    let initial_value = match op {
        LogicalAggregateOp::And => true,
        LogicalAggregateOp::Or => false,
    };
    let results = values.into_iter().try_fold(Vec::new(), |acc, curr| {
        let values = match curr {
            Value::Array(values) => values,
            _ => {
                return RedisResult::Err(
                    (
                        ErrorKind::UnexpectedReturnType,
                        "expected array of integers as response",
                    )
                        .into(),
                );
            }
        };
        let mut acc = if acc.is_empty() {
            vec![initial_value; values.len()]
        } else {
            acc
        };
        if acc.len() != values.len() {
            return Err((
                ErrorKind::UnexpectedReturnType,
                "nodes returned arrays of different lengths",
            )
                .into());
        }
        for (index, value) in values.into_iter().enumerate() {
            let int = value_to_int(&value)?;
            acc[index] = match op {
                LogicalAggregateOp::And => acc[index] && (int > 0),
                LogicalAggregateOp::Or => acc[index] || (int > 0),
            };
        }
        Ok(acc)
    })?;
    Ok(Value::Array(
        results
            .into_iter()
            .map(|result| Value::Int(result as i64))
            .collect(),
    ))
}

/// Aggregate array responses into a single array.
pub(crate) fn combine_array_results(values: Vec<Value>) -> RedisResult<Value> {
    let mut results = Vec::new();

    for value in values {
        match value {
            Value::Array(values) => results.extend(values),
            Value::Nil => {}
            _ => {
                return Err((
                    ErrorKind::UnexpectedReturnType,
                    "expected array of values as response",
                )
                    .into());
            }
        }
    }

    Ok(Value::Array(results))
}

/// Returns the single value every node agreed on.
pub(crate) fn all_equal_result(values: Vec<Value>) -> RedisResult<Value> {
    let mut iter = values.into_iter();
    let first = iter.next().unwrap_or(Value::Nil);
    for value in iter {
        if value != first {
            return Err(RedisError::from((
                ErrorKind::UnexpectedReturnType,
                "Nodes returned different results",
                format!("{first:?} vs {value:?}"),
            )));
        }
    }
    Ok(first)
}

impl ResponsePolicy {
    /// Parse the command for the matching response policy.
    pub(crate) fn for_command(cmd: &[u8]) -> Option<ResponsePolicy> {
        match cmd {
            b"SCRIPT EXISTS" => Some(ResponsePolicy::AggregateLogical(LogicalAggregateOp::And)),

            b"DBSIZE" | b"SLOWLOG LEN" | b"LATENCY RESET" | b"PUBSUB NUMPAT" => {
                Some(ResponsePolicy::Aggregate(AggregateOp::Sum))
            }

            b"WAIT" => Some(ResponsePolicy::Aggregate(AggregateOp::Min)),

            b"LASTSAVE" => Some(ResponsePolicy::Aggregate(AggregateOp::Max)),

            b"CLIENT SETINFO" | b"CONFIG SET" | b"CONFIG RESETSTAT" | b"CONFIG REWRITE"
            | b"FLUSHALL" | b"FLUSHDB" | b"FUNCTION DELETE" | b"FUNCTION FLUSH"
            | b"FUNCTION RESTORE" | b"MEMORY PURGE" | b"PING" | b"SCRIPT FLUSH"
            | b"SLOWLOG RESET" | b"UNWATCH" | b"SHUTDOWN" => Some(ResponsePolicy::AllSucceeded),

            b"SCRIPT LOAD" | b"FUNCTION LOAD" => Some(ResponsePolicy::AllEqual),

            b"KEYS" | b"SLOWLOG GET" | b"PUBSUB CHANNELS" | b"PUBSUB SHARDCHANNELS" => {
                Some(ResponsePolicy::CombineArrays)
            }

            b"FUNCTION KILL" => Some(ResponsePolicy::OneSucceeded),

            b"RANDOMKEY" => Some(ResponsePolicy::FirstSucceededNonEmptyOrAllEmpty),

            _ => None,
        }
    }
}

enum RouteBy {
    AllNodes,
    AllPrimaries,
    /// `CMD key ...`
    FirstKey,
    /// `CMD key [key ...]`
    AllArgs,
    /// `BITOP op destkey key [key ...]`
    AllArgsFromSecond,
    /// `BLPOP key [key ...] timeout`
    AllButLastArg,
    /// `RENAME key newkey`
    FirstTwoArgs,
    /// `MSET key value [key value ...]`
    KeyValuePairs,
    /// `XINFO GROUPS key`
    SecondArg,
    /// `ZUNION numkeys key [key ...]`
    SecondArgAfterKeyCount,
    /// `EVAL script numkeys key [key ...]`
    ThirdArgAfterKeyCount,
    /// `ZUNIONSTORE destination numkeys key [key ...]`
    DestinationAndKeyCount,
    /// `XREAD ... STREAMS key [key ...] id [id ...]`
    StreamsIndex,
    Random,
    SecondArgSlot,
}

fn base_routing(cmd: &[u8]) -> RouteBy {
    match cmd {
        b"CLIENT SETINFO"
        | b"SLOWLOG GET"
        | b"SLOWLOG LEN"
        | b"SLOWLOG RESET"
        | b"CONFIG SET"
        | b"CONFIG RESETSTAT"
        | b"CONFIG REWRITE"
        | b"SCRIPT FLUSH"
        | b"SCRIPT LOAD"
        | b"LATENCY RESET"
        | b"LATENCY DOCTOR"
        | b"LATENCY LATEST"
        | b"PUBSUB NUMPAT"
        | b"PUBSUB CHANNELS"
        | b"PUBSUB SHARDCHANNELS"
        | b"FUNCTION KILL"
        | b"FUNCTION STATS"
        | b"SHUTDOWN" => RouteBy::AllNodes,

        b"DBSIZE"
        | b"FLUSHALL"
        | b"FLUSHDB"
        | b"FUNCTION DELETE"
        | b"FUNCTION FLUSH"
        | b"FUNCTION LOAD"
        | b"FUNCTION RESTORE"
        | b"INFO"
        | b"KEYS"
        | b"LASTSAVE"
        | b"MEMORY DOCTOR"
        | b"MEMORY MALLOC-STATS"
        | b"MEMORY PURGE"
        | b"MEMORY STATS"
        | b"PING"
        | b"SCAN"
        | b"SCRIPT EXISTS"
        | b"UNWATCH"
        | b"WAIT"
        | b"RANDOMKEY" => RouteBy::AllPrimaries,

        b"MGET" | b"DEL" | b"EXISTS" | b"UNLINK" | b"TOUCH" | b"WATCH" | b"SINTER"
        | b"SUNION" | b"SDIFF" | b"SINTERSTORE" | b"SUNIONSTORE" | b"SDIFFSTORE" | b"PFCOUNT"
        | b"PFMERGE" => RouteBy::AllArgs,

        b"BLPOP" | b"BRPOP" | b"BZPOPMIN" | b"BZPOPMAX" => RouteBy::AllButLastArg,

        b"RENAME" | b"RENAMENX" | b"SMOVE" | b"LMOVE" | b"BLMOVE" | b"RPOPLPUSH"
        | b"BRPOPLPUSH" | b"COPY" | b"LCS" | b"GEOSEARCHSTORE" | b"ZRANGESTORE" => {
            RouteBy::FirstTwoArgs
        }

        b"MSET" | b"MSETNX" => RouteBy::KeyValuePairs,

        b"BITOP" => RouteBy::AllArgsFromSecond,

        b"BLMPOP" | b"BZMPOP" | b"EVAL" | b"EVALSHA" | b"EVALSHA_RO" | b"EVAL_RO" | b"FCALL"
        | b"FCALL_RO" => RouteBy::ThirdArgAfterKeyCount,

        b"MEMORY USAGE"
        | b"XGROUP CREATE"
        | b"XGROUP CREATECONSUMER"
        | b"XGROUP DELCONSUMER"
        | b"XGROUP DESTROY"
        | b"XGROUP SETID"
        | b"XINFO CONSUMERS"
        | b"XINFO GROUPS"
        | b"XINFO STREAM"
        | b"OBJECT ENCODING"
        | b"OBJECT FREQ"
        | b"OBJECT IDLETIME"
        | b"OBJECT REFCOUNT" => RouteBy::SecondArg,

        b"LMPOP" | b"SINTERCARD" | b"ZDIFF" | b"ZINTER" | b"ZINTERCARD" | b"ZMPOP" | b"ZUNION" => {
            RouteBy::SecondArgAfterKeyCount
        }

        b"ZUNIONSTORE" | b"ZINTERSTORE" | b"ZDIFFSTORE" => RouteBy::DestinationAndKeyCount,

        b"XREAD" | b"XREADGROUP" => RouteBy::StreamsIndex,

        // keyless commands whose arguments might be wrongly taken to be keys.
        b"AUTH"
        | b"BGSAVE"
        | b"BGREWRITEAOF"
        | b"CLIENT GETNAME"
        | b"CLIENT ID"
        | b"CLIENT INFO"
        | b"CLIENT LIST"
        | b"CLUSTER COUNT-FAILURE-REPORTS"
        | b"CLUSTER INFO"
        | b"CLUSTER KEYSLOT"
        | b"CLUSTER MYID"
        | b"CLUSTER NODES"
        | b"CLUSTER REPLICAS"
        | b"CLUSTER SHARDS"
        | b"CLUSTER SLOTS"
        | b"COMMAND COUNT"
        | b"COMMAND GETKEYS"
        | b"COMMAND LIST"
        | b"COMMAND"
        | b"CONFIG GET"
        | b"ECHO"
        | b"FUNCTION LIST"
        | b"LOLWUT"
        | b"READONLY"
        | b"READWRITE"
        | b"SAVE"
        | b"SCRIPT SHOW"
        | b"TIME" => RouteBy::Random,

        b"CLUSTER ADDSLOTS"
        | b"CLUSTER COUNTKEYSINSLOT"
        | b"CLUSTER DELSLOTS"
        | b"CLUSTER GETKEYSINSLOT"
        | b"CLUSTER SETSLOT" => RouteBy::SecondArgSlot,

        _ => RouteBy::FirstKey,
    }
}

/// Commands that cannot be served by a cluster at all.
fn is_blocked_cmd(cmd: &[u8]) -> bool {
    matches!(
        cmd,
        b"MOVE"
            | b"SELECT"
            | b"SWAPDB"
            | b"SLAVEOF"
            | b"REPLICAOF"
            | b"SENTINEL"
            | b"MIGRATE"
            | b"MONITOR"
            | b"MULTI"
            | b"EXEC"
            | b"DISCARD"
            | b"SUBSCRIBE"
            | b"PSUBSCRIBE"
            | b"SSUBSCRIBE"
            | b"UNSUBSCRIBE"
            | b"PUNSUBSCRIBE"
            | b"SUNSUBSCRIBE"
            | b"SCRIPT KILL"
            | b"CLIENT SETNAME"
    )
}

/// Whether a command can be served by a replica.
pub(crate) fn is_readonly_cmd(cmd: &[u8]) -> bool {
    matches!(
        cmd,
        b"BITCOUNT"
            | b"BITPOS"
            | b"DUMP"
            | b"EVALSHA_RO"
            | b"EVAL_RO"
            | b"EXISTS"
            | b"EXPIRETIME"
            | b"FCALL_RO"
            | b"GEODIST"
            | b"GEOHASH"
            | b"GEOPOS"
            | b"GEOSEARCH"
            | b"GET"
            | b"GETBIT"
            | b"GETRANGE"
            | b"HEXISTS"
            | b"HGET"
            | b"HGETALL"
            | b"HKEYS"
            | b"HLEN"
            | b"HMGET"
            | b"HRANDFIELD"
            | b"HSCAN"
            | b"HSTRLEN"
            | b"HVALS"
            | b"LCS"
            | b"LINDEX"
            | b"LLEN"
            | b"LPOS"
            | b"LRANGE"
            | b"MEMORY USAGE"
            | b"MGET"
            | b"OBJECT ENCODING"
            | b"OBJECT FREQ"
            | b"OBJECT IDLETIME"
            | b"OBJECT REFCOUNT"
            | b"PEXPIRETIME"
            | b"PFCOUNT"
            | b"PTTL"
            | b"SCARD"
            | b"SDIFF"
            | b"SINTER"
            | b"SINTERCARD"
            | b"SISMEMBER"
            | b"SMEMBERS"
            | b"SMISMEMBER"
            | b"SORT_RO"
            | b"SRANDMEMBER"
            | b"SSCAN"
            | b"STRLEN"
            | b"SUNION"
            | b"TOUCH"
            | b"TTL"
            | b"TYPE"
            | b"XINFO CONSUMERS"
            | b"XINFO GROUPS"
            | b"XINFO STREAM"
            | b"XLEN"
            | b"XPENDING"
            | b"XRANGE"
            | b"XREAD"
            | b"XREVRANGE"
            | b"ZCARD"
            | b"ZCOUNT"
            | b"ZDIFF"
            | b"ZINTER"
            | b"ZINTERCARD"
            | b"ZLEXCOUNT"
            | b"ZMSCORE"
            | b"ZRANDMEMBER"
            | b"ZRANGE"
            | b"ZRANGEBYLEX"
            | b"ZRANGEBYSCORE"
            | b"ZRANK"
            | b"ZREVRANGE"
            | b"ZREVRANGEBYLEX"
            | b"ZREVRANGEBYSCORE"
            | b"ZREVRANK"
            | b"ZSCAN"
            | b"ZSCORE"
            | b"ZUNION"
    )
}

/// Returns the uppercased command name (two words for container commands such as `CONFIG GET`),
/// failing with `CommandNotAllowed` when a cluster cannot serve it.
pub(crate) fn checked_command<R>(r: &R) -> RedisResult<Vec<u8>>
where
    R: Routable + ?Sized,
{
    let primary = r
        .arg_idx(0)
        .map(|x| x.to_ascii_uppercase())
        .ok_or((ErrorKind::ClientError, "Empty command"))?;
    let blocked = |cmd: &[u8]| {
        RedisError::from((
            ErrorKind::CommandNotAllowed,
            "Command is not supported in cluster mode",
            command_name_for_error(cmd),
        ))
    };
    if is_blocked_cmd(&primary) {
        return Err(blocked(&primary));
    }
    let cmd = r.command().unwrap_or(primary);
    if is_blocked_cmd(&cmd) {
        return Err(blocked(&cmd));
    }
    Ok(cmd)
}

fn command_name_for_error(cmd: &[u8]) -> String {
    String::from_utf8_lossy(cmd).into_owned()
}

fn parse_key_count<R>(r: &R, idx: usize, cmd: &[u8]) -> RedisResult<usize>
where
    R: Routable + ?Sized,
{
    r.arg_idx(idx)
        .and_then(|x| std::str::from_utf8(x).ok())
        .and_then(|x| x.parse::<usize>().ok())
        .ok_or_else(|| {
            RedisError::from((
                ErrorKind::ClientError,
                "Invalid number of keys",
                command_name_for_error(cmd),
            ))
        })
}

fn args_range<R>(r: &R, start: usize, end: Option<usize>) -> Vec<&[u8]>
where
    R: Routable + ?Sized,
{
    (start..)
        .take_while(|idx| end.map_or(true, |end| *idx < end))
        .map_while(|idx| r.arg_idx(idx))
        .collect()
}

/// Extracts the keys of a key-based command. `None` means the command carries no keys and may go
/// anywhere (e.g. `EVAL` with zero keys).
fn keys_for<'a, R>(r: &'a R, cmd: &[u8], route_by: &RouteBy) -> RedisResult<Option<Vec<&'a [u8]>>>
where
    R: Routable + ?Sized,
{
    let keys = match route_by {
        RouteBy::FirstKey => r.arg_idx(1).into_iter().collect(),
        RouteBy::AllArgs => args_range(r, 1, None),
        RouteBy::AllArgsFromSecond => args_range(r, 2, None),
        RouteBy::AllButLastArg => {
            let mut keys = args_range(r, 1, None);
            keys.pop();
            keys
        }
        RouteBy::FirstTwoArgs => args_range(r, 1, Some(3)),
        RouteBy::KeyValuePairs => args_range(r, 1, None).into_iter().step_by(2).collect(),
        RouteBy::SecondArg => r.arg_idx(2).into_iter().collect(),
        RouteBy::SecondArgAfterKeyCount => {
            let key_count = parse_key_count(r, 1, cmd)?;
            if key_count == 0 {
                return Ok(None);
            }
            args_range(r, 2, Some(2 + key_count))
        }
        RouteBy::ThirdArgAfterKeyCount => {
            let key_count = parse_key_count(r, 2, cmd)?;
            if key_count == 0 {
                return Ok(None);
            }
            args_range(r, 3, Some(3 + key_count))
        }
        RouteBy::DestinationAndKeyCount => {
            let key_count = parse_key_count(r, 2, cmd)?;
            let mut keys: Vec<&[u8]> = r.arg_idx(1).into_iter().collect();
            keys.extend(args_range(r, 3, Some(3 + key_count)));
            keys
        }
        RouteBy::StreamsIndex => match r.position(b"STREAMS") {
            Some(streams_position) => {
                let rest = args_range(r, streams_position + 1, None);
                let key_count = rest.len() / 2;
                rest.into_iter().take(key_count).collect()
            }
            None => Vec::new(),
        },
        RouteBy::AllNodes
        | RouteBy::AllPrimaries
        | RouteBy::Random
        | RouteBy::SecondArgSlot => return Ok(None),
    };

    if keys.is_empty() {
        return Err(RedisError::from((
            ErrorKind::ClientError,
            "Command has no key argument",
            command_name_for_error(cmd),
        )));
    }
    Ok(Some(keys))
}

/// Returns the single slot every key hashes to.
pub(crate) fn slot_for_keys(keys: &[&[u8]], cmd: &[u8]) -> RedisResult<u16> {
    let mut slots = keys.iter().map(|key| get_slot(key));
    let first = slots.next().ok_or_else(|| {
        RedisError::from((
            ErrorKind::ClientError,
            "Command has no key argument",
            command_name_for_error(cmd),
        ))
    })?;
    if let Some(other) = slots.find(|slot| *slot != first) {
        return Err(RedisError::from((
            ErrorKind::CrossSlot,
            "Keys in request don't hash to the same slot",
            format!(
                "{}: slots {first} and {other}",
                command_name_for_error(cmd)
            ),
        )));
    }
    Ok(first)
}

impl RoutingInfo {
    /// Returns the routing info for `r`.
    ///
    /// Blocked commands, commands whose keys span slots and key-based commands without a key fail
    /// here, before anything is sent.
    pub fn for_routable<R>(r: &R) -> RedisResult<RoutingInfo>
    where
        R: Routable + ?Sized,
    {
        let cmd = checked_command(r)?;
        let cmd = &cmd[..];
        let route_by = base_routing(cmd);
        match route_by {
            RouteBy::AllNodes => Ok(RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllNodes,
                ResponsePolicy::for_command(cmd),
            ))),

            RouteBy::AllPrimaries => Ok(RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllMasters,
                ResponsePolicy::for_command(cmd),
            ))),

            RouteBy::Random => Ok(RoutingInfo::SingleNode(SingleNodeRoutingInfo::Random)),

            RouteBy::SecondArgSlot => r
                .arg_idx(2)
                .and_then(|arg| std::str::from_utf8(arg).ok())
                .and_then(|slot| slot.parse::<u16>().ok())
                .filter(|slot| *slot < SLOT_SIZE)
                .map(|slot| {
                    RoutingInfo::SingleNode(SingleNodeRoutingInfo::SpecificNode(Route::new(
                        slot,
                        SlotAddr::Master,
                    )))
                })
                .ok_or_else(|| {
                    RedisError::from((
                        ErrorKind::ClientError,
                        "Command requires a valid slot argument",
                        command_name_for_error(cmd),
                    ))
                }),

            _ => match keys_for(r, cmd, &route_by)? {
                None => Ok(RoutingInfo::SingleNode(SingleNodeRoutingInfo::Random)),
                Some(keys) => {
                    let slot = slot_for_keys(&keys, cmd)?;
                    let slot_addr = if is_readonly_cmd(cmd) {
                        SlotAddr::ReplicaOptional
                    } else {
                        SlotAddr::Master
                    };
                    Ok(RoutingInfo::SingleNode(SingleNodeRoutingInfo::SpecificNode(
                        Route::new(slot, slot_addr),
                    )))
                }
            },
        }
    }
}

/// Objects that implement this trait define a request that can be routed by a cluster client to
/// different nodes in the cluster.
pub trait Routable {
    /// Convenience function to return ascii uppercase version of the
    /// the first argument (i.e., the command).
    fn command(&self) -> Option<Vec<u8>> {
        let primary_command = self.arg_idx(0).map(|x| x.to_ascii_uppercase())?;
        let mut primary_command = match primary_command.as_slice() {
            b"XGROUP" | b"OBJECT" | b"SLOWLOG" | b"FUNCTION" | b"MODULE" | b"COMMAND"
            | b"PUBSUB" | b"CONFIG" | b"MEMORY" | b"XINFO" | b"CLIENT" | b"SCRIPT"
            | b"CLUSTER" | b"LATENCY" => primary_command,
            _ => {
                return Some(primary_command);
            }
        };

        Some(match self.arg_idx(1) {
            Some(secondary_command) => {
                let previous_len = primary_command.len();
                primary_command.reserve(secondary_command.len() + 1);
                primary_command.extend(b" ");
                primary_command.extend(secondary_command);
                let current_len = primary_command.len();
                primary_command[previous_len + 1..current_len].make_ascii_uppercase();
                primary_command
            }
            None => primary_command,
        })
    }

    /// Returns a reference to the data for the argument at `idx`.
    fn arg_idx(&self, idx: usize) -> Option<&[u8]>;

    /// Returns index of argument that matches `candidate`, if it exists
    fn position(&self, candidate: &[u8]) -> Option<usize>;
}

impl Routable for Cmd {
    fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        self.arg_idx(idx)
    }

    fn position(&self, candidate: &[u8]) -> Option<usize> {
        self.args_iter().position(|a| a.eq_ignore_ascii_case(candidate))
    }
}

impl Routable for Value {
    fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        match self {
            Value::Array(args) => match args.get(idx) {
                Some(Value::BulkString(data)) => Some(&data[..]),
                _ => None,
            },
            _ => None,
        }
    }

    fn position(&self, candidate: &[u8]) -> Option<usize> {
        match self {
            Value::Array(args) => args.iter().position(|a| match a {
                Value::BulkString(d) => d.eq_ignore_ascii_case(candidate),
                _ => false,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests_routing {
    use super::{
        get_slot, slot, AggregateOp, LogicalAggregateOp, MultipleNodeRoutingInfo,
        ResponsePolicy, Route, RoutingInfo, SingleNodeRoutingInfo, SlotAddr,
    };
    use crate::{cmd, parser::parse_redis_value, ErrorKind, Value};
    use assert_matches::assert_matches;

    #[test]
    fn test_slot_matches_reference_values() {
        assert_eq!(get_slot(b"foo"), 12182);
        assert_eq!(get_slot(b"123456789"), 12739);
        assert_eq!(get_slot(b""), 0);
    }

    #[test]
    fn test_hashtag_rules() {
        assert_eq!(
            get_slot(b"{user1000}.following"),
            get_slot(b"{user1000}.followers")
        );
        assert_eq!(get_slot(b"{user1000}.following"), slot(b"user1000"));
        assert_eq!(get_slot(b"foo{bar}{zap}"), slot(b"bar"));
        assert_eq!(get_slot(b"foo{{bar}}zap"), slot(b"{bar"));
        // An empty tag hashes the whole key.
        assert_eq!(get_slot(b"foo{}{bar}"), slot(b"foo{}{bar}"));
        assert_eq!(get_slot(b"foo{bar"), slot(b"foo{bar"));
        assert_eq!(get_slot(b"foo}bar{"), slot(b"foo}bar{"));
    }

    #[test]
    fn test_slot_is_always_in_range_and_stable() {
        for i in 0..2000u32 {
            let key = format!("key:{i}:{}", i.wrapping_mul(2654435761));
            let first = get_slot(key.as_bytes());
            assert!(first < 16384);
            assert_eq!(first, get_slot(key.as_bytes()));
            let tagged = format!("{{{key}}}suffix{i}");
            assert_eq!(get_slot(tagged.as_bytes()), first);
        }
    }

    #[test]
    fn test_routing_info_mixed_capatalization() {
        let mut upper = cmd("XREAD");
        upper.arg("STREAMS").arg("foo").arg(0);

        let mut lower = cmd("xread");
        lower.arg("streams").arg("foo").arg(0);

        assert_eq!(
            RoutingInfo::for_routable(&upper).unwrap(),
            RoutingInfo::for_routable(&lower).unwrap()
        );
    }

    #[test]
    fn test_routing_info_matches_for_packed_commands() {
        let mut test_cmds = vec![];

        let mut test_cmd = cmd("FLUSHALL");
        test_cmd.arg("");
        test_cmds.push(test_cmd);

        test_cmd = cmd("ECHO");
        test_cmd.arg("");
        test_cmds.push(test_cmd);

        test_cmd = cmd("SET");
        test_cmd.arg("42");
        test_cmds.push(test_cmd);

        test_cmd = cmd("XINFO");
        test_cmd.arg("GROUPS").arg("FOOBAR");
        test_cmds.push(test_cmd);

        test_cmd = cmd("EVAL");
        test_cmd.arg("FOO").arg("0").arg("BAR");
        test_cmds.push(test_cmd);

        test_cmd = cmd("EVAL");
        test_cmd.arg("FOO").arg("1").arg("BAR");
        test_cmds.push(test_cmd);

        test_cmd = cmd("XREAD");
        test_cmd.arg("FOO").arg("STREAMS").arg("4").arg("0");
        test_cmds.push(test_cmd);

        for cmd in test_cmds {
            let value = parse_redis_value(&cmd.get_packed_command()).unwrap();
            assert_eq!(
                RoutingInfo::for_routable(&value).unwrap(),
                RoutingInfo::for_routable(&cmd).unwrap(),
            );
        }
    }

    #[test]
    fn test_broadcast_routing_and_policies() {
        for cmd in [cmd("FLUSHALL"), cmd("FLUSHDB"), cmd("PING")] {
            assert_eq!(
                RoutingInfo::for_routable(&cmd).unwrap(),
                RoutingInfo::MultiNode((
                    MultipleNodeRoutingInfo::AllMasters,
                    Some(ResponsePolicy::AllSucceeded)
                ))
            );
        }

        assert_eq!(
            RoutingInfo::for_routable(&cmd("DBSIZE")).unwrap(),
            RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllMasters,
                Some(ResponsePolicy::Aggregate(AggregateOp::Sum))
            ))
        );

        assert_eq!(
            RoutingInfo::for_routable(cmd("SCRIPT").arg("EXISTS").arg("abc")).unwrap(),
            RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllMasters,
                Some(ResponsePolicy::AggregateLogical(LogicalAggregateOp::And))
            ))
        );

        assert_eq!(
            RoutingInfo::for_routable(cmd("SCRIPT").arg("LOAD").arg("return 1")).unwrap(),
            RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllNodes,
                Some(ResponsePolicy::AllEqual)
            ))
        );

        assert_eq!(
            RoutingInfo::for_routable(&cmd("INFO")).unwrap(),
            RoutingInfo::MultiNode((MultipleNodeRoutingInfo::AllMasters, None))
        );

        assert_eq!(
            RoutingInfo::for_routable(cmd("KEYS").arg("*")).unwrap(),
            RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllMasters,
                Some(ResponsePolicy::CombineArrays)
            ))
        );

        assert_eq!(
            RoutingInfo::for_routable(&cmd("SHUTDOWN")).unwrap(),
            RoutingInfo::MultiNode((
                MultipleNodeRoutingInfo::AllNodes,
                Some(ResponsePolicy::AllSucceeded)
            ))
        );
    }

    #[test]
    fn test_key_based_routing() {
        for (cmd, expected) in [
            (
                cmd("EVAL")
                    .arg(r#"redis.call("GET, KEYS[1]");"#)
                    .arg(1)
                    .arg("foo")
                    .clone(),
                Route::new(slot(b"foo"), SlotAddr::Master),
            ),
            (
                cmd("XGROUP")
                    .arg("CREATE")
                    .arg("mystream")
                    .arg("workers")
                    .arg("$")
                    .arg("MKSTREAM")
                    .clone(),
                Route::new(slot(b"mystream"), SlotAddr::Master),
            ),
            (
                cmd("XINFO").arg("GROUPS").arg("foo").clone(),
                Route::new(slot(b"foo"), SlotAddr::ReplicaOptional),
            ),
            (
                cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg("wkrs")
                    .arg("consmrs")
                    .arg("STREAMS")
                    .arg("mystream")
                    .arg(">")
                    .clone(),
                Route::new(slot(b"mystream"), SlotAddr::Master),
            ),
            (
                cmd("GET").arg("foo").clone(),
                Route::new(12182, SlotAddr::ReplicaOptional),
            ),
            (
                cmd("DEL").arg("foo").arg("{foo}bar").arg("{foo}baz").clone(),
                Route::new(12182, SlotAddr::Master),
            ),
            (
                cmd("MSET")
                    .arg("{tag}a")
                    .arg("1")
                    .arg("{tag}b")
                    .arg("2")
                    .clone(),
                Route::new(slot(b"tag"), SlotAddr::Master),
            ),
            (
                cmd("BLPOP").arg("{q}1").arg("{q}2").arg("0").clone(),
                Route::new(slot(b"q"), SlotAddr::Master),
            ),
            (
                cmd("ZUNIONSTORE")
                    .arg("{z}dest")
                    .arg(2)
                    .arg("{z}a")
                    .arg("{z}b")
                    .clone(),
                Route::new(slot(b"z"), SlotAddr::Master),
            ),
        ] {
            assert_eq!(
                RoutingInfo::for_routable(&cmd).unwrap(),
                RoutingInfo::SingleNode(SingleNodeRoutingInfo::SpecificNode(expected)),
                "{cmd:?}"
            );
        }
    }

    #[test]
    fn test_keyless_scripts_route_randomly() {
        for cmd in [
            cmd("EVAL").arg(r#"redis.call("PING");"#).arg(0).clone(),
            cmd("EVALSHA").arg(r#"redis.call("PING");"#).arg(0).clone(),
            cmd("TIME"),
        ] {
            assert_eq!(
                RoutingInfo::for_routable(&cmd).unwrap(),
                RoutingInfo::SingleNode(SingleNodeRoutingInfo::Random)
            );
        }
    }

    #[test]
    fn test_cross_slot_commands_are_rejected() {
        for cmd in [
            cmd("MGET").arg("foo").arg("bar").clone(),
            cmd("MSET").arg("foo").arg("1").arg("bar").arg("2").clone(),
            cmd("EVAL").arg("return 1").arg(2).arg("foo").arg("bar").clone(),
            cmd("RENAME").arg("foo").arg("bar").clone(),
            cmd("SINTER").arg("{a}x").arg("{b}y").clone(),
        ] {
            let err = RoutingInfo::for_routable(&cmd).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CrossSlot, "{cmd:?}");
        }

        // Only the keys count, not the values.
        assert!(RoutingInfo::for_routable(
            cmd("MSET").arg("{a}1").arg("x").arg("{a}2").arg("y")
        )
        .is_ok());
    }

    #[test]
    fn test_blocked_and_malformed_commands() {
        for cmd in [
            cmd("SELECT").arg(1).clone(),
            cmd("MOVE").arg("foo").arg(1).clone(),
            cmd("sentinel").arg("masters").clone(),
            cmd("MULTI"),
            cmd("SUBSCRIBE").arg("chan").clone(),
            cmd("SCRIPT").arg("kill").clone(),
            cmd("CLIENT").arg("SETNAME").arg("me").clone(),
        ] {
            assert_matches!(
                RoutingInfo::for_routable(&cmd).map_err(|err| err.kind()),
                Err(ErrorKind::CommandNotAllowed)
            );
        }

        assert_matches!(
            RoutingInfo::for_routable(&cmd("GET")).map_err(|err| err.kind()),
            Err(ErrorKind::ClientError)
        );
        assert_matches!(
            RoutingInfo::for_routable(cmd("EVAL").arg("return 1").arg("x"))
                .map_err(|err| err.kind()),
            Err(ErrorKind::ClientError)
        );
    }

    #[test]
    fn test_slot_argument_routing() {
        assert_eq!(
            RoutingInfo::for_routable(cmd("CLUSTER").arg("COUNTKEYSINSLOT").arg(50)).unwrap(),
            RoutingInfo::SingleNode(SingleNodeRoutingInfo::SpecificNode(Route::new(
                50,
                SlotAddr::Master
            )))
        );
        assert!(
            RoutingInfo::for_routable(cmd("CLUSTER").arg("GETKEYSINSLOT").arg(20000)).is_err()
        );
    }

    #[test]
    fn test_aggregations() {
        assert_eq!(
            super::aggregate(vec![Value::Int(1), Value::Int(5)], AggregateOp::Sum).unwrap(),
            Value::Int(6)
        );
        assert_eq!(
            super::aggregate(vec![Value::Int(3), Value::Int(5)], AggregateOp::Min).unwrap(),
            Value::Int(3)
        );
        assert_matches!(
            super::aggregate(vec![Value::Int(i64::MAX), Value::Int(1)], AggregateOp::Sum)
                .map_err(|err| err.kind()),
            Err(ErrorKind::UnexpectedReturnType)
        );
        assert_eq!(
            super::logical_aggregate(
                vec![
                    Value::Array(vec![Value::Int(1), Value::Int(0)]),
                    Value::Array(vec![Value::Int(1), Value::Int(1)]),
                ],
                LogicalAggregateOp::And
            )
            .unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(0)])
        );
        assert_eq!(
            super::combine_array_results(vec![
                Value::Array(vec![Value::Int(1)]),
                Value::Array(vec![Value::Int(2)]),
            ])
            .unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
        assert!(super::all_equal_result(vec![Value::Int(1), Value::Int(2)]).is_err());
        assert_eq!(
            super::all_equal_result(vec![Value::Okay, Value::Okay]).unwrap(),
            Value::Okay
        );
    }
}
