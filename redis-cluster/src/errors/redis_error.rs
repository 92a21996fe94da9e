use std::{error, fmt, io};

use arcstr::ArcStr;

use crate::errors::server_error::{ServerError, ServerErrorKind};

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The parser failed to parse the server response.
    ParseError,
    /// Operation failed because of a type mismatch.
    UnexpectedReturnType,
    /// An error that was caused because the parameter to the
    /// client were wrong.
    InvalidClientConfig,
    /// This kind is returned if the redis error is one that is
    /// not native to the system.  This is usually the case if
    /// the cause is another error.
    IoError,
    /// An error raised that was identified on the client before execution.
    ClientError,
    /// An extension error.  This is an error created by the server
    /// that is not directly understood by the library.
    ExtensionError,
    /// An error returned from the server
    ServerError(ServerErrorKind),
    /// The keys of a command (or of a transaction) hash to more than one slot.
    CrossSlot,
    /// The command cannot be used against a cluster.
    CommandNotAllowed,
    /// None of the startup nodes could be reached.
    ClusterUnreachable,
    /// The discovered topology leaves some slots without an owner.
    IncompleteCoverage,
    /// Two nodes disagree on the owner of a slot.
    SlotCollision,
    /// The request ran out of attempts before succeeding.
    TTLExhausted,
    /// No node is known to serve the requested slot.
    NoNodeForSlot,
    /// The connection cap for a node, or for the whole client, has been reached.
    PoolExhausted,
}

/// Represents a redis error.
///
/// For the most part you should be using the Error trait to interact with this
/// rather than the actual struct.
pub struct RedisError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, ArcStr),
    IoError(io::Error),
    ServerError(ServerError),
}

impl PartialEq for RedisError {
    fn eq(&self, other: &RedisError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::ServerError(a), ErrorRepr::ServerError(b)) => *a == *b,
            _ => false,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.into()),
        }
    }
}

impl From<ServerError> for RedisError {
    fn from(err: ServerError) -> Self {
        Self {
            repr: ErrorRepr::ServerError(err),
        }
    }
}

impl From<ServerErrorKind> for ErrorKind {
    fn from(kind: ServerErrorKind) -> Self {
        ErrorKind::ServerError(kind)
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::IoError(err) => Some(err),
            ErrorRepr::ServerError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str("- ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(err) => err.fmt(f),
            ErrorRepr::ServerError(err) => err.fmt(f),
        }
    }
}

/// What method should be used if retrying this request.
#[non_exhaustive]
pub enum RetryMethod {
    /// Create a fresh connection, since the current connection is no longer usable.
    Reconnect,
    /// Don't retry, this is a permanent error.
    NoRetry,
    /// Retry immediately, this doesn't require a wait.
    RetryImmediately,
    /// Retry after sleeping to avoid overloading the external service.
    WaitAndRetry,
    /// The key has moved to a different node but we have to ask which node, this is only relevant
    /// for clusters.
    AskRedirect,
    /// The key has moved to a different node, this is only relevant for clusters.
    MovedRedirect,
    /// Drop every connection and rebuild the topology from the startup nodes.
    ReconnectFromInitialConnections,
}

/// Indicates a general failure in the library.
impl RedisError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
            ErrorRepr::ServerError(err) => match err.kind() {
                Some(kind) => ErrorKind::ServerError(kind),
                None => ErrorKind::ExtensionError,
            },
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail.as_str()),
            ErrorRepr::ServerError(err) => err.details(),
            _ => None,
        }
    }

    /// Returns the raw error code if available.
    pub fn code(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::ServerError(err) => Some(err.code()),
            _ => None,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::ServerError(ServerErrorKind::ResponseError) => "response error",
            ErrorKind::UnexpectedReturnType => "type error",
            ErrorKind::ServerError(ServerErrorKind::ExecAbort) => "transaction aborted",
            ErrorKind::ServerError(ServerErrorKind::BusyLoading) => "busy loading",
            ErrorKind::ServerError(ServerErrorKind::NoScript) => "no script",
            ErrorKind::InvalidClientConfig => "invalid client config",
            ErrorKind::ServerError(ServerErrorKind::Moved) => "key moved",
            ErrorKind::ServerError(ServerErrorKind::Ask) => "key moved (ask)",
            ErrorKind::ServerError(ServerErrorKind::TryAgain) => "try again",
            ErrorKind::ServerError(ServerErrorKind::ClusterDown) => "cluster down",
            ErrorKind::ServerError(ServerErrorKind::CrossSlot) => "cross-slot",
            ErrorKind::ServerError(ServerErrorKind::MasterDown) => "master down",
            ErrorKind::ServerError(ServerErrorKind::ReadOnly) => "read-only",
            ErrorKind::ServerError(ServerErrorKind::NotBusy) => "not busy",
            ErrorKind::ServerError(ServerErrorKind::NoPerm) => "no permission",
            ErrorKind::IoError => "I/O error",
            ErrorKind::ExtensionError => "extension error",
            ErrorKind::ClientError => "client error",
            ErrorKind::ParseError => "parse error",
            ErrorKind::CrossSlot => "keys in request don't hash to the same slot",
            ErrorKind::CommandNotAllowed => "command not allowed in cluster mode",
            ErrorKind::ClusterUnreachable => "cluster unreachable",
            ErrorKind::IncompleteCoverage => "incomplete slot coverage",
            ErrorKind::SlotCollision => "slot collision",
            ErrorKind::TTLExhausted => "request ttl exhausted",
            ErrorKind::NoNodeForSlot => "no node for slot",
            ErrorKind::PoolExhausted => "connection pool exhausted",
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }

    /// Returns true if error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Returns the node the error refers to.
    ///
    /// This returns `(addr, slot_id)`.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        match &self.repr {
            ErrorRepr::ServerError(err) => err.redirect_node(),
            _ => None,
        }
    }

    /// Clone the `RedisError`, throwing away non-cloneable parts of an `IoError`.
    ///
    /// Deriving `Clone` is not possible because the wrapped `io::Error` is not
    /// cloneable.
    pub(crate) fn clone_mostly(&self) -> Self {
        let repr = match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(*kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                ErrorRepr::WithDescriptionAndDetail(*kind, desc, detail.clone())
            }
            ErrorRepr::IoError(e) => ErrorRepr::IoError(io::Error::new(e.kind(), e.to_string())),
            ErrorRepr::ServerError(server_error) => ErrorRepr::ServerError(server_error.clone()),
        };
        Self { repr }
    }

    /// Specifies what method (if any) should be used to retry this request.
    ///
    /// Retrying of requests is already handled by the cluster connection, this is exposed for
    /// callers layering their own policy on top of errors that escape it.
    pub fn retry_method(&self) -> RetryMethod {
        match &self.repr {
            ErrorRepr::ServerError(err) => err.retry_method(),
            ErrorRepr::IoError(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused => RetryMethod::Reconnect,
                io::ErrorKind::NotFound => RetryMethod::Reconnect,
                io::ErrorKind::ConnectionReset => RetryMethod::Reconnect,
                io::ErrorKind::ConnectionAborted => RetryMethod::Reconnect,
                io::ErrorKind::NotConnected => RetryMethod::Reconnect,
                io::ErrorKind::BrokenPipe => RetryMethod::Reconnect,
                io::ErrorKind::UnexpectedEof => RetryMethod::Reconnect,

                io::ErrorKind::PermissionDenied => RetryMethod::NoRetry,
                io::ErrorKind::Unsupported => RetryMethod::NoRetry,

                _ => RetryMethod::RetryImmediately,
            },
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => match kind {
                ErrorKind::ParseError => RetryMethod::Reconnect,
                ErrorKind::ClusterUnreachable => RetryMethod::ReconnectFromInitialConnections,
                _ => RetryMethod::NoRetry,
            },
        }
    }
}
