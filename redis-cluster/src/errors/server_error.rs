use arcstr::ArcStr;
use std::fmt;

use crate::RetryMethod;

/// Kinds of errors returned from the server
#[derive(PartialEq, Debug, Clone, Copy, Eq)]
#[non_exhaustive]
pub enum ServerErrorKind {
    /// The server generated an invalid response, or returned a general error.
    ResponseError,
    /// A transaction was aborted.
    ExecAbort,
    /// The server cannot response because it's loading a dump.
    BusyLoading,
    /// A script that was requested does not actually exist.
    NoScript,
    /// Raised if a key moved to a different node.
    Moved,
    /// Raised if a key moved to a different node but we need to ask.
    Ask,
    /// Raised if a request needs to be retried.
    TryAgain,
    /// Raised if a redis cluster is down.
    ClusterDown,
    /// A request spans multiple slots
    CrossSlot,
    /// A cluster master is unavailable.
    MasterDown,
    /// Attempt to write to a read-only server
    ReadOnly,
    /// Attempted to kill a script/function while they werent' executing
    NotBusy,
    /// Attempted to use a command without ACL permission.
    NoPerm,
}

impl ServerErrorKind {
    pub(crate) fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "ERR" => Self::ResponseError,
            "EXECABORT" => Self::ExecAbort,
            "LOADING" => Self::BusyLoading,
            "NOSCRIPT" => Self::NoScript,
            "MOVED" => Self::Moved,
            "ASK" => Self::Ask,
            "TRYAGAIN" => Self::TryAgain,
            "CLUSTERDOWN" => Self::ClusterDown,
            "CROSSSLOT" => Self::CrossSlot,
            "MASTERDOWN" => Self::MasterDown,
            "READONLY" => Self::ReadOnly,
            "NOTBUSY" => Self::NotBusy,
            "NOPERM" => Self::NoPerm,
            _ => return None,
        })
    }

    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::ResponseError => "ERR",
            Self::ExecAbort => "EXECABORT",
            Self::BusyLoading => "LOADING",
            Self::NoScript => "NOSCRIPT",
            Self::Moved => "MOVED",
            Self::Ask => "ASK",
            Self::TryAgain => "TRYAGAIN",
            Self::ClusterDown => "CLUSTERDOWN",
            Self::CrossSlot => "CROSSSLOT",
            Self::MasterDown => "MASTERDOWN",
            Self::ReadOnly => "READONLY",
            Self::NotBusy => "NOTBUSY",
            Self::NoPerm => "NOPERM",
        }
    }

    pub(crate) fn retry_method(&self) -> RetryMethod {
        match self {
            Self::Moved => RetryMethod::MovedRedirect,
            Self::Ask => RetryMethod::AskRedirect,

            Self::TryAgain => RetryMethod::WaitAndRetry,

            // The whole topology has to be rebuilt from the startup nodes.
            Self::ClusterDown => RetryMethod::ReconnectFromInitialConnections,

            Self::ResponseError => RetryMethod::NoRetry,
            Self::ReadOnly => RetryMethod::NoRetry,
            Self::ExecAbort => RetryMethod::NoRetry,
            Self::BusyLoading => RetryMethod::NoRetry,
            Self::MasterDown => RetryMethod::NoRetry,
            Self::NoScript => RetryMethod::NoRetry,
            Self::CrossSlot => RetryMethod::NoRetry,
            Self::NotBusy => RetryMethod::NoRetry,
            Self::NoPerm => RetryMethod::NoRetry,
        }
    }
}

/// An error reply returned from the server.
///
/// Error replies travel in-band as [`Value::ServerError`](crate::Value::ServerError), so that a
/// pipeline can carry one per command and the cluster state machine can inspect them before they
/// are turned into a [`RedisError`](crate::RedisError).
#[derive(PartialEq, Debug, Clone)]
pub struct ServerError(pub(crate) Repr);

#[derive(PartialEq, Debug, Clone)]
pub(crate) enum Repr {
    Extension {
        code: ArcStr,
        detail: Option<ArcStr>,
    },
    Known {
        kind: ServerErrorKind,
        detail: Option<ArcStr>,
    },
}

impl ServerError {
    /// Builds an error from the raw error line sent by the server, e.g.
    /// `MOVED 3999 127.0.0.1:6381`.
    pub fn from_line(line: &str) -> Self {
        let mut pieces = line.splitn(2, ' ');
        let code = pieces.next().unwrap_or_default();
        let detail = pieces.next().map(ArcStr::from);
        match ServerErrorKind::from_code(code) {
            Some(kind) => ServerError(Repr::Known { kind, detail }),
            None => ServerError(Repr::Extension {
                code: code.into(),
                detail,
            }),
        }
    }

    /// Returns the kind of error. If `None`, try `crate::Self::code` to get the error code.
    pub fn kind(&self) -> Option<ServerErrorKind> {
        match &self.0 {
            Repr::Extension { .. } => None,
            Repr::Known { kind, .. } => Some(*kind),
        }
    }

    /// The error code returned from the server
    pub fn code(&self) -> &str {
        match &self.0 {
            Repr::Extension { code, .. } => code,
            Repr::Known { kind, .. } => kind.code(),
        }
    }

    /// Additional details about the error, if exist
    pub fn details(&self) -> Option<&str> {
        match &self.0 {
            Repr::Extension { detail, .. } => detail.as_ref().map(|str| str.as_str()),
            Repr::Known { detail, .. } => detail.as_ref().map(|str| str.as_str()),
        }
    }

    pub(crate) fn retry_method(&self) -> RetryMethod {
        self.kind()
            .map(|kind| kind.retry_method())
            .unwrap_or(RetryMethod::NoRetry)
    }

    /// Whether the cluster layer has to act on this reply (redirect, wait, or rebuild).
    pub(crate) fn requires_action(&self) -> bool {
        !matches!(self.retry_method(), RetryMethod::NoRetry)
    }

    /// Returns `(addr, slot)` for `MOVED` and `ASK` replies.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        match self.kind() {
            Some(ServerErrorKind::Ask) | Some(ServerErrorKind::Moved) => (),
            _ => return None,
        }
        let mut iter = self.details()?.split_ascii_whitespace();
        let slot_id: u16 = iter.next()?.parse().ok()?;
        let addr = iter.next()?;
        Some((addr, slot_id))
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Extension { code, detail } => {
                fmt::Debug::fmt(&code, f)?;
                if let Some(detail) = detail {
                    f.write_str(": ")?;
                    detail.fmt(f)?;
                }
                Ok(())
            }
            Repr::Known { kind, detail } => {
                fmt::Debug::fmt(&kind, f)?;
                if let Some(detail) = detail {
                    f.write_str(": ")?;
                    detail.fmt(f)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_parsed_into_kinds() {
        let err = ServerError::from_line("MOVED 3999 127.0.0.1:6381");
        assert_eq!(err.kind(), Some(ServerErrorKind::Moved));
        assert_eq!(err.code(), "MOVED");
        assert_eq!(err.details(), Some("3999 127.0.0.1:6381"));
        assert_eq!(err.redirect_node(), Some(("127.0.0.1:6381", 3999)));
        assert!(err.requires_action());
    }

    #[test]
    fn unknown_codes_are_kept_as_extensions() {
        let err = ServerError::from_line("WRONGPASS invalid username-password pair");
        assert_eq!(err.kind(), None);
        assert_eq!(err.code(), "WRONGPASS");
        assert_eq!(err.redirect_node(), None);
        assert!(!err.requires_action());
    }

    #[test]
    fn cluster_down_requires_a_rebuild() {
        let err = ServerError::from_line("CLUSTERDOWN The cluster is down");
        assert!(matches!(
            err.retry_method(),
            RetryMethod::ReconnectFromInitialConnections
        ));
    }
}
