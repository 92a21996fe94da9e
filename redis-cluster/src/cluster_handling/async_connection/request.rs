use std::time::Duration;

use arcstr::ArcStr;
use log::trace;

use crate::cluster_handling::client::ClusterParams;
use crate::cluster_handling::routing::Redirect;
use crate::errors::RetryMethod;
use crate::{ErrorKind, RedisError, RedisResult, Value};

/// The reply of one attempt: a single command, or every reply of a batch written in one go.
#[derive(Debug, PartialEq)]
pub(crate) enum Response {
    Single(Value),
    Multiple(Vec<Value>),
}

#[derive(Clone, Debug)]
pub(crate) struct RetryParams {
    pub(crate) request_ttl: usize,
    pub(crate) connection_error_backoff: Duration,
    pub(crate) try_again_backoff: Duration,
}

impl From<&ClusterParams> for RetryParams {
    fn from(params: &ClusterParams) -> Self {
        RetryParams {
            request_ttl: params.request_ttl,
            connection_error_backoff: params.connection_error_backoff,
            try_again_backoff: params.try_again_backoff,
        }
    }
}

impl RetryParams {
    // Early attempts retry right away, only the second half of the budget pauses.
    fn backoff(&self, state: &RetryState, duration: Duration) -> Retry {
        if state.ttl < self.request_ttl / 2 {
            Retry::AfterSleep {
                sleep_duration: duration,
            }
        } else {
            Retry::Immediately
        }
    }
}

/// Per-command state of the retry loop.
#[derive(Debug)]
pub(crate) struct RetryState {
    pub(crate) ttl: usize,
    pub(crate) redirect: Option<Redirect>,
    pub(crate) asking: bool,
    pub(crate) try_random_node: bool,
}

impl RetryState {
    pub(crate) fn new(request_ttl: usize) -> Self {
        RetryState {
            ttl: request_ttl,
            redirect: None,
            asking: false,
            try_random_node: false,
        }
    }

    /// Takes one attempt out of the budget. Returns false when none is left.
    pub(crate) fn start_attempt(&mut self) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.ttl -= 1;
        true
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Retry {
    Immediately,
    AfterSleep { sleep_duration: Duration },
}

/// What the caller of the loop must do next.
#[derive(Debug)]
pub(crate) enum Next {
    Done(RedisResult<Response>),
    Retry(Retry),
}

/// Side effects on the shared registry and pool, applied before the next attempt.
#[derive(Debug, PartialEq)]
pub(crate) enum PollFlushAction {
    None,
    /// The connection broke and was dropped.
    Reconnect,
    /// A `MOVED` reply named the new owner of a slot.
    PatchSlot { slot: u16, node: ArcStr },
    /// Drop every connection and rediscover the topology on the next command.
    ReconnectFromInitialConnections,
}

pub(crate) fn ttl_exhausted(last_error: &RedisError) -> RedisError {
    RedisError::from((
        ErrorKind::TTLExhausted,
        "Too many cluster redirections",
        format!("last error: {last_error}"),
    ))
}

fn error_requiring_action(response: &Response) -> Option<RedisError> {
    match response {
        Response::Single(Value::ServerError(err)) => Some(err.clone().into()),
        Response::Single(_) => None,
        Response::Multiple(values) => values
            .iter()
            .filter_map(Value::server_error)
            .find(|err| err.requires_action())
            .map(|err| err.clone().into()),
    }
}

/// Decides the fate of one attempt.
pub(crate) fn choose_response(
    result: RedisResult<Response>,
    state: &mut RetryState,
    retry_params: &RetryParams,
) -> (Next, PollFlushAction) {
    let err = match result {
        Ok(response) => match error_requiring_action(&response) {
            Some(err) => err,
            None => {
                trace!("Ok");
                return (Next::Done(Ok(response)), PollFlushAction::None);
            }
        },
        Err(err) => err,
    };

    let has_retries_remaining = state.ttl > 0;

    macro_rules! retry_or_fail {
        ($retry: expr, $action: expr) => {
            if has_retries_remaining {
                (Next::Retry($retry), $action)
            } else {
                (Next::Done(Err(ttl_exhausted(&err))), $action)
            }
        };
    }

    let retry_method = if err.is_io_error() {
        RetryMethod::Reconnect
    } else {
        err.retry_method()
    };

    match retry_method {
        RetryMethod::ReconnectFromInitialConnections => (
            Next::Done(Err(err)),
            PollFlushAction::ReconnectFromInitialConnections,
        ),

        RetryMethod::Reconnect => {
            trace!("connection error, retrying on a random node: {err}");
            state.try_random_node = true;
            let retry = retry_params.backoff(state, retry_params.connection_error_backoff);
            retry_or_fail!(retry, PollFlushAction::Reconnect)
        }

        RetryMethod::MovedRedirect => match err.redirect_node() {
            Some((node, slot)) => {
                let node = ArcStr::from(node);
                state.redirect = Some(Redirect::Moved(node.clone()));
                retry_or_fail!(
                    Retry::Immediately,
                    PollFlushAction::PatchSlot { slot, node }
                )
            }
            None => (Next::Done(Err(err)), PollFlushAction::None),
        },

        RetryMethod::AskRedirect => match err.redirect_node() {
            Some((node, _slot)) => {
                state.redirect = Some(Redirect::Ask(node.into()));
                retry_or_fail!(Retry::Immediately, PollFlushAction::None)
            }
            None => (Next::Done(Err(err)), PollFlushAction::None),
        },

        RetryMethod::WaitAndRetry => {
            let retry = retry_params.backoff(state, retry_params.try_again_backoff);
            retry_or_fail!(retry, PollFlushAction::None)
        }

        RetryMethod::NoRetry | RetryMethod::RetryImmediately => {
            (Next::Done(Err(err)), PollFlushAction::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::errors::ServerErrorKind;
    use crate::parse_redis_value;
    use assert_matches::assert_matches;

    fn params() -> RetryParams {
        RetryParams {
            request_ttl: 16,
            connection_error_backoff: Duration::from_millis(100),
            try_again_backoff: Duration::from_millis(50),
        }
    }

    fn reply(bytes: &[u8]) -> RedisResult<Response> {
        Ok(Response::Single(parse_redis_value(bytes).unwrap()))
    }

    fn state_after_attempts(attempts: usize) -> RetryState {
        let mut state = RetryState::new(16);
        for _ in 0..attempts {
            assert!(state.start_attempt());
        }
        state
    }

    #[test]
    fn success_is_returned() {
        let mut state = state_after_attempts(1);
        let (next, action) = choose_response(reply(b"+OK\r\n"), &mut state, &params());
        assert_matches!(next, Next::Done(Ok(Response::Single(Value::Okay))));
        assert_eq!(action, PollFlushAction::None);
    }

    #[test]
    fn moved_patches_and_redirects() {
        let mut state = state_after_attempts(1);
        let (next, action) = choose_response(
            reply(b"-MOVED 12182 127.0.0.1:6380\r\n"),
            &mut state,
            &params(),
        );
        assert_matches!(next, Next::Retry(Retry::Immediately));
        assert_eq!(
            action,
            PollFlushAction::PatchSlot {
                slot: 12182,
                node: "127.0.0.1:6380".into()
            }
        );
        assert_eq!(state.redirect, Some(Redirect::Moved("127.0.0.1:6380".into())));
    }

    #[test]
    fn ask_is_a_one_shot_redirect() {
        let mut state = state_after_attempts(1);
        let (next, action) =
            choose_response(reply(b"-ASK 5 127.0.0.1:6381\r\n"), &mut state, &params());
        assert_matches!(next, Next::Retry(Retry::Immediately));
        assert_eq!(action, PollFlushAction::None);
        assert_eq!(state.redirect, Some(Redirect::Ask("127.0.0.1:6381".into())));
    }

    #[test]
    fn try_again_sleeps_only_in_the_second_half() {
        let mut state = state_after_attempts(1);
        let (next, _) = choose_response(reply(b"-TRYAGAIN\r\n"), &mut state, &params());
        assert_matches!(next, Next::Retry(Retry::Immediately));

        let mut state = state_after_attempts(9);
        let (next, _) = choose_response(reply(b"-TRYAGAIN\r\n"), &mut state, &params());
        assert_matches!(
            next,
            Next::Retry(Retry::AfterSleep { sleep_duration })
                if sleep_duration == Duration::from_millis(50)
        );
    }

    #[test]
    fn connection_errors_switch_to_a_random_node() {
        let mut state = state_after_attempts(1);
        let err = RedisError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        let (next, action) = choose_response(Err(err), &mut state, &params());
        assert_matches!(next, Next::Retry(Retry::Immediately));
        assert_eq!(action, PollFlushAction::Reconnect);
        assert!(state.try_random_node);

        let mut state = state_after_attempts(12);
        let err = RedisError::from(io::Error::from(io::ErrorKind::TimedOut));
        let (next, _) = choose_response(Err(err), &mut state, &params());
        assert_matches!(
            next,
            Next::Retry(Retry::AfterSleep { sleep_duration })
                if sleep_duration == Duration::from_millis(100)
        );
    }

    #[test]
    fn cluster_down_is_raised_and_resets() {
        let mut state = state_after_attempts(1);
        let (next, action) = choose_response(
            reply(b"-CLUSTERDOWN The cluster is down\r\n"),
            &mut state,
            &params(),
        );
        assert_matches!(
            next,
            Next::Done(Err(err))
                if err.kind() == ErrorKind::ServerError(ServerErrorKind::ClusterDown)
        );
        assert_eq!(action, PollFlushAction::ReconnectFromInitialConnections);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut state = state_after_attempts(1);
        let (next, _) = choose_response(
            reply(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"),
            &mut state,
            &params(),
        );
        assert_matches!(next, Next::Done(Err(err)) if err.code() == Some("WRONGTYPE"));

        let pool_exhausted = RedisError::from((ErrorKind::PoolExhausted, "Too many connections"));
        let (next, _) = choose_response(Err(pool_exhausted), &mut state, &params());
        assert_matches!(next, Next::Done(Err(err)) if err.kind() == ErrorKind::PoolExhausted);
    }

    #[test]
    fn an_empty_budget_ends_in_ttl_exhausted() {
        let mut state = state_after_attempts(16);
        assert!(!state.start_attempt());
        let (next, _) = choose_response(reply(b"-TRYAGAIN\r\n"), &mut state, &params());
        assert_matches!(
            next,
            Next::Done(Err(err)) if err.kind() == ErrorKind::TTLExhausted
                && err.detail().unwrap().contains("TryAgain")
        );
    }

    #[test]
    fn redirects_inside_batches_redirect_the_batch() {
        let mut state = state_after_attempts(1);
        let batch = Response::Multiple(vec![
            Value::Okay,
            parse_redis_value(b"-MOVED 1 127.0.0.1:6380\r\n").unwrap(),
            parse_redis_value(b"-EXECABORT Transaction discarded\r\n").unwrap(),
        ]);
        let (next, action) = choose_response(Ok(batch), &mut state, &params());
        assert_matches!(next, Next::Retry(Retry::Immediately));
        assert_matches!(action, PollFlushAction::PatchSlot { slot: 1, .. });

        // Plain error replies inside a batch stay in-band.
        let batch = Response::Multiple(vec![
            Value::Okay,
            parse_redis_value(b"-ERR wrong\r\n").unwrap(),
        ]);
        let (next, _) = choose_response(Ok(batch), &mut state, &params());
        assert_matches!(next, Next::Done(Ok(Response::Multiple(_))));
    }
}
