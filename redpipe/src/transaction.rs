use log::debug;

use crate::cmd::cmd;
use crate::context::{run_pipeline, with_replies, with_replies_pipeline};
use crate::errors::{RedisError, RedisResult};
use crate::pool::ConnectionPool;
use crate::types::Value;

/// Runs an optimistic transaction with at most `max_attempts` attempts.
///
/// See [`atomic_with`]; giving up yields an error of kind
/// [`ErrorKind::RetryExhausted`](crate::ErrorKind::RetryExhausted)
/// carrying the number of attempts.
pub fn atomic<P, F>(pool: &P, max_attempts: usize, body: F) -> RedisResult<(Vec<Value>, Value)>
where
    P: ConnectionPool + ?Sized,
    F: FnMut() -> RedisResult<()>,
{
    atomic_with(pool, max_attempts, body, |attempts| {
        Err(RedisError::retry_exhausted(attempts))
    })
}

/// Runs an optimistic transaction, calling `on_failure` when every attempt
/// lost its optimistic lock.
///
/// All attempts share one connection.  Each attempt runs `body` as its own
/// batch; `body` is expected to `WATCH` the keys it depends on (reading
/// them with [`with_replies`] if it needs their values) and queue `MULTI`
/// followed by the writes.  `EXEC` is sent next.  A nil reply to `EXEC`
/// means a watched key changed and the attempt is repeated.
///
/// On success the replies of the last attempt's batch are returned along
/// with the `EXEC` reply.  When `body` fails, `DISCARD` and `UNWATCH` are
/// sent together so the pooled connection carries no transaction state
/// forward, and the error is returned without further attempts.  `max_attempts` below one
/// counts as one.
pub fn atomic_with<P, F, G>(
    pool: &P,
    max_attempts: usize,
    mut body: F,
    on_failure: G,
) -> RedisResult<(Vec<Value>, Value)>
where
    P: ConnectionPool + ?Sized,
    F: FnMut() -> RedisResult<()>,
    G: FnOnce(usize) -> RedisResult<(Vec<Value>, Value)>,
{
    let max_attempts = max_attempts.max(1);
    let mut outcome = None;

    run_pipeline(pool, || {
        for attempt in 1..=max_attempts {
            let prelude = match with_replies_pipeline(&mut body) {
                Ok(prelude) => prelude,
                Err(err) => {
                    // DISCARD only clears a MULTI; watches outlive it otherwise
                    let _ = with_replies_pipeline(|| {
                        cmd("DISCARD").queue()?;
                        cmd("UNWATCH").queue()
                    });
                    return Err(err);
                }
            };
            let exec: Value = with_replies(|| cmd("EXEC").queue())?;
            if exec != Value::Nil {
                outcome = Some((prelude, exec));
                return Ok(());
            }
            debug!("transaction attempt {attempt}/{max_attempts} lost its watch");
        }
        Ok(())
    })?;

    match outcome {
        Some(committed) => Ok(committed),
        None => on_failure(max_attempts),
    }
}
