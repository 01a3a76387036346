//! Thread-local execution contexts.
//!
//! Every thread owns a stack of contexts.  The innermost one receives the
//! commands queued with [`Cmd::queue`](crate::Cmd::queue) and sends them
//! as a single batch when its block ends.  Opening a context while
//! another one has pending commands first flushes those commands and
//! keeps their replies aside; once the inner block is done the replies
//! are handed back to the outer context in their original positions.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use log::{trace, warn};

use crate::cmd::Cmd;
use crate::connection::ConnectionLike;
use crate::errors::{ErrorKind, RedisError, RedisResult};
use crate::pipeline::{self, collapse, ComposedParser, ReplyParser, Request};
use crate::pool::ConnectionPool;
use crate::types::{from_owned_redis_value, FromRedisValue, Value};

struct Context {
    conn: Rc<RefCell<dyn ConnectionLike>>,
    requests: Vec<Request>,
    parsers: Vec<ReplyParser>,
    auto_thaw: bool,
}

thread_local! {
    static CONTEXTS: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

fn no_context() -> RedisError {
    RedisError::from((
        ErrorKind::ClientError,
        "No execution context is active on this thread",
    ))
}

fn with_top<R>(f: impl FnOnce(&mut Context) -> R) -> RedisResult<R> {
    CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        match contexts.last_mut() {
            Some(top) => Ok(f(top)),
            None => Err(no_context()),
        }
    })
}

fn depth() -> usize {
    CONTEXTS.with(|contexts| contexts.borrow().len())
}

/// Returns true when a context is active on this thread.
pub fn in_context() -> bool {
    depth() > 0
}

fn push_request(request: Request) -> RedisResult<()> {
    with_top(|top| top.requests.push(request))
}

pub(crate) fn enqueue(cmd: Cmd) -> RedisResult<()> {
    with_top(|top| {
        let parser = ComposedParser::compose(&top.parsers, top.auto_thaw);
        top.requests.push(Request::Command { cmd, parser });
    })
}

/// Injects `value` as the next reply of the active context without
/// sending a command.  The active parsers apply to it.
pub fn return_value(value: Value) -> RedisResult<()> {
    with_top(|top| {
        let parser = ComposedParser::compose(&top.parsers, top.auto_thaw);
        top.requests.push(Request::Local { value, parser });
    })
}

/// Like [`return_value`] but bypasses every parser.
pub(crate) fn return_raw(value: Value) -> RedisResult<()> {
    push_request(Request::Local {
        value,
        parser: ComposedParser::identity(),
    })
}

/// Sends the pending requests of the innermost context and returns their
/// replies, leaving the context empty.
fn flush_top() -> RedisResult<Vec<Value>> {
    let (conn, requests) = with_top(|top| (top.conn.clone(), mem::take(&mut top.requests)))?;
    if requests.is_empty() {
        return Ok(vec![]);
    }
    let replies = {
        let mut con = conn.borrow_mut();
        pipeline::send_commands(&mut *con, &requests)?
    };
    Ok(pipeline::merge_replies(requests, replies))
}

fn reinject(stash: Vec<Value>) -> RedisResult<()> {
    for value in stash {
        return_raw(value)?;
    }
    Ok(())
}

/// Pops the context pushed by `run_pipeline`, even when the body panics.
struct PopGuard {
    depth: usize,
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            contexts.truncate(self.depth);
        });
    }
}

/// Runs `body` in a fresh context on a connection from `pool` and returns
/// every reply of the commands it queued, in queue order.
///
/// Commands pending in an enclosing context are sent first; their replies
/// are returned to the enclosing context once this block is done.
pub fn run_pipeline<P, F>(pool: &P, body: F) -> RedisResult<Vec<Value>>
where
    P: ConnectionPool + ?Sized,
    F: FnOnce() -> RedisResult<()>,
{
    let conn = Rc::new(RefCell::new(pool.acquire()?));

    let stash = if in_context() {
        match flush_top() {
            Ok(stash) => stash,
            Err(err) => {
                // the failure belongs to the outer connection
                release(pool, conn, None);
                return Err(err);
            }
        }
    } else {
        vec![]
    };

    let depth = depth();
    trace!("entering context at depth {depth}, {} replies stashed", stash.len());

    let dyn_conn: Rc<RefCell<dyn ConnectionLike>> = conn.clone();
    CONTEXTS.with(|contexts| {
        contexts.borrow_mut().push(Context {
            conn: dyn_conn,
            requests: vec![],
            parsers: vec![],
            auto_thaw: pool.auto_thaw(),
        })
    });

    let result = {
        let _guard = PopGuard { depth };
        body().and_then(|()| flush_top())
    };

    release(pool, conn, result.as_ref().err());

    if depth > 0 {
        reinject(stash)?;
    }
    result
}

fn release<P: ConnectionPool + ?Sized>(
    pool: &P,
    conn: Rc<RefCell<P::Connection>>,
    err: Option<&RedisError>,
) {
    match Rc::try_unwrap(conn) {
        Ok(cell) => pool.release(cell.into_inner(), err),
        Err(_) => warn!("connection still referenced after its context ended"),
    }
}

/// Runs `body` in a fresh context and collapses the replies.
///
/// No replies give nil, a single reply is converted on its own (an error
/// reply becomes `Err`), several replies are converted as an array.
pub fn run_block<P, T, F>(pool: &P, body: F) -> RedisResult<T>
where
    P: ConnectionPool + ?Sized,
    T: FromRedisValue,
    F: FnOnce() -> RedisResult<()>,
{
    let replies = run_pipeline(pool, body)?;
    from_owned_redis_value(collapse(replies)?)
}

/// Executes only the commands `body` queues, right away, on the
/// connection of the active context.
///
/// Commands queued before the call are sent first and keep their slots in
/// the active context.
pub fn with_replies_pipeline<F>(body: F) -> RedisResult<Vec<Value>>
where
    F: FnOnce() -> RedisResult<()>,
{
    let stash = flush_top()?;
    let result = match body() {
        Ok(()) => flush_top(),
        Err(err) => {
            let discarded = with_top(|top| mem::take(&mut top.requests))?;
            trace!("dropping {} requests of a failed block", discarded.len());
            Err(err)
        }
    };
    reinject(stash)?;
    result
}

/// [`with_replies_pipeline`] with the replies collapsed as in [`run_block`].
pub fn with_replies<T, F>(body: F) -> RedisResult<T>
where
    T: FromRedisValue,
    F: FnOnce() -> RedisResult<()>,
{
    let replies = with_replies_pipeline(body)?;
    from_owned_redis_value(collapse(replies)?)
}

struct ParserGuard {
    depth: usize,
}

impl Drop for ParserGuard {
    fn drop(&mut self) {
        CONTEXTS.with(|contexts| {
            if let Some(context) = contexts.borrow_mut().get_mut(self.depth) {
                context.parsers.pop();
            }
        });
    }
}

/// Runs `body` with `parser` pushed onto the active context's parser stack.
///
/// Without an active context `body` simply runs.
pub fn parse<R>(parser: ReplyParser, body: impl FnOnce() -> R) -> R {
    let pushed = CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        let depth = contexts.len().checked_sub(1)?;
        contexts[depth].parsers.push(parser);
        Some(depth)
    });
    let _guard = pushed.map(|depth| ParserGuard { depth });
    body()
}

struct RestoreParsers {
    depth: usize,
    parsers: Vec<ReplyParser>,
}

impl Drop for RestoreParsers {
    fn drop(&mut self) {
        let parsers = mem::take(&mut self.parsers);
        CONTEXTS.with(|contexts| {
            if let Some(context) = contexts.borrow_mut().get_mut(self.depth) {
                context.parsers = parsers;
            }
        });
    }
}

/// Runs `body` with an empty parser stack.
pub fn without_parsers<R>(body: impl FnOnce() -> R) -> R {
    let saved = CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        let depth = contexts.len().checked_sub(1)?;
        Some(RestoreParsers {
            depth,
            parsers: mem::take(&mut contexts[depth].parsers),
        })
    });
    let _guard = saved;
    body()
}

/// Server identity of the connection behind the active context.
pub fn current_connection_id() -> Option<String> {
    CONTEXTS.with(|contexts| {
        let contexts = contexts.borrow();
        let top = contexts.last()?;
        let con = top.conn.try_borrow().ok()?;
        Some(con.connection_id().to_string())
    })
}
