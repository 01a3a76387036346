//! redpipe is a blocking Redis client built around implicit pipelining.
//!
//! Commands are not sent one by one.  A block of code runs inside an
//! execution context bound to one pooled connection; every command it
//! queues is buffered and the whole batch goes out in a single round trip
//! when the block ends.  The replies come back in the order the commands
//! were queued.
//!
//! ```rust,no_run
//! use redpipe::{cmd, run_pipeline, Pool, PoolConfig};
//!
//! fn do_something() -> redpipe::RedisResult<()> {
//!     let pool = Pool::open("redis://127.0.0.1/", PoolConfig::default())?;
//!     let replies = run_pipeline(&pool, || {
//!         cmd("SET").arg("my_key").arg(42).queue()?;
//!         cmd("INCR").arg("my_key").queue()
//!     })?;
//!     assert_eq!(replies.len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! # Contexts
//!
//! Contexts live on a per-thread stack.  [`run_pipeline`] pushes one,
//! runs the body and flushes it; [`run_block`] does the same and folds the
//! replies into one value.  Contexts nest: a nested block sends whatever
//! the enclosing block has queued so far, runs on its own, and the
//! enclosing block later sees the stashed replies in their original
//! positions.
//!
//! Code that needs a reply before it can go on uses [`with_replies`],
//! which sends the commands queued by its body right away and returns
//! their replies.  [`return_value`] injects a value into the reply
//! sequence without a round trip.
//!
//! # Reply parsers
//!
//! [`parse`] installs a [`ReplyParser`] for the commands queued inside it.
//! Parsers compose from the outermost inward and never see server
//! errors.  [`ReplyParser::suppress`] hides replies altogether.
//!
//! # Scripts
//!
//! Scripts are sent by digest first.  When the server does not know the
//! digest yet, an `EVAL` carrying the full source takes its place.  See
//! [`eval`], [`eval_templated`] and [`Script`].
//!
//! # Transactions and compare-and-swap
//!
//! [`atomic`] runs an optimistic `WATCH`/`MULTI`/`EXEC` transaction with
//! retries.  [`compare_and_set`] and [`swap`] implement compare-and-swap
//! on keys and hash fields through scripts.
//!
//! # Listeners
//!
//! A [`Listener`] owns a dedicated connection and a thread dispatching the
//! messages the server pushes.  [`PubSubListener`] routes pub/sub
//! messages to per-channel handlers.

// public api
pub use crate::cas::{
    compare_and_set, compare_and_set_field, swap, swap_field, CasWrite, Swap, DIGEST_THRESHOLD,
};
pub use crate::client::Client;
pub use crate::cmd::{cmd, pack_command, pack_pipeline, Cmd};
pub use crate::connection::{
    connect, parse_redis_url, Connection, ConnectionHandle, ConnectionInfo, ConnectionLike,
    IntoConnectionInfo, PushConnection, TcpHandle,
};
pub use crate::context::{
    current_connection_id, in_context, parse, return_value, run_block, run_pipeline,
    with_replies, with_replies_pipeline, without_parsers,
};
pub use crate::listener::{
    ErrorHandler, Handler, HandlerError, Listener, ListenerError, ListenerOptions,
};
pub use crate::parser::{parse_redis_value, Parser};
pub use crate::pipeline::ReplyParser;
pub use crate::pool::{ConnectionPool, Pool, PoolConfig};
pub use crate::pubsub::{MessageHandler, Msg, PubSubListener, Subscriptions};
pub use crate::scan::{hscan_step, reduce_hash_scan, reduce_scan, scan_step, Reduced};
pub use crate::script::{
    eval, eval_local_fast, eval_templated, render_template, sha1_hex, Script, ScriptInvocation,
};
pub use crate::transaction::{atomic, atomic_with};

// preserve grouping and order
#[rustfmt::skip]
pub use crate::types::{
    // utility functions
    from_redis_value,
    from_owned_redis_value,
    freeze,
    is_frozen,
    thaw,

    // conversion traits
    FromRedisValue,
    RedisWrite,
    ToRedisArgs,

    // frozen values
    Frozen,
    FROZEN_HEADER,

    // low level values
    Value,
};

#[rustfmt::skip]
pub use crate::errors::{
    make_extension_error,

    ErrorKind,
    RedisError,
    RedisResult,
    ServerError,
    ServerErrorKind,
};

#[macro_use]
mod macros;

mod cas;
mod client;
mod cmd;
mod connection;
mod context;
mod errors;
mod listener;
mod parser;
mod pipeline;
mod pool;
mod pubsub;
mod scan;
mod script;
mod transaction;
mod types;
