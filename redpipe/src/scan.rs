//! Folding over cursor-based scans.
//!
//! A scan step takes a cursor and returns the next cursor with one batch.
//! Iteration starts at cursor `"0"` and ends when the server hands `"0"`
//! back, or earlier when the reducer returns [`Reduced::Done`].

use std::collections::HashSet;
use std::hash::Hash;

use crate::cmd::cmd;
use crate::context::{parse, with_replies, without_parsers};
use crate::errors::{ErrorKind, RedisResult};
use crate::pipeline::ReplyParser;
use crate::types::{from_owned_redis_value, FromRedisValue, ToRedisArgs, Value};

/// Accumulator returned by a reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduced<A> {
    /// Keep scanning.
    Continue(A),
    /// Stop and return this value.
    Done(A),
}

/// Folds every batch of a scan into an accumulator.
pub fn reduce_scan<A, T, R, S>(mut reduce: R, init: A, mut scan_step: S) -> RedisResult<A>
where
    R: FnMut(A, Vec<T>) -> Reduced<A>,
    S: FnMut(&str) -> RedisResult<(String, Vec<T>)>,
{
    let mut cursor = "0".to_string();
    let mut acc = init;
    loop {
        let (next, batch) = scan_step(&cursor)?;
        acc = match reduce(acc, batch) {
            Reduced::Continue(acc) => acc,
            Reduced::Done(acc) => return Ok(acc),
        };
        if next == "0" {
            return Ok(acc);
        }
        cursor = next;
    }
}

/// Folds every field of a hash scan into an accumulator.
///
/// A field the server delivers more than once is only passed to `reduce`
/// the first time.
pub fn reduce_hash_scan<A, K, V, R, S>(mut reduce: R, init: A, scan_step: S) -> RedisResult<A>
where
    K: Eq + Hash + Clone,
    R: FnMut(A, K, V) -> Reduced<A>,
    S: FnMut(&str) -> RedisResult<(String, Vec<(K, V)>)>,
{
    let mut seen = HashSet::new();
    reduce_scan(
        |mut acc, batch| {
            for (key, value) in batch {
                if !seen.insert(key.clone()) {
                    continue;
                }
                acc = match reduce(acc, key, value) {
                    Reduced::Continue(acc) => acc,
                    done @ Reduced::Done(_) => return done,
                };
            }
            Reduced::Continue(acc)
        },
        init,
        scan_step,
    )
}

fn scan_reply(body: impl FnOnce() -> RedisResult<()>) -> RedisResult<(String, Vec<Value>)> {
    let reply: Value = without_parsers(|| parse(ReplyParser::raw(), || with_replies(body)))?;
    if !reply.looks_like_cursor() {
        fail!((
            ErrorKind::TypeError,
            "Response was not a cursor reply",
            format!("{reply:?}")
        ));
    }
    from_owned_redis_value(reply)
}

/// A scan step running `SCAN cursor MATCH pattern` in the current context.
pub fn scan_step<T: FromRedisValue>(
    pattern: &str,
) -> impl FnMut(&str) -> RedisResult<(String, Vec<T>)> + '_ {
    move |cursor: &str| {
        let (next, keys) =
            scan_reply(|| cmd("SCAN").arg(cursor).arg("MATCH").arg(pattern).queue())?;
        let keys = keys
            .into_iter()
            .map(from_owned_redis_value)
            .collect::<RedisResult<Vec<T>>>()?;
        Ok((next, keys))
    }
}

/// A scan step running `HSCAN key cursor` in the current context.
pub fn hscan_step<K, F, V>(key: K) -> impl FnMut(&str) -> RedisResult<(String, Vec<(F, V)>)>
where
    K: ToRedisArgs,
    F: FromRedisValue,
    V: FromRedisValue,
{
    move |cursor: &str| {
        let (next, flat) = scan_reply(|| cmd("HSCAN").arg(&key).arg(cursor).queue())?;
        if flat.len() % 2 != 0 {
            fail!((
                ErrorKind::TypeError,
                "HSCAN returned an odd number of elements"
            ));
        }
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut items = flat.into_iter();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            pairs.push((from_owned_redis_value(field)?, from_owned_redis_value(value)?));
        }
        Ok((next, pairs))
    }
}
