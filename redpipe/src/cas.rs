//! Compare-and-swap on string keys and hash fields.
//!
//! The comparison runs in a server-side script.  Values of at most 40
//! bytes are compared directly.  Longer values are compared by their
//! sha1 hex digest (40 characters), so the expected value never has to
//! travel to the server in full.

use crate::cmd::cmd;
use crate::context::{parse, with_replies, without_parsers};
use crate::errors::RedisResult;
use crate::pipeline::ReplyParser;
use crate::script::{eval_templated, sha1_hex, single_arg};
use crate::types::{FromRedisValue, ToRedisArgs, Value};

/// Values longer than this are compared by digest.
pub const DIGEST_THRESHOLD: usize = 40;

const CAS_TEMPLATE: &str = r"
local current = redis.call('GET', _:key)
if not current then return 0 end
if string.len(current) > 40 then
    if _:digest == '' or redis.sha1hex(current) ~= _:digest then return 0 end
elseif _:digest ~= '' or current ~= _:old then
    return 0
end
if _:delete == '1' then
    redis.call('DEL', _:key)
else
    redis.call('SET', _:key, _:new)
end
return 1
";

const CAS_FIELD_TEMPLATE: &str = r"
local current = redis.call('HGET', _:key, _:field)
if not current then return 0 end
if string.len(current) > 40 then
    if _:digest == '' or redis.sha1hex(current) ~= _:digest then return 0 end
elseif _:digest ~= '' or current ~= _:old then
    return 0
end
if _:delete == '1' then
    redis.call('HDEL', _:key, _:field)
else
    redis.call('HSET', _:key, _:field, _:new)
end
return 1
";

const READ_TEMPLATE: &str = r"
local current = redis.call('GET', _:key)
if not current then return {0, '', ''} end
return {1, current, redis.sha1hex(current)}
";

const READ_FIELD_TEMPLATE: &str = r"
local current = redis.call('HGET', _:key, _:field)
if not current then return {0, '', ''} end
return {1, current, redis.sha1hex(current)}
";

/// The write performed by a successful compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum CasWrite<V> {
    Set(V),
    Delete,
}

/// The decision of a [`swap`] callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Swap<V> {
    /// Write the value.
    Set(V),
    /// Delete the key (or field).
    Delete,
    /// Leave everything as it is and stop.
    Abort,
}

/// Runs `body` right away, keeping the caller's parsers away from the replies.
fn unparsed<T, F>(body: F) -> RedisResult<T>
where
    T: FromRedisValue,
    F: FnOnce() -> RedisResult<()>,
{
    without_parsers(|| parse(ReplyParser::raw(), || with_replies(body)))
}

/// Returns the `(old, digest)` script slots for an expected value.
fn comparison_slots(old: Vec<u8>, digest: Option<String>) -> (Vec<u8>, Vec<u8>) {
    if old.len() > DIGEST_THRESHOLD {
        let digest = digest.unwrap_or_else(|| sha1_hex(&old));
        (Vec::new(), digest.into_bytes())
    } else {
        (old, Vec::new())
    }
}

struct Target {
    key: Vec<u8>,
    field: Option<Vec<u8>>,
}

impl Target {
    fn queue_cas(
        &self,
        old: Vec<u8>,
        digest: Option<String>,
        write: CasWrite<Vec<u8>>,
    ) -> RedisResult<()> {
        let (old, digest) = comparison_slots(old, digest);
        let (delete, new) = match write {
            CasWrite::Set(new) => (b"0".to_vec(), new),
            CasWrite::Delete => (b"1".to_vec(), Vec::new()),
        };
        let mut args = vec![
            ("old", old),
            ("digest", digest),
            ("delete", delete),
            ("new", new),
        ];
        let template = match self.field {
            Some(ref field) => {
                args.push(("field", field.clone()));
                CAS_FIELD_TEMPLATE
            }
            None => CAS_TEMPLATE,
        };
        eval_templated(template, &[("key", self.key.clone())], &args)
    }

    fn read(&self) -> RedisResult<(bool, Vec<u8>, String)> {
        let (template, args) = match self.field {
            Some(ref field) => (READ_FIELD_TEMPLATE, vec![("field", field.clone())]),
            None => (READ_TEMPLATE, vec![]),
        };
        let (exists, value, digest): (i64, Vec<u8>, String) =
            unparsed(|| eval_templated(template, &[("key", self.key.clone())], &args))?;
        Ok((exists == 1, value, digest))
    }

    fn queue_set_missing(&self, value: Vec<u8>) -> RedisResult<()> {
        match self.field {
            Some(ref field) => cmd("HSETNX").arg(&self.key).arg(field).arg(value).queue(),
            None => cmd("SETNX").arg(&self.key).arg(value).queue(),
        }
    }

    fn swap<T, V, R, F>(
        &self,
        max_attempts: Option<usize>,
        abort_value: R,
        mut f: F,
    ) -> RedisResult<R>
    where
        T: FromRedisValue,
        V: ToRedisArgs,
        F: FnMut(Option<T>, bool) -> (Swap<V>, R),
    {
        let mut attempt = 0usize;
        while max_attempts.map_or(true, |max| attempt < max) {
            attempt += 1;
            let (exists, raw, digest) = self.read()?;
            let old = if exists {
                Some(T::from_owned_redis_value(Value::BulkString(raw.clone()))?)
            } else {
                None
            };
            let (decision, result) = f(old, !exists);
            let applied: i64 = match decision {
                Swap::Abort => return Ok(result),
                Swap::Delete if !exists => return Ok(result),
                Swap::Delete => {
                    unparsed(|| self.queue_cas(raw, Some(digest), CasWrite::Delete))?
                }
                Swap::Set(value) => {
                    let value = single_arg(value)?;
                    if exists {
                        unparsed(|| self.queue_cas(raw, Some(digest), CasWrite::Set(value)))?
                    } else {
                        unparsed(|| self.queue_set_missing(value))?
                    }
                }
            };
            if applied == 1 {
                return Ok(result);
            }
        }
        Ok(abort_value)
    }
}

fn cas_write<V: ToRedisArgs>(new: CasWrite<V>) -> RedisResult<CasWrite<Vec<u8>>> {
    Ok(match new {
        CasWrite::Set(value) => CasWrite::Set(single_arg(value)?),
        CasWrite::Delete => CasWrite::Delete,
    })
}

/// Queues a write of `key` that only happens if its value is `old`.
///
/// The reply is `1` when the write happened and `0` otherwise; a missing
/// key never matches.
pub fn compare_and_set<K, O, V>(key: K, old: O, new: CasWrite<V>) -> RedisResult<()>
where
    K: ToRedisArgs,
    O: ToRedisArgs,
    V: ToRedisArgs,
{
    let target = Target {
        key: single_arg(key)?,
        field: None,
    };
    target.queue_cas(single_arg(old)?, None, cas_write(new)?)
}

/// [`compare_and_set`] on a hash field.
pub fn compare_and_set_field<K, F, O, V>(
    key: K,
    field: F,
    old: O,
    new: CasWrite<V>,
) -> RedisResult<()>
where
    K: ToRedisArgs,
    F: ToRedisArgs,
    O: ToRedisArgs,
    V: ToRedisArgs,
{
    let target = Target {
        key: single_arg(key)?,
        field: Some(single_arg(field)?),
    };
    target.queue_cas(single_arg(old)?, None, cas_write(new)?)
}

/// Read-modify-write loop on `key`.
///
/// Each attempt reads the current value and passes it to `f` together
/// with a flag telling whether the key is missing.  `f` decides what to
/// write and what to return:
///
/// - [`Swap::Abort`] returns right away without writing.
/// - [`Swap::Delete`] deletes the key if it still holds the value read; a
///   key that was missing is left alone.
/// - [`Swap::Set`] writes the value if the key still holds the value read,
///   or if it is still missing when it was missing.
///
/// A write that lost a race starts the next attempt.  After
/// `max_attempts` lost races `abort_value` is returned; `None` retries
/// until a write succeeds.  Requires an active context.
pub fn swap<K, T, V, R, F>(
    key: K,
    max_attempts: Option<usize>,
    abort_value: R,
    f: F,
) -> RedisResult<R>
where
    K: ToRedisArgs,
    T: FromRedisValue,
    V: ToRedisArgs,
    F: FnMut(Option<T>, bool) -> (Swap<V>, R),
{
    Target {
        key: single_arg(key)?,
        field: None,
    }
    .swap(max_attempts, abort_value, f)
}

/// [`swap`] on a hash field.
pub fn swap_field<K, FN, T, V, R, F>(
    key: K,
    field: FN,
    max_attempts: Option<usize>,
    abort_value: R,
    f: F,
) -> RedisResult<R>
where
    K: ToRedisArgs,
    FN: ToRedisArgs,
    T: FromRedisValue,
    V: ToRedisArgs,
    F: FnMut(Option<T>, bool) -> (Swap<V>, R),
{
    Target {
        key: single_arg(key)?,
        field: Some(single_arg(field)?),
    }
    .swap(max_attempts, abort_value, f)
}
