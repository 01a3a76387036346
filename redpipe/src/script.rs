use std::sync::OnceLock;

use dashmap::{DashMap, DashSet};
use log::debug;
use sha1_smol::Sha1;

use crate::cmd::{cmd, Cmd};
use crate::connection::ConnectionLike;
use crate::context::{self, current_connection_id, parse, return_value, with_replies, without_parsers};
use crate::errors::{ErrorKind, RedisError, RedisResult};
use crate::pipeline::ReplyParser;
use crate::types::{from_owned_redis_value, FromRedisValue, ToRedisArgs, Value};

// Both caches live for the whole process and are never invalidated.
fn digests() -> &'static DashMap<String, String> {
    static DIGESTS: OnceLock<DashMap<String, String>> = OnceLock::new();
    DIGESTS.get_or_init(DashMap::new)
}

fn loaded() -> &'static DashSet<(String, String)> {
    static LOADED: OnceLock<DashSet<(String, String)>> = OnceLock::new();
    LOADED.get_or_init(DashSet::new)
}

/// Returns the hex encoded sha1 of `data`, as `redis.sha1hex` computes it.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hash = Sha1::new();
    hash.update(data);
    hash.digest().to_string()
}

/// Represents a lua script.
#[derive(Debug, Clone)]
pub struct Script {
    code: String,
    hash: String,
}

/// The script object represents a lua script that can be executed on the
/// redis server.  The digest of each distinct script text is computed once
/// per process.
///
/// Example:
///
/// ```rust,no_run
/// # let client = redpipe::Client::open("redis://127.0.0.1/").unwrap();
/// # let mut con = client.get_connection().unwrap();
/// let script = redpipe::Script::new(r"
///     return tonumber(ARGV[1]) + tonumber(ARGV[2]);
/// ");
/// let result = script.arg(1).arg(2).invoke(&mut con);
/// assert_eq!(result, Ok(3));
/// ```
impl Script {
    /// Creates a new script object.
    pub fn new(code: &str) -> Script {
        let hash = match digests().get(code) {
            Some(hash) => hash.value().clone(),
            None => {
                let hash = sha1_hex(code.as_bytes());
                digests().insert(code.to_string(), hash.clone());
                hash
            }
        };
        Script {
            code: code.to_string(),
            hash,
        }
    }

    /// Returns the script's SHA1 hash in hexadecimal format.
    pub fn get_hash(&self) -> &str {
        &self.hash
    }

    /// Returns the script text.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Creates a script invocation object with a key filled in.
    #[inline]
    pub fn key<T: ToRedisArgs>(&self, key: T) -> ScriptInvocation<'_> {
        ScriptInvocation {
            script: self,
            args: vec![],
            keys: key.to_redis_args(),
        }
    }

    /// Creates a script invocation object with an argument filled in.
    #[inline]
    pub fn arg<T: ToRedisArgs>(&self, arg: T) -> ScriptInvocation<'_> {
        ScriptInvocation {
            script: self,
            args: arg.to_redis_args(),
            keys: vec![],
        }
    }

    /// Returns an empty script invocation object.
    #[inline]
    pub fn prepare_invoke(&self) -> ScriptInvocation<'_> {
        ScriptInvocation {
            script: self,
            args: vec![],
            keys: vec![],
        }
    }

    /// Invokes the script directly without arguments.
    #[inline]
    pub fn invoke<T: FromRedisValue>(&self, con: &mut dyn ConnectionLike) -> RedisResult<T> {
        self.prepare_invoke().invoke(con)
    }
}

/// Represents a prepared script call.
pub struct ScriptInvocation<'a> {
    script: &'a Script,
    args: Vec<Vec<u8>>,
    keys: Vec<Vec<u8>>,
}

/// This type collects keys and other arguments for the script so that it
/// can be then invoked.
impl<'a> ScriptInvocation<'a> {
    /// Adds a regular argument to the invocation.  This ends up as `ARGV[i]`
    /// in the script.
    #[inline]
    pub fn arg<'b, T: ToRedisArgs>(&'b mut self, arg: T) -> &'b mut ScriptInvocation<'a>
    where
        'a: 'b,
    {
        arg.write_redis_args(&mut self.args);
        self
    }

    /// Adds a key argument to the invocation.  This ends up as `KEYS[i]`
    /// in the script.
    #[inline]
    pub fn key<'b, T: ToRedisArgs>(&'b mut self, key: T) -> &'b mut ScriptInvocation<'a>
    where
        'a: 'b,
    {
        key.write_redis_args(&mut self.keys);
        self
    }

    /// Invokes the script on `con` outside of any context.
    ///
    /// `EVALSHA` is tried first; a `NOSCRIPT` reply is answered with a
    /// single `EVAL` carrying the full text.
    pub fn invoke<T: FromRedisValue>(&self, con: &mut dyn ConnectionLike) -> RedisResult<T> {
        match con.req_command(&self.eval_cmd())? {
            Value::ServerError(err) if err.is_no_script() => {
                debug!("script {} not loaded, sending its text", self.script.hash);
                from_owned_redis_value(con.req_command(&self.eval_text_cmd())?)
            }
            reply => from_owned_redis_value(reply),
        }
    }

    /// Queues the script in the active context.
    ///
    /// `EVALSHA` runs immediately, on its own and without parsers.  When
    /// the server knows the script its reply is returned into the context
    /// under the active parsers; otherwise an `EVAL` with the full text is
    /// queued and its reply is the result.
    pub fn queue(&self) -> RedisResult<()> {
        let evalsha = self.eval_cmd();
        let mut replies = without_parsers(|| {
            parse(ReplyParser::raw(), || {
                context::with_replies_pipeline(|| evalsha.queue())
            })
        })?;
        match replies.pop() {
            Some(Value::ServerError(err)) if err.is_no_script() => {
                debug!("script {} not loaded, queueing EVAL", self.script.hash);
                self.eval_text_cmd().queue()
            }
            Some(reply) => return_value(reply),
            None => fail!((ErrorKind::ParseError, "EVALSHA produced no reply")),
        }
    }

    /// Loads the script and returns the SHA1 of it.
    #[inline]
    pub fn load(&self, con: &mut dyn ConnectionLike) -> RedisResult<String> {
        let hash: String = self.load_cmd().query(con)?;

        debug_assert_eq!(hash, self.script.hash);

        Ok(hash)
    }

    fn load_cmd(&self) -> Cmd {
        let mut cmd = cmd("SCRIPT");
        cmd.arg("LOAD").arg(self.script.code.as_bytes());
        cmd
    }

    fn eval_cmd(&self) -> Cmd {
        let mut cmd = cmd("EVALSHA");
        cmd.arg(self.script.hash.as_bytes())
            .arg(self.keys.len())
            .arg(&*self.keys)
            .arg(&*self.args);
        cmd
    }

    fn eval_text_cmd(&self) -> Cmd {
        let mut cmd = cmd("EVAL");
        cmd.arg(self.script.code.as_bytes())
            .arg(self.keys.len())
            .arg(&*self.keys)
            .arg(&*self.args);
        cmd
    }
}

/// Queues `script` in the active context with EVALSHA/EVAL fallback.
pub fn eval<K: ToRedisArgs, A: ToRedisArgs>(script: &str, keys: K, args: A) -> RedisResult<()> {
    let script = Script::new(script);
    let mut invocation = script.prepare_invoke();
    invocation.key(keys).arg(args);
    invocation.queue()
}

/// Rewrites `_:name` placeholders into `KEYS[i]` and `ARGV[i]` references.
///
/// Indices are 1-based in declaration order.  Longer names are substituted
/// first, so `_:ab` is never mistaken for `_:a` followed by `b`.  A name
/// declared both as key and as argument refers to the key.
pub fn render_template(template: &str, key_names: &[&str], arg_names: &[&str]) -> String {
    let mut substitutions: Vec<(String, String)> = Vec::new();
    for (idx, name) in key_names.iter().enumerate() {
        substitutions.push((format!("_:{name}"), format!("KEYS[{}]", idx + 1)));
    }
    for (idx, name) in arg_names.iter().enumerate() {
        substitutions.push((format!("_:{name}"), format!("ARGV[{}]", idx + 1)));
    }
    // stable sort keeps keys ahead of arguments of the same name
    substitutions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut rendered = template.to_string();
    for (placeholder, replacement) in substitutions {
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

/// Encodes `value` as a single command argument.
pub(crate) fn single_arg<T: ToRedisArgs>(value: T) -> RedisResult<Vec<u8>> {
    let mut args = value.to_redis_args();
    if args.len() != 1 {
        fail!((
            ErrorKind::TypeError,
            "Value must encode to exactly one argument",
            format!("got {} arguments", args.len())
        ));
    }
    Ok(args.remove(0))
}

fn split_named<'a, T: ToRedisArgs>(
    named: &[(&'a str, T)],
) -> RedisResult<(Vec<&'a str>, Vec<Vec<u8>>)> {
    let mut names = Vec::with_capacity(named.len());
    let mut values = Vec::with_capacity(named.len());
    for (name, value) in named {
        names.push(*name);
        values.push(single_arg(value)?);
    }
    Ok((names, values))
}

/// Renders `template` and queues it with [`eval`].
///
/// Every value must produce exactly one argument so that its position
/// matches the index of its name.
pub fn eval_templated<K: ToRedisArgs, A: ToRedisArgs>(
    template: &str,
    keys: &[(&str, K)],
    args: &[(&str, A)],
) -> RedisResult<()> {
    let (key_names, key_values) = split_named(keys)?;
    let (arg_names, arg_values) = split_named(args)?;
    let script = render_template(template, &key_names, &arg_names);
    eval(&script, key_values, arg_values)
}

/// Like [`eval_templated`] but skips the `EVALSHA` round trip.
///
/// The first use of a script on a server sends `SCRIPT LOAD` and records
/// the server as having the script; later uses queue `EVALSHA` directly.
/// The record is local to this process and is never refreshed, so a
/// server that lost its scripts (restart, failover) answers `NOSCRIPT`
/// until the process restarts.
pub fn eval_local_fast<K: ToRedisArgs, A: ToRedisArgs>(
    template: &str,
    keys: &[(&str, K)],
    args: &[(&str, A)],
) -> RedisResult<()> {
    let (key_names, key_values) = split_named(keys)?;
    let (arg_names, arg_values) = split_named(args)?;
    let script = Script::new(&render_template(template, &key_names, &arg_names));
    let mut invocation = script.prepare_invoke();
    invocation.key(key_values).arg(arg_values);

    let conn_id = current_connection_id().ok_or_else(|| {
        RedisError::from((
            ErrorKind::ClientError,
            "No execution context is active on this thread",
        ))
    })?;
    let entry = (conn_id, script.get_hash().to_string());
    if !loaded().contains(&entry) {
        let load = invocation.load_cmd();
        let hash: String =
            without_parsers(|| parse(ReplyParser::raw(), || with_replies(|| load.queue())))?;
        debug!("loaded script {} on {}", hash, entry.0);
        loaded().insert(entry);
    }
    invocation.eval_cmd().queue()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_eval_should_work() {
        let script = Script::new("return KEYS[1]");
        let invocation = script.key("dummy");
        let cmd = invocation.eval_cmd();
        let expected = "*4\r\n$7\r\nEVALSHA\r\n$40\r\n4a2267357833227dd98abdedb8cf24b15a986445\r\n$1\r\n1\r\n$5\r\ndummy\r\n";
        assert_eq!(
            expected,
            std::str::from_utf8(cmd.get_packed_command().as_slice()).unwrap()
        );
    }

    #[test]
    fn digest_is_memoized_per_text() {
        let a = Script::new("return 1");
        let b = Script::new("return 1");
        assert_eq!(a.get_hash(), b.get_hash());
        assert_eq!(a.get_hash(), sha1_hex(b"return 1"));
        assert!(digests().contains_key("return 1"));
    }

    #[test]
    fn named_values_must_be_single_arguments() {
        let (names, values) = split_named(&[("a", "x"), ("b", "y")]).unwrap();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(values, vec![b"x".to_vec(), b"y".to_vec()]);

        let err = split_named(&[("a", vec!["x", "y"]), ("b", vec!["z"])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeError);
    }

    #[test]
    fn template_uses_one_based_indices() {
        assert_eq!(
            render_template("_:k _:a", &["k"], &["a"]),
            "KEYS[1] ARGV[1]"
        );
        assert_eq!(
            render_template(
                "redis.call('SET', _:key, _:value) return _:key2",
                &["key", "key2"],
                &["value"],
            ),
            "redis.call('SET', KEYS[1], ARGV[1]) return KEYS[2]"
        );
    }

    #[test]
    fn longer_names_win() {
        assert_eq!(
            render_template("_:ab _:a", &["a"], &["ab"]),
            "ARGV[1] KEYS[1]"
        );
    }
}
