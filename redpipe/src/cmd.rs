use std::fmt;
use std::io::Write;

use crate::connection::ConnectionLike;
use crate::context;
use crate::errors::RedisResult;
use crate::types::{from_owned_redis_value, FromRedisValue, RedisWrite, ToRedisArgs};

/// Represents redis commands.
#[derive(Clone, Default)]
pub struct Cmd {
    data: Vec<u8>,
    // offsets marking the end of each argument in `data`
    args: Vec<usize>,
}

fn countdigits(mut v: usize) -> usize {
    let mut result = 1;
    loop {
        if v < 10 {
            return result;
        }
        if v < 100 {
            return result + 1;
        }
        if v < 1000 {
            return result + 2;
        }
        if v < 10000 {
            return result + 3;
        }

        v /= 10000;
        result += 4;
    }
}

#[inline]
fn bulklen(len: usize) -> usize {
    1 + countdigits(len) + 2 + len + 2
}

fn args_len<'a, I>(args: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]> + ExactSizeIterator,
{
    let mut totlen = 1 + countdigits(args.len()) + 2;
    for item in args {
        totlen += bulklen(item.len());
    }
    totlen
}

fn write_command<'a, I>(out: &mut Vec<u8>, args: I)
where
    I: IntoIterator<Item = &'a [u8]> + Clone + ExactSizeIterator,
{
    out.reserve(args_len(args.clone()));

    let mut buf = ::itoa::Buffer::new();
    out.push(b'*');
    out.extend_from_slice(buf.format(args.len()).as_bytes());
    out.extend_from_slice(b"\r\n");

    for bytes in args {
        out.push(b'$');
        out.extend_from_slice(buf.format(bytes.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
    }
}

impl RedisWrite for Cmd {
    fn write_arg(&mut self, arg: &[u8]) {
        self.data.extend_from_slice(arg);
        self.args.push(self.data.len());
    }

    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        // writing into a Vec<u8> cannot fail
        let _ = write!(self.data, "{arg}");
        self.args.push(self.data.len());
    }
}

/// A command acts as a builder interface to creating encoded redis
/// requests.  This allows you to easiy assemble a packed command
/// by chaining arguments together.
///
/// ```rust
/// redpipe::cmd("SET").arg("my_key").arg(42);
/// ```
///
/// A command is either executed directly with [`Cmd::query`] or added to
/// the batch of the active context with [`Cmd::queue`].
impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd::default()
    }

    /// Appends an argument to the command.  The argument passed must
    /// be a type that implements `ToRedisArgs`.  Most primitive types as
    /// well as vectors of primitive types implement it.
    #[inline]
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Cmd {
        arg.write_redis_args(self);
        self
    }

    /// Returns the packed command as a byte vector.
    #[inline]
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut cmd = Vec::new();
        self.write_packed_command(&mut cmd);
        cmd
    }

    pub(crate) fn write_packed_command(&self, cmd: &mut Vec<u8>) {
        write_command(cmd, self.args_iter())
    }

    /// Sends the command as query to the connection and converts the
    /// result to the target redis value.  This bypasses any active
    /// context.
    #[inline]
    pub fn query<T: FromRedisValue>(&self, con: &mut dyn ConnectionLike) -> RedisResult<T> {
        let pcmd = self.get_packed_command();
        let val = con.req_packed_command(&pcmd)?;
        from_owned_redis_value(val)
    }

    /// Adds the command to the pending batch of the active context.
    ///
    /// The reply becomes available once the context flushes, at the
    /// position the command was queued at.  Fails with a client error when
    /// no context is active on this thread.
    pub fn queue(&self) -> RedisResult<()> {
        context::enqueue(self.clone())
    }

    /// Returns an iterator over the arguments in this command (including the command name itself)
    pub fn args_iter(&self) -> impl Iterator<Item = &[u8]> + Clone + ExactSizeIterator {
        let mut prev = 0;
        self.args.iter().map(move |&end| {
            let arg = &self.data[prev..end];
            prev = end;
            arg
        })
    }

    /// Returns the command name, i.e. the first argument.
    pub fn name(&self) -> Option<&[u8]> {
        self.args_iter().next()
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in self.args_iter() {
            list.entry(&String::from_utf8_lossy(arg));
        }
        list.finish()
    }
}

/// Shortcut function to creating a command with a single argument.
///
/// The first argument of a redis command is always the name of the
/// command which needs to be a string.  This is the recommended way
/// to start a command pipe.
///
/// ```rust
/// redpipe::cmd("PING");
/// ```
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

/// Packs a bunch of commands into a request.
///
/// ```rust
/// # use redpipe::ToRedisArgs;
/// let mut args = vec![];
/// args.extend("SET".to_redis_args());
/// args.extend("my_key".to_redis_args());
/// args.extend(42.to_redis_args());
/// let cmd = redpipe::pack_command(&args);
/// assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$6\r\nmy_key\r\n$2\r\n42\r\n".to_vec());
/// ```
pub fn pack_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    write_command(&mut out, args.iter().map(|x| &x[..]));
    out
}

/// Packs several commands back to back, the way a pipeline sends them.
pub fn pack_pipeline<'a, I>(cmds: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Cmd>,
{
    let mut out = Vec::new();
    for cmd in cmds {
        cmd.write_packed_command(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_arguments_in_order() {
        let mut c = cmd("SET");
        c.arg("foo").arg(42);
        assert_eq!(
            c.get_packed_command(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$2\r\n42\r\n".to_vec()
        );
        assert_eq!(c.name(), Some(&b"SET"[..]));
        assert_eq!(c.args_iter().len(), 3);
    }

    #[test]
    fn pipeline_is_concatenation() {
        let a = cmd("PING");
        let mut b = cmd("GET");
        b.arg("k");
        let mut expected = a.get_packed_command();
        expected.extend(b.get_packed_command());
        assert_eq!(pack_pipeline([&a, &b]), expected);
    }

    #[test]
    fn counts_digits() {
        assert_eq!(countdigits(0), 1);
        assert_eq!(countdigits(9), 1);
        assert_eq!(countdigits(10), 2);
        assert_eq!(countdigits(12345), 5);
        assert_eq!(
            args_len([&b"GET"[..], &b"key"[..]].into_iter()),
            cmd("GET").arg("key").get_packed_command().len()
        );
    }
}
