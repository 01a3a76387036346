use std::fmt;
use std::sync::Arc;

use log::{debug, trace};

use crate::cmd::{pack_pipeline, Cmd};
use crate::connection::ConnectionLike;
use crate::errors::{ErrorKind, RedisResult};
use crate::types::{thaw, Value};

type ParseFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone)]
enum ParserKind {
    Raw,
    Suppress,
    Thaw,
    Func(ParseFn),
}

/// A transformation applied to replies before they reach the caller.
///
/// Parsers are pushed with [`crate::parse`] and apply to every command
/// queued while they are active.  Server error replies are never handed
/// to a parser.
#[derive(Clone)]
pub struct ReplyParser {
    kind: ParserKind,
}

impl ReplyParser {
    /// Wraps a function mapping one reply to another.
    pub fn new<F>(f: F) -> ReplyParser
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        ReplyParser {
            kind: ParserKind::Func(Arc::new(f)),
        }
    }

    /// Disables the pool's automatic decoding of frozen payloads.
    pub fn raw() -> ReplyParser {
        ReplyParser {
            kind: ParserKind::Raw,
        }
    }

    /// Drops replies from the result sequence.
    pub fn suppress() -> ReplyParser {
        ReplyParser {
            kind: ParserKind::Suppress,
        }
    }

    /// Decodes frozen payloads with [`crate::thaw`].
    pub fn thaw() -> ReplyParser {
        ReplyParser {
            kind: ParserKind::Thaw,
        }
    }
}

impl fmt::Debug for ReplyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            ParserKind::Raw => "raw",
            ParserKind::Suppress => "suppress",
            ParserKind::Thaw => "thaw",
            ParserKind::Func(_) => "func",
        };
        write!(f, "ReplyParser({name})")
    }
}

#[derive(Clone)]
enum Step {
    Thaw,
    Func(ParseFn),
}

/// The parser stack of a context, flattened at enqueue time.
#[derive(Clone, Default)]
pub(crate) struct ComposedParser {
    steps: Vec<Step>,
    suppress: bool,
}

impl ComposedParser {
    /// Leaves replies untouched.
    pub(crate) fn identity() -> ComposedParser {
        ComposedParser::default()
    }

    /// Flattens `parsers` outermost first.
    pub(crate) fn compose(parsers: &[ReplyParser], auto_thaw: bool) -> ComposedParser {
        let raw = parsers
            .iter()
            .any(|parser| matches!(parser.kind, ParserKind::Raw));
        let mut composed = ComposedParser::default();
        if auto_thaw && !raw {
            composed.steps.push(Step::Thaw);
        }
        for parser in parsers {
            match parser.kind {
                ParserKind::Raw => {}
                ParserKind::Suppress => composed.suppress = true,
                ParserKind::Thaw => composed.steps.push(Step::Thaw),
                ParserKind::Func(ref f) => composed.steps.push(Step::Func(f.clone())),
            }
        }
        composed
    }

    /// Runs `value` through the steps.  `None` means the reply is dropped.
    pub(crate) fn apply(&self, value: Value) -> Option<Value> {
        if self.suppress {
            if let Value::ServerError(ref err) = value {
                debug!("suppressed server error reply: {err}");
            }
            return None;
        }
        if matches!(value, Value::ServerError(_)) {
            return Some(value);
        }
        Some(self.steps.iter().fold(value, |value, step| match step {
            Step::Thaw => thaw(value),
            Step::Func(f) => f(value),
        }))
    }
}

/// One entry of a context's pending batch.
pub(crate) enum Request {
    /// A command sent to the server when the batch flushes.
    Command { cmd: Cmd, parser: ComposedParser },
    /// A reply produced locally that takes a slot in the result sequence.
    Local { value: Value, parser: ComposedParser },
}

/// Sends the commands among `requests` as one batch and returns exactly
/// one reply per command.
pub(crate) fn send_commands(
    con: &mut dyn ConnectionLike,
    requests: &[Request],
) -> RedisResult<Vec<Value>> {
    let cmds: Vec<&Cmd> = requests
        .iter()
        .filter_map(|request| match request {
            Request::Command { cmd, .. } => Some(cmd),
            Request::Local { .. } => None,
        })
        .collect();
    if cmds.is_empty() {
        return Ok(vec![]);
    }
    trace!(
        "sending {} commands to {}",
        cmds.len(),
        con.connection_id()
    );
    let packed = pack_pipeline(cmds.iter().copied());
    let replies = con.req_packed_commands(&packed, 0, cmds.len())?;
    if replies.len() != cmds.len() {
        fail!((
            ErrorKind::ParseError,
            "Reply count does not match the number of commands sent",
            format!("sent {}, received {}", cmds.len(), replies.len())
        ));
    }
    Ok(replies)
}

/// Produces the reply sequence in request order, merging local values at
/// their positions and running each request's parser.
pub(crate) fn merge_replies(requests: Vec<Request>, replies: Vec<Value>) -> Vec<Value> {
    let mut replies = replies.into_iter();
    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        let (value, parser) = match request {
            // send_commands returned one reply per command
            Request::Command { parser, .. } => (replies.next().unwrap_or(Value::Nil), parser),
            Request::Local { value, parser } => (value, parser),
        };
        if let Some(value) = parser.apply(value) {
            out.push(value);
        }
    }
    out
}

/// Collapses a reply sequence into a single value.
///
/// No replies give nil, a single reply is returned as is (an error reply
/// becomes `Err`), several replies become an array.
pub(crate) fn collapse(mut replies: Vec<Value>) -> RedisResult<Value> {
    match replies.len() {
        0 => Ok(Value::Nil),
        1 => replies.remove(0).extract_error(),
        _ => Ok(Value::Array(replies)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServerError;
    use crate::types::freeze;

    fn upper() -> ReplyParser {
        ReplyParser::new(|v| match v {
            Value::BulkString(b) => Value::BulkString(b.to_ascii_uppercase()),
            other => other,
        })
    }

    fn suffix() -> ReplyParser {
        ReplyParser::new(|v| match v {
            Value::BulkString(mut b) => {
                b.extend_from_slice(b"-x");
                Value::BulkString(b)
            }
            other => other,
        })
    }

    #[test]
    fn parsers_compose_outermost_first() {
        let composed = ComposedParser::compose(&[suffix(), upper()], false);
        assert_eq!(
            composed.apply(Value::BulkString(b"a".to_vec())),
            Some(Value::BulkString(b"A-X".to_vec()))
        );
        let composed = ComposedParser::compose(&[upper(), suffix()], false);
        assert_eq!(
            composed.apply(Value::BulkString(b"a".to_vec())),
            Some(Value::BulkString(b"A-x".to_vec()))
        );
    }

    #[test]
    fn errors_skip_parsers() {
        let composed = ComposedParser::compose(&[upper()], false);
        let err = Value::ServerError(ServerError::from_line("ERR nope"));
        assert_eq!(composed.apply(err.clone()), Some(err));
    }

    #[test]
    fn raw_disables_auto_thaw_only() {
        let frozen = Value::BulkString(freeze(&7).unwrap());
        let auto = ComposedParser::compose(&[], true);
        assert_eq!(auto.apply(frozen.clone()), Some(Value::Int(7)));

        let raw = ComposedParser::compose(&[ReplyParser::raw()], true);
        assert_eq!(raw.apply(frozen.clone()), Some(frozen.clone()));

        let explicit = ComposedParser::compose(&[ReplyParser::raw(), ReplyParser::thaw()], true);
        assert_eq!(explicit.apply(frozen), Some(Value::Int(7)));
    }

    #[test]
    fn locals_keep_their_slot() {
        let requests = vec![
            Request::Command {
                cmd: crate::cmd("GET"),
                parser: ComposedParser::identity(),
            },
            Request::Local {
                value: Value::Int(1),
                parser: ComposedParser::identity(),
            },
            Request::Command {
                cmd: crate::cmd("GET"),
                parser: ComposedParser::compose(&[ReplyParser::suppress()], false),
            },
            Request::Command {
                cmd: crate::cmd("GET"),
                parser: ComposedParser::identity(),
            },
        ];
        let out = merge_replies(
            requests,
            vec![Value::Int(10), Value::Int(20), Value::Int(30)],
        );
        assert_eq!(out, vec![Value::Int(10), Value::Int(1), Value::Int(30)]);
    }

    #[test]
    fn collapse_rules() {
        assert_eq!(collapse(vec![]).unwrap(), Value::Nil);
        assert_eq!(collapse(vec![Value::Okay]).unwrap(), Value::Okay);
        assert!(collapse(vec![Value::ServerError(ServerError::from_line("ERR x"))]).is_err());
        assert_eq!(
            collapse(vec![Value::Okay, Value::Int(1)]).unwrap(),
            Value::Array(vec![Value::Okay, Value::Int(1)])
        );
    }
}
