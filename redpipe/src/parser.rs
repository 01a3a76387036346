use std::io::{self, Read};
use std::str;

use crate::errors::{ErrorKind, RedisError, RedisResult, ServerError};
use crate::types::Value;

const MAX_RECURSE_DEPTH: usize = 100;

fn parse_error(detail: String) -> RedisError {
    RedisError::from((ErrorKind::ParseError, "parse error", detail))
}

fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| start + pos)
}

fn parse_int(line: &[u8]) -> RedisResult<i64> {
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| parse_error(format!("expected integer, got {line:?}")))
}

/// One step of decoding: a complete scalar, or the header of an array
/// whose elements follow.
enum Item {
    Value(Value),
    ArrayHeader(usize),
}

/// Decodes the item at the start of `buf`.
///
/// Returns `Ok(None)` when the buffer ends before the item does, and the
/// number of bytes the item takes otherwise.
fn parse_item(buf: &[u8]) -> RedisResult<Option<(Item, usize)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    let Some(eol) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let line = &buf[1..eol];
    let next = eol + 2;

    let item = match marker {
        b'+' => {
            let line = str::from_utf8(line)?;
            if line == "OK" {
                Item::Value(Value::Okay)
            } else {
                Item::Value(Value::SimpleString(line.to_string()))
            }
        }
        b'-' => {
            let line = str::from_utf8(line)?;
            Item::Value(Value::ServerError(ServerError::from_line(line)))
        }
        b':' => Item::Value(Value::Int(parse_int(line)?)),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Item::Value(Value::Nil), next)));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(parse_error("bulk string is not terminated by CRLF".to_string()));
            }
            return Ok(Some((Item::Value(Value::BulkString(buf[next..end].to_vec())), end + 2)));
        }
        b'*' => match parse_int(line)? {
            len if len < 0 => Item::Value(Value::Nil),
            0 => Item::Value(Value::Array(vec![])),
            len => Item::ArrayHeader(len as usize),
        },
        other => {
            return Err(parse_error(format!(
                "unexpected response type byte {:?}",
                other as char
            )))
        }
    };
    Ok(Some((item, next)))
}

struct PartialArray {
    remaining: usize,
    items: Vec<Value>,
}

/// A resumable RESP2 reader.
///
/// Bytes read from the socket are buffered until they form a complete
/// item, and arrays are assembled element by element, so a read that
/// times out in the middle of a reply loses nothing and no byte is
/// decoded twice.
#[derive(Default)]
pub struct Parser {
    buffer: Vec<u8>,
    // arrays still waiting for elements, innermost last
    stack: Vec<PartialArray>,
}

impl Parser {
    /// Creates a new parser with an empty buffer.
    pub fn new() -> Parser {
        Parser::default()
    }

    /// Returns true if parts of an incomplete reply are buffered.
    pub fn has_pending_bytes(&self) -> bool {
        !self.buffer.is_empty() || !self.stack.is_empty()
    }

    /// Adds a decoded item to the reply being assembled, returning the
    /// reply once it is complete.
    fn push_item(&mut self, item: Item) -> RedisResult<Option<Value>> {
        let mut value = match item {
            Item::ArrayHeader(len) => {
                if self.stack.len() >= MAX_RECURSE_DEPTH {
                    self.stack.clear();
                    return Err(parse_error("Maximum recursion depth exceeded".to_string()));
                }
                self.stack.push(PartialArray {
                    remaining: len,
                    items: Vec::with_capacity(len.min(1024)),
                });
                return Ok(None);
            }
            Item::Value(value) => value,
        };
        while let Some(top) = self.stack.last_mut() {
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                return Ok(None);
            }
            let items = std::mem::take(&mut top.items);
            self.stack.pop();
            value = Value::Array(items);
        }
        Ok(Some(value))
    }

    /// Reads from `reader` until one complete value is decoded.
    pub fn parse_value<R: Read + ?Sized>(&mut self, reader: &mut R) -> RedisResult<Value> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            let mut pos = 0;
            let mut complete = None;
            while complete.is_none() {
                let Some((item, used)) = parse_item(&self.buffer[pos..])? else {
                    break;
                };
                pos += used;
                complete = self.push_item(item)?;
            }
            self.buffer.drain(..pos);
            if let Some(value) = complete {
                return Ok(value);
            }
            let read = reader.read(&mut chunk)?;
            if read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Parses bytes into a redis value.
///
/// This is the most straightforward way to parse something into a low
/// level redis value instead of having to use a whole parser.
pub fn parse_redis_value(mut bytes: &[u8]) -> RedisResult<Value> {
    let mut parser = Parser::new();
    parser.parse_value(&mut bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars() {
        assert_eq!(parse_redis_value(b"+OK\r\n").unwrap(), Value::Okay);
        assert_eq!(
            parse_redis_value(b"+QUEUED\r\n").unwrap(),
            Value::SimpleString("QUEUED".to_string())
        );
        assert_eq!(parse_redis_value(b":-12\r\n").unwrap(), Value::Int(-12));
        assert_eq!(parse_redis_value(b"$-1\r\n").unwrap(), Value::Nil);
        assert_eq!(
            parse_redis_value(b"$4\r\na\r\nb\r\n").unwrap(),
            Value::BulkString(b"a\r\nb".to_vec())
        );
    }

    #[test]
    fn errors_are_values() {
        let value = parse_redis_value(b"-NOSCRIPT No matching script\r\n").unwrap();
        match value {
            Value::ServerError(err) => assert!(err.is_no_script()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_arrays() {
        let value = parse_redis_value(b"*2\r\n$1\r\n0\r\n*1\r\n:1\r\n").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::BulkString(b"0".to_vec()),
                Value::Array(vec![Value::Int(1)]),
            ])
        );
    }

    #[test]
    fn truncated_input_is_eof() {
        let err = parse_redis_value(b"*2\r\n:1\r\n").unwrap_err();
        assert!(err.is_connection_dropped());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_redis_value(b"?what\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn resumes_after_partial_read() {
        let mut parser = Parser::new();
        let mut first: &[u8] = b"$5\r\nhel";
        assert!(parser.parse_value(&mut first).is_err());
        assert!(parser.has_pending_bytes());
        let mut rest: &[u8] = b"lo\r\n:7\r\n";
        assert_eq!(
            parser.parse_value(&mut rest).unwrap(),
            Value::BulkString(b"hello".to_vec())
        );
        assert_eq!(parser.parse_value(&mut rest).unwrap(), Value::Int(7));
    }

    /// Hands out its bytes a few at a time, like a socket under load.
    struct Trickle<'a> {
        bytes: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.bytes.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            self.bytes = &self.bytes[n..];
            Ok(n)
        }
    }

    #[test]
    fn large_reply_arrives_in_small_reads() {
        let count = 5000;
        let mut bytes = format!("*{count}\r\n").into_bytes();
        for i in 0..count {
            let item = i.to_string();
            bytes.extend_from_slice(format!("${}\r\n{item}\r\n", item.len()).as_bytes());
        }
        bytes.extend_from_slice(b":9\r\n");

        let mut parser = Parser::new();
        let mut reader = Trickle {
            bytes: &bytes,
            step: 3,
        };
        let value = parser.parse_value(&mut reader).unwrap();
        let Value::Array(items) = value else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), count);
        assert_eq!(items[0], Value::BulkString(b"0".to_vec()));
        assert_eq!(items[count - 1], Value::BulkString(b"4999".to_vec()));
        assert!(parser.stack.is_empty());
        assert_eq!(parser.parse_value(&mut reader).unwrap(), Value::Int(9));
        assert!(!parser.has_pending_bytes());
    }

    #[test]
    fn partial_array_survives_a_failed_read() {
        let mut parser = Parser::new();
        let mut first: &[u8] = b"*3\r\n:1\r\n:2";
        assert!(parser.parse_value(&mut first).is_err());
        assert!(parser.has_pending_bytes());
        let mut rest: &[u8] = b"\r\n:3\r\n";
        assert_eq!(
            parser.parse_value(&mut rest).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert!(!parser.has_pending_bytes());
    }

    #[test]
    fn depth_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..(MAX_RECURSE_DEPTH + 2) {
            bytes.extend_from_slice(b"*1\r\n");
        }
        bytes.extend_from_slice(b":1\r\n");
        let err = parse_redis_value(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }
}
