use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server generated an invalid response.
    ResponseError,
    /// The reply stream was malformed or did not have the expected shape.
    ParseError,
    /// The authentication with the server failed.
    AuthenticationFailed,
    /// Operation failed because of a type mismatch.
    TypeError,
    /// A transaction was aborted by the server.
    ExecAbortError,
    /// The server cannot response because it's loading a dump.
    BusyLoadingError,
    /// A script that was requested does not actually exist.
    NoScriptError,
    /// An error that was caused because the parameter to the
    /// client were wrong.
    InvalidClientConfig,
    /// Attempt to write to a read-only server
    ReadOnly,
    /// This kind is returned if the redis error is one that is
    /// not native to the system.  This is usually the case if
    /// the cause is another error.
    IoError,
    /// An error raised that was identified on the client before execution.
    ClientError,
    /// An extension error.  This is an error created by the server
    /// that is not directly understood by the library.
    ExtensionError,
    /// A bounded retry loop ran out of attempts.
    RetryExhausted,
}

/// Kinds of server errors the client knows how to classify.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ServerErrorKind {
    ResponseError,
    ExecAbortError,
    BusyLoadingError,
    NoScriptError,
    ReadOnly,
}

impl ServerErrorKind {
    fn code(self) -> &'static str {
        match self {
            ServerErrorKind::ResponseError => "ERR",
            ServerErrorKind::ExecAbortError => "EXECABORT",
            ServerErrorKind::BusyLoadingError => "LOADING",
            ServerErrorKind::NoScriptError => "NOSCRIPT",
            ServerErrorKind::ReadOnly => "READONLY",
        }
    }
}

/// An error value sent by the server.
///
/// Server errors travel through reply sequences as regular values
/// (see [`crate::Value::ServerError`]) so that one failing command does not
/// hide the replies of the other commands in the same batch.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum ServerError {
    ExtensionError {
        code: String,
        detail: Option<String>,
    },
    KnownError {
        kind: ServerErrorKind,
        detail: Option<String>,
    },
}

impl ServerError {
    /// Classifies an error line (without the leading `-`) by its code prefix.
    pub fn from_line(line: &str) -> ServerError {
        let mut pieces = line.splitn(2, ' ');
        let kind = match pieces.next().unwrap_or_default() {
            "ERR" => ServerErrorKind::ResponseError,
            "EXECABORT" => ServerErrorKind::ExecAbortError,
            "LOADING" => ServerErrorKind::BusyLoadingError,
            "NOSCRIPT" => ServerErrorKind::NoScriptError,
            "READONLY" => ServerErrorKind::ReadOnly,
            code => {
                return ServerError::ExtensionError {
                    code: code.to_string(),
                    detail: pieces.next().map(|str| str.to_string()),
                }
            }
        };
        let detail = pieces.next().map(|str| str.to_string());
        ServerError::KnownError { kind, detail }
    }

    /// Returns the error code, e.g. `NOSCRIPT`.
    pub fn code(&self) -> &str {
        match self {
            ServerError::ExtensionError { code, .. } => code,
            ServerError::KnownError { kind, .. } => kind.code(),
        }
    }

    /// Returns the message following the code.
    pub fn details(&self) -> Option<&str> {
        match self {
            ServerError::ExtensionError { detail, .. }
            | ServerError::KnownError { detail, .. } => detail.as_deref(),
        }
    }

    /// Returns true for the "script not known" reply to `EVALSHA`.
    pub fn is_no_script(&self) -> bool {
        matches!(
            self,
            ServerError::KnownError {
                kind: ServerErrorKind::NoScriptError,
                ..
            }
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())?;
        if let Some(detail) = self.details() {
            f.write_str(" ")?;
            f.write_str(detail)?;
        }
        Ok(())
    }
}

impl From<ServerError> for RedisError {
    fn from(value: ServerError) -> Self {
        match value {
            ServerError::ExtensionError { code, detail } => make_extension_error(code, detail),
            ServerError::KnownError { kind, detail } => {
                let desc = "An error was signalled by the server";
                let kind = match kind {
                    ServerErrorKind::ResponseError => ErrorKind::ResponseError,
                    ServerErrorKind::ExecAbortError => ErrorKind::ExecAbortError,
                    ServerErrorKind::BusyLoadingError => ErrorKind::BusyLoadingError,
                    ServerErrorKind::NoScriptError => ErrorKind::NoScriptError,
                    ServerErrorKind::ReadOnly => ErrorKind::ReadOnly,
                };
                match detail {
                    Some(detail) => RedisError::from((kind, desc, detail)),
                    None => RedisError::from((kind, desc)),
                }
            }
        }
    }
}

/// Represents a redis error.  For the most part you should be using
/// the Error trait to interact with this rather than the actual
/// struct.
pub struct RedisError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    ExtensionError(String, String),
    IoError(io::Error),
    RetryExhausted(usize),
}

impl PartialEq for RedisError {
    fn eq(&self, other: &RedisError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::ExtensionError(a, _), ErrorRepr::ExtensionError(b, _)) => *a == *b,
            (ErrorRepr::RetryExhausted(a), ErrorRepr::RetryExhausted(b)) => a == b,
            _ => false,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<Utf8Error> for RedisError {
    fn from(_: Utf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "Invalid UTF-8"),
        }
    }
}

impl From<FromUtf8Error> for RedisError {
    fn from(_: FromUtf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "Cannot convert from UTF-8"),
        }
    }
}

impl From<serde_json::Error> for RedisError {
    fn from(serde_err: serde_json::Error) -> RedisError {
        RedisError::from((
            ErrorKind::TypeError,
            "Serialization Error",
            format!("{serde_err}"),
        ))
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err as &dyn error::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str("- ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::ExtensionError(ref code, ref detail) => {
                code.fmt(f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(ref err) => err.fmt(f),
            ErrorRepr::RetryExhausted(attempts) => {
                write!(f, "Gave up after {attempts} attempts - RetryExhausted")
            }
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

/// Indicates a general failure in the library.
impl RedisError {
    /// Creates the error raised when a bounded retry loop gives up.
    pub fn retry_exhausted(attempts: usize) -> RedisError {
        RedisError {
            repr: ErrorRepr::RetryExhausted(attempts),
        }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::ExtensionError(_, _) => ErrorKind::ExtensionError,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
            ErrorRepr::RetryExhausted(_) => ErrorKind::RetryExhausted,
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail)
            | ErrorRepr::ExtensionError(_, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Returns the raw error code if available.
    pub fn code(&self) -> Option<&str> {
        match self.kind() {
            ErrorKind::ResponseError => Some("ERR"),
            ErrorKind::ExecAbortError => Some("EXECABORT"),
            ErrorKind::BusyLoadingError => Some("LOADING"),
            ErrorKind::NoScriptError => Some("NOSCRIPT"),
            ErrorKind::ReadOnly => Some("READONLY"),
            _ => match self.repr {
                ErrorRepr::ExtensionError(ref code, _) => Some(code),
                _ => None,
            },
        }
    }

    /// Returns the number of attempts made when the kind is
    /// [`ErrorKind::RetryExhausted`].
    pub fn attempts(&self) -> Option<usize> {
        match self.repr {
            ErrorRepr::RetryExhausted(attempts) => Some(attempts),
            _ => None,
        }
    }

    /// Returns true if error was caused by I/O time out.
    /// Note that this may not be accurate depending on platform.
    pub fn is_timeout(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns true if error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Returns true if the connection that produced this error can no
    /// longer be trusted and must be replaced.
    ///
    /// Socket failures (timeouts included, since a late reply would
    /// desynchronize the reply stream) and malformed replies qualify.
    /// Server error replies never do.
    pub fn is_unrecoverable_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IoError | ErrorKind::ParseError | ErrorKind::AuthenticationFailed
        )
    }
}

impl RedisError {
    pub(crate) fn clone_mostly(&self, ioerror_description: &'static str) -> Self {
        let repr = match self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.clone())
            }
            ErrorRepr::ExtensionError(ref code, ref detail) => {
                ErrorRepr::ExtensionError(code.clone(), detail.clone())
            }
            ErrorRepr::IoError(ref e) => ErrorRepr::IoError(io::Error::new(
                e.kind(),
                format!("{ioerror_description}: {e}"),
            )),
            ErrorRepr::RetryExhausted(attempts) => ErrorRepr::RetryExhausted(attempts),
        };
        Self { repr }
    }
}

pub fn make_extension_error(code: String, detail: Option<String>) -> RedisError {
    RedisError {
        repr: ErrorRepr::ExtensionError(
            code,
            match detail {
                Some(x) => x,
                None => "Unknown extension error encountered".to_string(),
            },
        ),
    }
}

/// Library generic result type.
pub type RedisResult<T> = Result<T, RedisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_lines_are_classified_by_prefix() {
        let err = ServerError::from_line("NOSCRIPT No matching script. Please use EVAL.");
        assert!(err.is_no_script());
        assert_eq!(err.code(), "NOSCRIPT");
        assert_eq!(err.details(), Some("No matching script. Please use EVAL."));

        let err = ServerError::from_line("WRONGTYPE Operation against a key");
        assert!(!err.is_no_script());
        assert_eq!(err.code(), "WRONGTYPE");

        let converted = RedisError::from(err);
        assert_eq!(converted.kind(), ErrorKind::ExtensionError);
        assert_eq!(converted.code(), Some("WRONGTYPE"));
    }

    #[test]
    fn retry_exhausted_carries_attempts() {
        let err = RedisError::retry_exhausted(3);
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.attempts(), Some(3));
        assert!(!err.is_unrecoverable_error());
    }

    #[test]
    fn io_errors_affect_the_connection() {
        let err = RedisError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_unrecoverable_error());
        assert!(err.is_connection_dropped());

        let err = RedisError::from(ServerError::from_line("ERR wrong number of arguments"));
        assert_eq!(err.kind(), ErrorKind::ResponseError);
        assert!(!err.is_unrecoverable_error());
    }
}
