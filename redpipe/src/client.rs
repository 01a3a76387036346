use std::io;
use std::time::Duration;

use crate::connection::{connect, Connection, ConnectionInfo, ConnectionLike, IntoConnectionInfo};
use crate::errors::{RedisError, RedisResult};

/// The client type.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) connection_info: ConnectionInfo,
    connect_timeout: Option<Duration>,
}

/// The client acts as connector to the redis server.  By itself it does not
/// do much other than providing a convenient way to fetch a connection from
/// it.  Pooled access goes through [`crate::Pool`], which is built on top
/// of a client.
///
/// When opening a client a URL in the following format should be used:
///
/// ```plain
/// redis://host:port/db
/// ```
///
/// Example usage::
///
/// ```rust,no_run
/// let client = redpipe::Client::open("redis://127.0.0.1/").unwrap();
/// let con = client.get_connection().unwrap();
/// ```
impl Client {
    /// Connects to a redis server and returns a client.  This does not
    /// actually open a connection yet but it does perform some basic
    /// checks on the URL that might make the operation fail.
    pub fn open<T: IntoConnectionInfo>(params: T) -> RedisResult<Client> {
        Ok(Client {
            connection_info: params.into_connection_info()?,
            connect_timeout: None,
        })
    }

    /// Bounds the time spent establishing connections made for a pool.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Client {
        self.connect_timeout = timeout;
        self
    }

    /// Instructs the client to actually connect to redis and returns a
    /// connection object.  The connection object can be used to send
    /// commands to the server.  This can fail with a variety of errors
    /// (like unreachable host) so it's important that you handle those
    /// errors.
    pub fn get_connection(&self) -> RedisResult<Connection> {
        connect(&self.connection_info, self.connect_timeout)
    }

    /// Instructs the client to actually connect to redis with specified
    /// timeout and returns a connection object.
    pub fn get_connection_with_timeout(&self, timeout: Duration) -> RedisResult<Connection> {
        connect(&self.connection_info, Some(timeout))
    }

    /// Returns a reference of client connection info object.
    pub fn get_connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }
}

impl r2d2::ManageConnection for Client {
    type Connection = Connection;
    type Error = RedisError;

    fn connect(&self) -> Result<Connection, RedisError> {
        self.get_connection()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), RedisError> {
        if conn.check_connection() {
            Ok(())
        } else {
            Err(RedisError::from(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_open()
    }
}
