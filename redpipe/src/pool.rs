use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::client::Client;
use crate::connection::{ConnectionLike, IntoConnectionInfo};
use crate::errors::{RedisError, RedisResult};

/// Source of connections for execution contexts.
///
/// `acquire` blocks until a connection is available or the pool's bound
/// elapses.  `release` gets the error the connection's last use ended
/// with, if any.  A connection whose error affects the connection itself
/// (see [`RedisError::is_unrecoverable_error`]) must not be handed out
/// again.
pub trait ConnectionPool {
    type Connection: ConnectionLike + 'static;

    /// Takes a connection out of the pool.
    fn acquire(&self) -> RedisResult<Self::Connection>;

    /// Gives a connection back.
    fn release(&self, conn: Self::Connection, err: Option<&RedisError>);

    /// Whether replies of contexts running on this pool decode frozen
    /// payloads automatically.
    fn auto_thaw(&self) -> bool {
        false
    }
}

impl<P: ConnectionPool + ?Sized> ConnectionPool for &P {
    type Connection = P::Connection;

    fn acquire(&self) -> RedisResult<Self::Connection> {
        (**self).acquire()
    }

    fn release(&self, conn: Self::Connection, err: Option<&RedisError>) {
        (**self).release(conn, err)
    }

    fn auto_thaw(&self) -> bool {
        (**self).auto_thaw()
    }
}

impl<P: ConnectionPool + ?Sized> ConnectionPool for Arc<P> {
    type Connection = P::Connection;

    fn acquire(&self) -> RedisResult<Self::Connection> {
        (**self).acquire()
    }

    fn release(&self, conn: Self::Connection, err: Option<&RedisError>) {
        (**self).release(conn, err)
    }

    fn auto_thaw(&self) -> bool {
        (**self).auto_thaw()
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections managed by the pool.
    pub max_size: u32,
    /// Idle connections the pool tries to keep around.
    pub min_idle: Option<u32>,
    /// Upper bound for [`ConnectionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Upper bound for establishing a single connection.
    pub connection_timeout: Option<Duration>,
    /// Decode frozen payloads in every reply.
    pub auto_thaw: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 10,
            min_idle: None,
            acquire_timeout: Duration::from_secs(30),
            connection_timeout: Some(Duration::from_secs(5)),
            auto_thaw: false,
        }
    }
}

/// The default pool, an `r2d2` pool of TCP connections.
#[derive(Clone)]
pub struct Pool {
    inner: r2d2::Pool<Client>,
    auto_thaw: bool,
}

impl Pool {
    /// Builds a pool for the server described by `params`.
    ///
    /// No connection is opened here; the first `acquire` does.
    pub fn open<T: IntoConnectionInfo>(params: T, config: PoolConfig) -> RedisResult<Pool> {
        let client = Client::open(params)?.with_connect_timeout(config.connection_timeout);
        Ok(Pool::with_client(client, config))
    }

    /// Builds a pool on top of an existing client.
    pub fn with_client(client: Client, config: PoolConfig) -> Pool {
        let inner = r2d2::Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.acquire_timeout)
            .build_unchecked(client);
        Pool {
            inner,
            auto_thaw: config.auto_thaw,
        }
    }

    /// Returns the pool's bookkeeping: `(connections, idle_connections)`.
    pub fn state(&self) -> (u32, u32) {
        let state = self.inner.state();
        (state.connections, state.idle_connections)
    }
}

impl ConnectionPool for Pool {
    type Connection = r2d2::PooledConnection<Client>;

    fn acquire(&self) -> RedisResult<Self::Connection> {
        self.inner.get().map_err(|err| {
            RedisError::from(io::Error::new(io::ErrorKind::TimedOut, err.to_string()))
        })
    }

    fn release(&self, mut conn: Self::Connection, err: Option<&RedisError>) {
        if let Some(err) = err {
            if err.is_unrecoverable_error() {
                warn!(
                    "discarding connection to {}: {}",
                    conn.connection_id(),
                    err
                );
                // r2d2 drops connections reporting `has_broken` on return
                conn.close();
            }
        }
        drop(conn);
    }

    fn auto_thaw(&self) -> bool {
        self.auto_thaw
    }
}
