//! Testing support
//!
//! This crate provides `MockRedisConnection`, which implements
//! `ConnectionLike` and checks that the client sends an expected sequence
//! of commands, `MockPool`, which hands out mock connections to execution
//! contexts, and `MockPushConnection`, a scripted connection for
//! listeners.
//!
//! # Example
//!
//! ```rust
//! use redpipe::{cmd, run_block, Value};
//! use redpipe_test::{MockCmd, MockPool, MockRedisConnection};
//!
//! let pool = MockPool::new(MockRedisConnection::new(vec![MockCmd::with_values(
//!     vec![cmd("SET").arg("foo").arg(42), cmd("GET").arg("foo")],
//!     Ok(vec![Value::Okay, Value::Int(42)]),
//! )]));
//!
//! let value: i64 = run_block(&pool, || {
//!     redpipe::parse(redpipe::ReplyParser::suppress(), || {
//!         cmd("SET").arg("foo").arg(42).queue()
//!     })?;
//!     cmd("GET").arg("foo").queue()
//! })
//! .unwrap();
//! assert_eq!(value, 42);
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redpipe::{
    pack_pipeline, Cmd, ConnectionHandle, ConnectionLike, ConnectionPool, ErrorKind,
    PushConnection, RedisError, RedisResult, ServerError, Value,
};

/// Helper trait for converting test values into a `redpipe::Value` returned
/// from a `MockRedisConnection`.
pub trait IntoRedisValue {
    /// Convert a value into `redpipe::Value`.
    fn into_redis_value(self) -> Value;
}

macro_rules! into_redis_value_impl_int {
    ($t:ty) => {
        impl IntoRedisValue for $t {
            fn into_redis_value(self) -> Value {
                Value::Int(self as i64)
            }
        }
    };
}

into_redis_value_impl_int!(i8);
into_redis_value_impl_int!(i16);
into_redis_value_impl_int!(i32);
into_redis_value_impl_int!(i64);
into_redis_value_impl_int!(u8);
into_redis_value_impl_int!(u16);
into_redis_value_impl_int!(u32);

impl IntoRedisValue for String {
    fn into_redis_value(self) -> Value {
        Value::BulkString(self.into_bytes())
    }
}

impl IntoRedisValue for &str {
    fn into_redis_value(self) -> Value {
        Value::BulkString(self.as_bytes().to_vec())
    }
}

impl IntoRedisValue for Vec<u8> {
    fn into_redis_value(self) -> Value {
        Value::BulkString(self)
    }
}

impl IntoRedisValue for Vec<Value> {
    fn into_redis_value(self) -> Value {
        Value::Array(self)
    }
}

impl IntoRedisValue for Value {
    fn into_redis_value(self) -> Value {
        self
    }
}

impl IntoRedisValue for ServerError {
    fn into_redis_value(self) -> Value {
        Value::ServerError(self)
    }
}

/// Builds the server error reply for an error line such as
/// `"NOSCRIPT No matching script"`.
pub fn server_error(line: &str) -> Value {
    Value::ServerError(ServerError::from_line(line))
}

/// Helper trait for converting commands and batches of commands into
/// encoded byte vectors.
pub trait IntoRedisCmdBytes {
    /// Convert a command into an encoded byte vector.
    fn into_redis_cmd_bytes(self) -> Vec<u8>;
}

impl IntoRedisCmdBytes for Cmd {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        self.get_packed_command()
    }
}

impl IntoRedisCmdBytes for &Cmd {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        self.get_packed_command()
    }
}

impl IntoRedisCmdBytes for &mut Cmd {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        self.get_packed_command()
    }
}

impl IntoRedisCmdBytes for Vec<Cmd> {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        pack_pipeline(&self)
    }
}

impl IntoRedisCmdBytes for Vec<&mut Cmd> {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        pack_pipeline(self.iter().map(|cmd| &**cmd))
    }
}

impl IntoRedisCmdBytes for &[Cmd] {
    fn into_redis_cmd_bytes(self) -> Vec<u8> {
        pack_pipeline(self)
    }
}

/// Represents a command (or a batch of commands) to be executed against a
/// `MockRedisConnection`.
pub struct MockCmd {
    cmd_bytes: Vec<u8>,
    responses: Result<Vec<Value>, RedisError>,
}

impl MockCmd {
    /// Create a new `MockCmd` given a command and either a value convertible
    /// to a `redpipe::Value` or a `RedisError`.
    pub fn new<C, V>(cmd: C, response: Result<V, RedisError>) -> Self
    where
        C: IntoRedisCmdBytes,
        V: IntoRedisValue,
    {
        MockCmd {
            cmd_bytes: cmd.into_redis_cmd_bytes(),
            responses: response.map(|r| vec![r.into_redis_value()]),
        }
    }

    /// Create a new `MockCmd` given a batch of commands and one reply per
    /// command, or a `RedisError` failing the whole batch.
    pub fn with_values<C, V>(cmd: C, responses: Result<Vec<V>, RedisError>) -> Self
    where
        C: IntoRedisCmdBytes,
        V: IntoRedisValue,
    {
        MockCmd {
            cmd_bytes: cmd.into_redis_cmd_bytes(),
            responses: responses.map(|xs| xs.into_iter().map(|x| x.into_redis_value()).collect()),
        }
    }
}

fn test_error(detail: String) -> RedisError {
    RedisError::from((ErrorKind::ClientError, "TEST", detail))
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap_or_else(|_| "decode error".to_owned())
}

/// A mock Redis client for testing without a server.  `MockRedisConnection`
/// checks whether the client submits a specific sequence of commands and
/// generates an error if it does not.
///
/// Clones share the expected command queue.
#[derive(Clone)]
pub struct MockRedisConnection {
    commands: Arc<Mutex<VecDeque<MockCmd>>>,
    id: String,
    open: bool,
    assert_is_empty_on_drop: bool,
}

impl MockRedisConnection {
    /// Construct a new from the given sequence of commands.
    pub fn new<I>(commands: I) -> Self
    where
        I: IntoIterator<Item = MockCmd>,
    {
        MockRedisConnection {
            commands: Arc::new(Mutex::new(VecDeque::from_iter(commands))),
            id: "mock".to_string(),
            open: true,
            assert_is_empty_on_drop: false,
        }
    }

    /// Sets the value returned by `connection_id`.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Enable assertion to ensure all commands have been consumed
    pub fn assert_all_commands_consumed(mut self) -> Self {
        self.assert_is_empty_on_drop = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().unwrap().is_empty()
    }

    fn next_cmd(&mut self, cmd: &[u8]) -> RedisResult<Vec<Value>> {
        let mut commands = self.commands.lock().unwrap();
        let Some(next_cmd) = commands.pop_front() else {
            self.assert_is_empty_on_drop = false;
            return Err(test_error(format!("unexpected command: {}", decode(cmd))));
        };

        if cmd != next_cmd.cmd_bytes {
            self.assert_is_empty_on_drop = false;
            return Err(test_error(format!(
                "unexpected command: expected={}, actual={}",
                decode(&next_cmd.cmd_bytes),
                decode(cmd),
            )));
        }
        next_cmd.responses
    }
}

impl Drop for MockRedisConnection {
    fn drop(&mut self) {
        if self.assert_is_empty_on_drop && !std::thread::panicking() {
            let commands = self.commands.lock().unwrap();
            if Arc::strong_count(&self.commands) == 1 {
                assert!(commands.back().is_none());
            }
        }
    }
}

impl ConnectionLike for MockRedisConnection {
    fn req_packed_command(&mut self, cmd: &[u8]) -> RedisResult<Value> {
        let values = self.next_cmd(cmd)?;
        match <[Value; 1]>::try_from(values) {
            Ok([value]) => Ok(value),
            Err(values) => {
                self.assert_is_empty_on_drop = false;
                Err(test_error(format!(
                    "{} values configured as response for a single command",
                    values.len()
                )))
            }
        }
    }

    fn req_packed_commands(
        &mut self,
        cmd: &[u8],
        _offset: usize,
        _count: usize,
    ) -> RedisResult<Vec<Value>> {
        self.next_cmd(cmd)
    }

    fn get_db(&self) -> i64 {
        0
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn check_connection(&mut self) -> bool {
        self.open
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// A pool handing out clones of one `MockRedisConnection`.
///
/// Releases are recorded so tests can check which connections the
/// contexts gave back and which ones they discarded.
#[derive(Clone)]
pub struct MockPool {
    conn: MockRedisConnection,
    auto_thaw: bool,
    released: Arc<Mutex<Vec<Option<ErrorKind>>>>,
    discarded: Arc<AtomicUsize>,
}

impl MockPool {
    pub fn new(conn: MockRedisConnection) -> Self {
        MockPool {
            conn,
            auto_thaw: false,
            released: Arc::new(Mutex::new(Vec::new())),
            discarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Decode frozen payloads in every reply.
    pub fn with_auto_thaw(mut self) -> Self {
        self.auto_thaw = true;
        self
    }

    /// The error each released connection ended with, in release order.
    pub fn released(&self) -> Vec<Option<ErrorKind>> {
        self.released.lock().unwrap().clone()
    }

    /// Number of released connections that were closed by their pool.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.conn.is_empty()
    }
}

impl ConnectionPool for MockPool {
    type Connection = MockRedisConnection;

    fn acquire(&self) -> RedisResult<MockRedisConnection> {
        let mut conn = self.conn.clone();
        conn.assert_is_empty_on_drop = false;
        Ok(conn)
    }

    fn release(&self, mut conn: MockRedisConnection, err: Option<&RedisError>) {
        if err.is_some_and(|err| err.is_unrecoverable_error()) {
            conn.close();
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
        self.released.lock().unwrap().push(err.map(|err| err.kind()));
    }

    fn auto_thaw(&self) -> bool {
        self.auto_thaw
    }
}

const POLL_SLICE: Duration = Duration::from_millis(5);

struct PushState {
    open: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl PushState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn record(&self, cmd: &[u8]) -> RedisResult<()> {
        if !self.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        self.sent.lock().unwrap().push(cmd.to_vec());
        Ok(())
    }
}

/// The server side of a `MockPushConnection`.
#[derive(Clone)]
pub struct MockPushSender {
    tx: Sender<RedisResult<Value>>,
    state: Arc<PushState>,
}

impl MockPushSender {
    /// Delivers a message to the connection.
    pub fn push(&self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    /// Makes the next read fail with `err`.
    pub fn fail(&self, err: RedisError) {
        let _ = self.tx.send(Err(err));
    }

    /// Drops the connection: pending and future reads and writes fail.
    pub fn kill(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    /// Everything written to the connection so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }
}

/// Side channel of a `MockPushConnection`.
#[derive(Clone)]
pub struct MockPushHandle {
    state: Arc<PushState>,
}

impl ConnectionHandle for MockPushHandle {
    fn error(&self) -> Option<RedisError> {
        if self.state.is_open() {
            None
        } else {
            Some(io::Error::from(io::ErrorKind::ConnectionReset).into())
        }
    }

    fn send_packed_command(&self, cmd: &[u8]) -> RedisResult<()> {
        self.state.record(cmd)
    }

    fn shutdown(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }
}

/// A connection whose incoming messages are scripted through a
/// `MockPushSender`.
pub struct MockPushConnection {
    incoming: Receiver<RedisResult<Value>>,
    state: Arc<PushState>,
    read_timeout: Option<Duration>,
}

impl MockPushConnection {
    pub fn new() -> (MockPushConnection, MockPushSender) {
        let (tx, incoming) = mpsc::channel();
        let state = Arc::new(PushState {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });
        let conn = MockPushConnection {
            incoming,
            state: state.clone(),
            read_timeout: None,
        };
        (conn, MockPushSender { tx, state })
    }

    /// The read timeout the connection was configured with.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
}

impl ConnectionLike for MockPushConnection {
    fn req_packed_command(&mut self, cmd: &[u8]) -> RedisResult<Value> {
        self.state.record(cmd)?;
        self.recv_response()
    }

    fn req_packed_commands(
        &mut self,
        cmd: &[u8],
        offset: usize,
        count: usize,
    ) -> RedisResult<Vec<Value>> {
        self.state.record(cmd)?;
        let mut replies = Vec::with_capacity(count);
        for idx in 0..offset + count {
            let reply = self.recv_response()?;
            if idx >= offset {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    fn get_db(&self) -> i64 {
        0
    }

    fn connection_id(&self) -> &str {
        "mock-push"
    }

    fn check_connection(&mut self) -> bool {
        self.state.is_open()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn close(&mut self) {
        self.state.open.store(false, Ordering::SeqCst);
    }
}

impl PushConnection for MockPushConnection {
    type Handle = MockPushHandle;

    fn handle(&self) -> RedisResult<MockPushHandle> {
        Ok(MockPushHandle {
            state: self.state.clone(),
        })
    }

    fn send_packed_command(&mut self, cmd: &[u8]) -> RedisResult<()> {
        self.state.record(cmd)
    }

    fn recv_response(&mut self) -> RedisResult<Value> {
        let started = Instant::now();
        loop {
            if !self.state.is_open() {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
            }
            match self.incoming.recv_timeout(POLL_SLICE) {
                Ok(reply) => return reply,
                Err(RecvTimeoutError::Timeout) => {
                    if self.read_timeout.is_some_and(|limit| started.elapsed() >= limit) {
                        return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.state.open.store(false, Ordering::SeqCst);
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            }
        }
    }

    fn set_read_timeout(&mut self, dur: Option<Duration>) -> RedisResult<()> {
        self.read_timeout = dur;
        Ok(())
    }
}
