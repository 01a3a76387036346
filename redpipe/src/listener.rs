//! Long-lived connections that receive messages the server pushes.
//!
//! A [`Listener`] owns a dedicated connection outside of any pool and a
//! background thread reading from it.  Every message goes to the current
//! handler.  Handlers may be swapped at runtime, and a handler can replace
//! the listener's state with each message it sees.
//!
//! A connection failure moves the listener to the broken state exactly
//! once: the connection is shut down, the poll thread stops and the error
//! callback hears about it.  There is no reconnect; callers open a new
//! listener.

use std::any::Any;
use std::error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{debug, error, warn};

use crate::client::Client;
use crate::cmd::{cmd, Cmd};
use crate::connection::{Connection, ConnectionHandle, PushConnection};
use crate::errors::{RedisError, RedisResult};
use crate::types::Value;

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn error::Error + Send + Sync>;

/// Callback receiving handler failures and the broken transition.
pub type ErrorHandler = Arc<dyn Fn(ListenerError) + Send + Sync>;

type PlainFn<S> = dyn Fn(Value, &S) -> Result<(), HandlerError> + Send + Sync;
type SwappingFn<S> = dyn Fn(Value, &S) -> Result<S, HandlerError> + Send + Sync;

/// The message handler of a listener.
pub enum Handler<S> {
    /// Sees every message along with the current state.
    Plain(Arc<PlainFn<S>>),
    /// Returns the state that replaces the current one.
    Swapping(Arc<SwappingFn<S>>),
}

impl<S> Handler<S> {
    pub fn plain<F>(f: F) -> Handler<S>
    where
        F: Fn(Value, &S) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Handler::Plain(Arc::new(f))
    }

    pub fn swapping<F>(f: F) -> Handler<S>
    where
        F: Fn(Value, &S) -> Result<S, HandlerError> + Send + Sync + 'static,
    {
        Handler::Swapping(Arc::new(f))
    }
}

impl<S> Clone for Handler<S> {
    fn clone(&self) -> Self {
        match self {
            Handler::Plain(f) => Handler::Plain(f.clone()),
            Handler::Swapping(f) => Handler::Swapping(f.clone()),
        }
    }
}

/// Failures reported to the error callback.
#[derive(Debug)]
pub enum ListenerError {
    /// The handler returned an error for a message.
    Handler(HandlerError),
    /// The handler panicked while processing a message.
    Panic(String),
    /// The connection failed and the listener stopped.
    Broken(RedisError),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Handler(err) => write!(f, "listener handler failed: {err}"),
            ListenerError::Panic(msg) => write!(f, "listener handler panicked: {msg}"),
            ListenerError::Broken(err) => write!(f, "listener connection broken: {err}"),
        }
    }
}

impl error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ListenerError::Handler(err) => Some(err.as_ref()),
            ListenerError::Panic(_) => None,
            ListenerError::Broken(err) => Some(err),
        }
    }
}

/// Listener configuration.
#[derive(Clone)]
pub struct ListenerOptions {
    /// Bound on a single blocking read.  Each expiry checks the socket for
    /// a pending error; `None` reads without a bound.
    pub read_timeout: Option<Duration>,
    /// When set, a `PING` is sent whenever no message arrived for this long.
    pub keep_alive: Option<Duration>,
    /// Receives handler failures and the broken transition.  Without it
    /// they are logged.
    pub error_handler: Option<ErrorHandler>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            read_timeout: Some(Duration::from_secs(1)),
            keep_alive: None,
            error_handler: None,
        }
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("read_timeout", &self.read_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

struct Shared<S, H> {
    handler: ArcSwap<Handler<S>>,
    state: ArcSwap<S>,
    broken: AtomicBool,
    closed: AtomicBool,
    poll_finished: AtomicBool,
    started: Instant,
    // milliseconds since `started`
    last_activity: AtomicU64,
    handle: H,
    error_handler: Option<ErrorHandler>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

fn is_pong(value: &Value) -> bool {
    match value {
        Value::SimpleString(s) => s.eq_ignore_ascii_case("pong"),
        // subscribed connections answer PING with ["pong", ""]
        Value::Array(items) => matches!(
            items.first(),
            Some(Value::BulkString(kind)) if kind.eq_ignore_ascii_case(b"pong")
        ),
        _ => false,
    }
}

impl<S, H> Shared<S, H>
where
    S: Send + Sync + 'static,
    H: ConnectionHandle,
{
    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity.load(Ordering::SeqCst)))
    }

    fn is_running(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, err: ListenerError) {
        match self.error_handler {
            Some(ref callback) => {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                    error!("listener error callback panicked");
                }
            }
            None => error!("{err}"),
        }
    }

    fn mark_broken(&self, err: RedisError) {
        // failures caused by `close` are not breakage
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .broken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("listener connection broken: {err}");
            self.handle.shutdown();
            self.report(ListenerError::Broken(err));
        }
    }

    fn dispatch(&self, msg: Value) {
        let handler = self.handler.load_full();
        let state = self.state.load_full();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &*handler {
            Handler::Plain(f) => f(msg, &*state).map(|()| None),
            Handler::Swapping(f) => f(msg, &*state).map(Some),
        }));
        match outcome {
            Ok(Ok(Some(next))) => self.state.store(Arc::new(next)),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => self.report(ListenerError::Handler(err)),
            Err(payload) => self.report(ListenerError::Panic(panic_message(payload))),
        }
    }
}

fn poll_loop<S, C>(mut conn: C, shared: Arc<Shared<S, C::Handle>>)
where
    S: Send + Sync + 'static,
    C: PushConnection,
{
    while shared.is_running() {
        match conn.recv_response() {
            Ok(msg) => {
                shared.touch();
                if !is_pong(&msg) {
                    shared.dispatch(msg);
                }
            }
            Err(err) if err.is_timeout() => {
                if let Some(err) = shared.handle.error() {
                    shared.mark_broken(err);
                }
            }
            Err(err) => shared.mark_broken(err),
        }
    }
    debug!("listener poll thread finished");
    shared.poll_finished.store(true, Ordering::SeqCst);
}

fn keep_alive_loop<S, H>(shared: Arc<Shared<S, H>>, interval: Duration)
where
    S: Send + Sync + 'static,
    H: ConnectionHandle,
{
    let ping = cmd("PING").get_packed_command();
    loop {
        thread::sleep(interval);
        if !shared.is_running() {
            return;
        }
        if shared.idle_for() < interval {
            continue;
        }
        let probe = match shared.handle.send_packed_command(&ping) {
            Ok(()) => shared.handle.error(),
            Err(err) => Some(err),
        };
        if let Some(err) = probe {
            shared.mark_broken(err);
            return;
        }
    }
}

/// A persistent connection dispatching pushed messages to a handler.
pub struct Listener<S, C: PushConnection = Connection> {
    shared: Arc<Shared<S, C::Handle>>,
    poll: Option<JoinHandle<()>>,
}

impl<S> Listener<S, Connection>
where
    S: Send + Sync + 'static,
{
    /// Opens a dedicated connection from `client` and starts listening.
    pub fn open(
        client: &Client,
        init_cmds: &[Cmd],
        handler: Handler<S>,
        state: S,
        options: ListenerOptions,
    ) -> RedisResult<Self> {
        let conn = client.get_connection()?;
        Listener::new(conn, init_cmds, handler, state, options)
    }
}

impl<S, C> Listener<S, C>
where
    S: Send + Sync + 'static,
    C: PushConnection,
{
    /// Starts listening on `conn`.
    ///
    /// `init_cmds` are written before the poll thread starts, without
    /// waiting for their replies; the replies reach the handler like any
    /// other message.
    pub fn new(
        mut conn: C,
        init_cmds: &[Cmd],
        handler: Handler<S>,
        state: S,
        options: ListenerOptions,
    ) -> RedisResult<Self> {
        conn.set_read_timeout(options.read_timeout)?;
        let handle = conn.handle()?;
        for init in init_cmds {
            conn.send_packed_command(&init.get_packed_command())?;
        }

        let shared = Arc::new(Shared {
            handler: ArcSwap::from_pointee(handler),
            state: ArcSwap::from_pointee(state),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poll_finished: AtomicBool::new(false),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            handle,
            error_handler: options.error_handler,
        });

        let poll = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("redpipe-listener".to_string())
                .spawn(move || poll_loop(conn, shared))?
        };

        if let Some(interval) = options.keep_alive {
            let shared = shared.clone();
            thread::Builder::new()
                .name("redpipe-keep-alive".to_string())
                .spawn(move || keep_alive_loop(shared, interval))?;
        }

        Ok(Listener {
            shared,
            poll: Some(poll),
        })
    }

    /// Replaces the handler used for the following messages.
    pub fn set_handler(&self, handler: Handler<S>) {
        self.shared.handler.store(Arc::new(handler));
    }

    /// Returns the current state.
    pub fn state(&self) -> Arc<S> {
        self.shared.state.load_full()
    }

    /// Replaces the current state.
    pub fn set_state(&self, state: S) {
        self.shared.state.store(Arc::new(state));
    }

    /// Writes a follow-up command, such as another `SUBSCRIBE`.
    pub fn send(&self, cmd: &Cmd) -> RedisResult<()> {
        match self.shared.handle.send_packed_command(&cmd.get_packed_command()) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_unrecoverable_error() && self.shared.is_running() {
                    self.shared.mark_broken(err.clone_mostly("send failed"));
                }
                Err(err)
            }
        }
    }

    /// Returns true once the connection failed.
    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::SeqCst)
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Returns true once the poll thread has exited.
    pub fn is_poll_finished(&self) -> bool {
        self.shared.poll_finished.load(Ordering::SeqCst)
    }

    /// Shuts the connection down and waits for the poll thread.
    ///
    /// A keep-alive thread exits on its next wake-up.  Calling `close` from
    /// a handler does not wait, since the handler runs on the poll thread.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.handle.shutdown();
        if let Some(poll) = self.poll.take() {
            if poll.thread().id() != thread::current().id() && poll.join().is_err() {
                error!("listener poll thread panicked");
            }
        }
    }
}

impl<S, C: PushConnection> Drop for Listener<S, C> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.handle.shutdown();
        if let Some(poll) = self.poll.take() {
            if poll.thread().id() != thread::current().id() {
                let _ = poll.join();
            }
        }
    }
}
