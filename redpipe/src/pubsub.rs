//! Pub/sub on top of [`Listener`].

use std::collections::HashMap;
use std::str::from_utf8;
use std::sync::Arc;

use log::trace;

use crate::client::Client;
use crate::cmd::{cmd, Cmd};
use crate::connection::{Connection, PushConnection};
use crate::errors::RedisResult;
use crate::listener::{Handler, HandlerError, Listener, ListenerOptions};
use crate::types::{from_owned_redis_value, from_redis_value, FromRedisValue, Value};

/// A published message.
#[derive(Debug, Clone)]
pub struct Msg {
    payload: Value,
    channel: Value,
    pattern: Option<Value>,
}

impl Msg {
    /// Tries to read a `message` or `pmessage` push.  Subscription
    /// confirmations and anything else give `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw: Vec<Value> = from_redis_value(value).ok()?;
        let mut iter = raw.into_iter();
        let kind: String = from_owned_redis_value(iter.next()?).ok()?;
        let pattern = match kind.as_str() {
            "message" => None,
            "pmessage" => Some(iter.next()?),
            _ => return None,
        };
        let channel = iter.next()?;
        let payload = iter.next()?;
        Some(Msg {
            payload,
            channel,
            pattern,
        })
    }

    pub fn get_channel<T: FromRedisValue>(&self) -> RedisResult<T> {
        from_redis_value(&self.channel)
    }

    /// The channel as a string, `"?"` when it is not valid utf-8.
    pub fn get_channel_name(&self) -> &str {
        match self.channel {
            Value::BulkString(ref bytes) => from_utf8(bytes).unwrap_or("?"),
            _ => "?",
        }
    }

    pub fn get_payload<T: FromRedisValue>(&self) -> RedisResult<T> {
        from_redis_value(&self.payload)
    }

    pub fn get_payload_bytes(&self) -> &[u8] {
        match self.payload {
            Value::BulkString(ref bytes) => bytes,
            _ => b"",
        }
    }

    /// The pattern that matched, for messages received through `PSUBSCRIBE`.
    pub fn get_pattern_name(&self) -> Option<&str> {
        match self.pattern {
            Some(Value::BulkString(ref bytes)) => from_utf8(bytes).ok(),
            _ => None,
        }
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn from_pattern(&self) -> bool {
        self.pattern.is_some()
    }
}

/// Handler for the messages of one channel or pattern.
pub type MessageHandler<S> = Arc<dyn Fn(Msg, &S) -> Result<(), HandlerError> + Send + Sync>;

/// The channels and patterns a [`PubSubListener`] subscribes to.
pub struct Subscriptions<S> {
    channels: HashMap<String, MessageHandler<S>>,
    patterns: HashMap<String, MessageHandler<S>>,
}

impl<S> Default for Subscriptions<S> {
    fn default() -> Self {
        Subscriptions {
            channels: HashMap::new(),
            patterns: HashMap::new(),
        }
    }
}

impl<S> Subscriptions<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler of `channel`, replacing an earlier one.
    pub fn channel<F>(mut self, channel: &str, f: F) -> Self
    where
        F: Fn(Msg, &S) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.channels.insert(channel.to_string(), Arc::new(f));
        self
    }

    /// Registers the handler of `pattern`, replacing an earlier one.
    pub fn pattern<F>(mut self, pattern: &str, f: F) -> Self
    where
        F: Fn(Msg, &S) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.patterns.insert(pattern.to_string(), Arc::new(f));
        self
    }

    fn init_cmds(&self) -> Vec<Cmd> {
        let mut cmds = vec![];
        if !self.channels.is_empty() {
            let mut subscribe = cmd("SUBSCRIBE");
            for channel in sorted_names(&self.channels) {
                subscribe.arg(channel);
            }
            cmds.push(subscribe);
        }
        if !self.patterns.is_empty() {
            let mut subscribe = cmd("PSUBSCRIBE");
            for pattern in sorted_names(&self.patterns) {
                subscribe.arg(pattern);
            }
            cmds.push(subscribe);
        }
        cmds
    }

    fn dispatch(&self, value: Value, state: &S) -> Result<(), HandlerError> {
        let msg = match Msg::from_value(&value) {
            Some(msg) => msg,
            None => {
                trace!("ignoring non-message push {value:?}");
                return Ok(());
            }
        };
        let handler = match msg.get_pattern_name() {
            Some(pattern) => self.patterns.get(pattern),
            None if msg.from_pattern() => None,
            None => self.channels.get(msg.get_channel_name()),
        };
        match handler {
            Some(handler) => handler(msg, state),
            None => {
                trace!("no handler for channel {}", msg.get_channel_name());
                Ok(())
            }
        }
    }
}

fn sorted_names<H>(handlers: &HashMap<String, H>) -> Vec<&str> {
    let mut names: Vec<&str> = handlers.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

/// A listener subscribed to a fixed set of channels and patterns, routing
/// each message to the handler registered for it.
pub struct PubSubListener<S, C: PushConnection = Connection> {
    listener: Listener<S, C>,
}

impl<S> PubSubListener<S, Connection>
where
    S: Send + Sync + 'static,
{
    pub fn open(
        client: &Client,
        subscriptions: Subscriptions<S>,
        state: S,
        options: ListenerOptions,
    ) -> RedisResult<Self> {
        let conn = client.get_connection()?;
        PubSubListener::new(conn, subscriptions, state, options)
    }
}

impl<S, C> PubSubListener<S, C>
where
    S: Send + Sync + 'static,
    C: PushConnection,
{
    pub fn new(
        conn: C,
        subscriptions: Subscriptions<S>,
        state: S,
        options: ListenerOptions,
    ) -> RedisResult<Self> {
        let init_cmds = subscriptions.init_cmds();
        let subscriptions = Arc::new(subscriptions);
        let handler = Handler::plain(move |value, state: &S| subscriptions.dispatch(value, state));
        let listener = Listener::new(conn, &init_cmds, handler, state, options)?;
        Ok(PubSubListener { listener })
    }

    /// The underlying listener.
    pub fn listener(&self) -> &Listener<S, C> {
        &self.listener
    }

    pub fn state(&self) -> Arc<S> {
        self.listener.state()
    }

    pub fn is_broken(&self) -> bool {
        self.listener.is_broken()
    }

    pub fn close(&mut self) {
        self.listener.close()
    }
}
