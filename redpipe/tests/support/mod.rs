#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use redpipe::{from_owned_redis_value, ConnectionLike, ConnectionPool, Parser, RedisResult, Value};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bulk(s: &str) -> Value {
    Value::BulkString(s.as_bytes().to_vec())
}

pub fn queued() -> Value {
    Value::SimpleString("QUEUED".to_string())
}

/// Polls `cond` until it holds or two seconds have passed.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    cond()
}

type Answer = Box<dyn FnMut(Vec<Vec<u8>>) -> Value + Send>;

/// An in-process stand-in for a server.  Every command of a batch is
/// decoded and answered by a closure; the commands are logged.
///
/// It is its own pool: `acquire` hands out clones sharing the closure and
/// the log.
#[derive(Clone)]
pub struct FakeServer {
    answer: Arc<Mutex<Answer>>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeServer {
    pub fn new(answer: impl FnMut(Vec<Vec<u8>>) -> Value + Send + 'static) -> FakeServer {
        FakeServer {
            answer: Arc::new(Mutex::new(Box::new(answer))),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every command received so far, arguments decoded lossily.
    pub fn log(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    /// Names of the commands received so far.
    pub fn command_names(&self) -> Vec<String> {
        self.log().into_iter().map(|args| args[0].clone()).collect()
    }

    fn serve(&mut self, packed: &[u8]) -> RedisResult<Vec<Value>> {
        let mut parser = Parser::new();
        let mut reader = packed;
        let mut replies = vec![];
        while !reader.is_empty() || parser.has_pending_bytes() {
            let args: Vec<Vec<u8>> = from_owned_redis_value(parser.parse_value(&mut reader)?)?;
            self.log.lock().unwrap().push(
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect(),
            );
            let mut answer = self.answer.lock().unwrap();
            replies.push((*answer)(args));
        }
        Ok(replies)
    }
}

impl ConnectionLike for FakeServer {
    fn req_packed_command(&mut self, cmd: &[u8]) -> RedisResult<Value> {
        let mut replies = self.serve(cmd)?;
        Ok(replies.pop().unwrap_or(Value::Nil))
    }

    fn req_packed_commands(
        &mut self,
        cmd: &[u8],
        _offset: usize,
        _count: usize,
    ) -> RedisResult<Vec<Value>> {
        self.serve(cmd)
    }

    fn get_db(&self) -> i64 {
        0
    }

    fn connection_id(&self) -> &str {
        "fake"
    }

    fn check_connection(&mut self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        true
    }
}

impl ConnectionPool for FakeServer {
    type Connection = FakeServer;

    fn acquire(&self) -> RedisResult<FakeServer> {
        Ok(self.clone())
    }

    fn release(&self, _conn: FakeServer, _err: Option<&redpipe::RedisError>) {}
}
