//! Round trips against a real server.  Set `REDPIPE_TEST_URL`, for example
//! `redis://127.0.0.1:6379/15`, to run them; without it they pass
//! trivially.

mod support;

use std::sync::{Arc, Mutex};

use redpipe::{
    atomic, cmd, eval, run_block, run_pipeline, swap, with_replies, Client, Handler, Listener,
    ListenerOptions, Pool, PoolConfig, Swap, Value,
};

use crate::support::*;

fn live_url() -> Option<String> {
    std::env::var("REDPIPE_TEST_URL").ok()
}

fn key(name: &str) -> String {
    format!("redpipe:test:{}:{name}", std::process::id())
}

#[test]
fn test_live_pipeline_and_scripts() {
    init_logging();
    let Some(url) = live_url() else {
        return;
    };
    let pool = Pool::open(url.as_str(), PoolConfig::default()).unwrap();
    let k = key("pipeline");

    let replies = run_pipeline(&pool, || {
        cmd("SET").arg(&k).arg(1).queue()?;
        cmd("INCR").arg(&k).queue()?;
        eval("return redis.call('INCRBY', KEYS[1], ARGV[1])", &k, 10)?;
        cmd("DEL").arg(&k).queue()
    })
    .unwrap();
    assert_eq!(
        replies,
        vec![Value::Okay, Value::Int(2), Value::Int(12), Value::Int(1)]
    );

    let (connections, _) = pool.state();
    assert!(connections >= 1);
}

#[test]
fn test_live_transaction_and_swap() {
    init_logging();
    let Some(url) = live_url() else {
        return;
    };
    let pool = Pool::open(url.as_str(), PoolConfig::default()).unwrap();
    let k = key("atomic");

    let (_, exec) = atomic(&pool, 5, || {
        cmd("WATCH").arg(&k).queue()?;
        let current: Option<i64> = with_replies(|| cmd("GET").arg(&k).queue())?;
        cmd("MULTI").queue()?;
        cmd("SET").arg(&k).arg(current.unwrap_or(0) + 1).queue()
    })
    .unwrap();
    assert_eq!(exec, Value::Array(vec![Value::Okay]));

    let mut previous = None;
    run_pipeline(&pool, || {
        previous = swap(&k, Some(5), None, |old: Option<i64>, _| {
            (Swap::Set(old.unwrap_or(0) * 10), old)
        })?;
        Ok(())
    })
    .unwrap();
    assert_eq!(previous, Some(1));

    let now: i64 = run_block(&pool, || cmd("GET").arg(&k).queue()).unwrap();
    assert_eq!(now, 10);
    let _: i64 = run_block(&pool, || cmd("DEL").arg(&k).queue()).unwrap();
}

#[test]
fn test_live_listener_receives_published_messages() {
    init_logging();
    let Some(url) = live_url() else {
        return;
    };
    let client = Client::open(url.as_str()).unwrap();
    let pool = Pool::open(url.as_str(), PoolConfig::default()).unwrap();
    let channel = key("channel");
    let seen = Arc::new(Mutex::new(vec![]));

    let handler = {
        let seen = seen.clone();
        Handler::plain(move |msg: Value, _: &()| {
            if let Some(msg) = redpipe::Msg::from_value(&msg) {
                seen.lock().unwrap().push(msg.get_payload::<String>()?);
            }
            Ok(())
        })
    };
    let mut listener = Listener::open(
        &client,
        &[cmd("SUBSCRIBE").arg(&channel).clone()],
        handler,
        (),
        ListenerOptions::default(),
    )
    .unwrap();

    // publish until the subscription is live
    assert!(wait_for(|| {
        let _: i64 = run_block(&pool, || cmd("PUBLISH").arg(&channel).arg("hi").queue()).unwrap();
        !seen.lock().unwrap().is_empty()
    }));
    assert_eq!(seen.lock().unwrap()[0], "hi");

    listener.close();
    assert!(!listener.is_broken());
}
