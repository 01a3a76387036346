mod support;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redpipe::{
    cmd, from_redis_value, Handler, Listener, ListenerError, ListenerOptions, PubSubListener,
    Subscriptions, Value,
};
use redpipe_test::MockPushConnection;

use crate::support::*;

#[derive(Default)]
struct Failures {
    handler: AtomicUsize,
    panics: AtomicUsize,
    broken: AtomicUsize,
}

fn options(failures: &Arc<Failures>) -> ListenerOptions {
    let failures = failures.clone();
    ListenerOptions {
        read_timeout: Some(Duration::from_millis(20)),
        keep_alive: None,
        error_handler: Some(Arc::new(move |err: ListenerError| {
            let counter = match err {
                ListenerError::Handler(_) => &failures.handler,
                ListenerError::Panic(_) => &failures.panics,
                ListenerError::Broken(_) => &failures.broken,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    }
}

fn message(channel: &str, payload: &str) -> Value {
    Value::Array(vec![bulk("message"), bulk(channel), bulk(payload)])
}

fn pmessage(pattern: &str, channel: &str, payload: &str) -> Value {
    Value::Array(vec![
        bulk("pmessage"),
        bulk(pattern),
        bulk(channel),
        bulk(payload),
    ])
}

#[test]
fn test_init_commands_and_dispatch() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let seen = Arc::new(Mutex::new(vec![]));

    let handler = {
        let seen = seen.clone();
        Handler::plain(move |msg: Value, _: &()| {
            seen.lock().unwrap().push(msg);
            Ok(())
        })
    };
    let mut listener = Listener::new(
        conn,
        &[cmd("SUBSCRIBE").arg("news").clone()],
        handler,
        (),
        options(&failures),
    )
    .unwrap();

    assert_eq!(
        server.sent(),
        vec![cmd("SUBSCRIBE").arg("news").get_packed_command()]
    );

    server.push(message("news", "hello"));
    // replies to keep-alive pings never reach the handler
    server.push(Value::SimpleString("PONG".to_string()));
    server.push(Value::Array(vec![bulk("pong"), bulk("")]));
    server.push(message("news", "bye"));

    assert!(wait_for(|| seen.lock().unwrap().len() == 2));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![message("news", "hello"), message("news", "bye")]
    );

    listener.close();
    assert!(listener.is_closed());
    assert!(!listener.is_broken());
    assert!(listener.is_poll_finished());
    assert_eq!(failures.broken.load(Ordering::SeqCst), 0);
}

#[test]
fn test_swapping_handler_threads_state() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());

    let listener = Listener::new(
        conn,
        &[],
        Handler::swapping(|msg: Value, total: &i64| {
            let items: Vec<Value> = from_redis_value(&msg)?;
            let n: i64 = from_redis_value(&items[2])?;
            Ok(total + n)
        }),
        0i64,
        options(&failures),
    )
    .unwrap();

    for n in ["1", "2", "3"] {
        server.push(message("sums", n));
    }
    assert!(wait_for(|| *listener.state() == 6));

    // a plain handler reads the state without replacing it
    let reads = Arc::new(AtomicUsize::new(0));
    let counted = reads.clone();
    listener.set_handler(Handler::plain(move |_: Value, total: &i64| {
        assert_eq!(*total, 6);
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    server.push(message("sums", "10"));
    assert!(wait_for(|| reads.load(Ordering::SeqCst) == 1));
    assert_eq!(*listener.state(), 6);

    listener.set_state(-1);
    assert_eq!(*listener.state(), -1);
}

#[test]
fn test_handler_failures_do_not_stop_the_loop() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let handled = Arc::new(AtomicUsize::new(0));

    let handler = {
        let handled = handled.clone();
        Handler::plain(move |msg: Value, _: &()| {
            let items: Vec<String> = from_redis_value(&msg)?;
            match items[2].as_str() {
                "fail" => Err("handler refused".into()),
                "panic" => panic!("handler blew up"),
                _ => {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
    };
    let listener = Listener::new(conn, &[], handler, (), options(&failures)).unwrap();

    server.push(message("c", "fail"));
    server.push(message("c", "panic"));
    server.push(message("c", "ok"));

    assert!(wait_for(|| handled.load(Ordering::SeqCst) == 1));
    assert_eq!(failures.handler.load(Ordering::SeqCst), 1);
    assert_eq!(failures.panics.load(Ordering::SeqCst), 1);
    assert!(!listener.is_broken());
}

#[test]
fn test_connection_loss_breaks_once() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    // both the poll and keep-alive threads notice the loss
    let mut opts = options(&failures);
    opts.keep_alive = Some(Duration::from_millis(5));
    let mut listener = Listener::new(
        conn,
        &[],
        Handler::plain(|_: Value, _: &()| Ok(())),
        (),
        opts,
    )
    .unwrap();

    server.kill();
    assert!(wait_for(|| listener.is_poll_finished()));
    std::thread::sleep(Duration::from_millis(30));
    assert!(listener.is_broken());
    assert!(!server.is_open());

    // writes on a broken listener fail without a second report
    assert!(listener.send(&cmd("PING")).is_err());
    listener.close();
    assert_eq!(failures.broken.load(Ordering::SeqCst), 1);
}

#[test]
fn test_read_error_breaks_listener() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let listener = Listener::new(
        conn,
        &[],
        Handler::plain(|_: Value, _: &()| Ok(())),
        (),
        options(&failures),
    )
    .unwrap();

    server.fail(io::Error::from(io::ErrorKind::BrokenPipe).into());
    assert!(wait_for(|| listener.is_broken()));
    assert!(wait_for(|| listener.is_poll_finished()));
    assert_eq!(failures.broken.load(Ordering::SeqCst), 1);
}

#[test]
fn test_keep_alive_pings_idle_connection() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let mut opts = options(&failures);
    opts.keep_alive = Some(Duration::from_millis(30));
    let mut listener = Listener::new(
        conn,
        &[],
        Handler::plain(|_: Value, _: &()| Ok(())),
        (),
        opts,
    )
    .unwrap();

    let ping = cmd("PING").get_packed_command();
    assert!(wait_for(|| server.sent().contains(&ping)));
    assert!(!listener.is_broken());
    listener.close();
}

#[test]
fn test_send_follow_up_command() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let listener = Listener::new(
        conn,
        &[],
        Handler::plain(|_: Value, _: &()| Ok(())),
        (),
        options(&failures),
    )
    .unwrap();

    listener.send(cmd("SUBSCRIBE").arg("late")).unwrap();
    assert_eq!(
        server.sent(),
        vec![cmd("SUBSCRIBE").arg("late").get_packed_command()]
    );
}

#[test]
fn test_pubsub_routes_by_channel_and_pattern() {
    init_logging();
    let (conn, server) = MockPushConnection::new();
    let failures = Arc::new(Failures::default());
    let log = Arc::new(Mutex::new(vec![]));

    let subscriptions = {
        let (news, sports) = (log.clone(), log.clone());
        Subscriptions::new()
            .channel("news", move |msg, prefix: &String| {
                let payload: String = msg.get_payload()?;
                news.lock().unwrap().push(format!("{prefix}news:{payload}"));
                Ok(())
            })
            .pattern("sports.*", move |msg, prefix: &String| {
                let payload: String = msg.get_payload()?;
                sports.lock().unwrap().push(format!(
                    "{prefix}{}@{}:{payload}",
                    msg.get_pattern_name().unwrap_or("?"),
                    msg.get_channel_name()
                ));
                Ok(())
            })
    };
    let mut listener =
        PubSubListener::new(conn, subscriptions, ">".to_string(), options(&failures)).unwrap();

    assert_eq!(
        server.sent(),
        vec![
            cmd("SUBSCRIBE").arg("news").get_packed_command(),
            cmd("PSUBSCRIBE").arg("sports.*").get_packed_command(),
        ]
    );

    // subscription confirmations and unknown channels are dropped
    server.push(Value::Array(vec![
        bulk("subscribe"),
        bulk("news"),
        Value::Int(1),
    ]));
    server.push(message("weather", "rain"));
    server.push(message("news", "extra"));
    server.push(pmessage("sports.*", "sports.tennis", "ace"));

    assert!(wait_for(|| log.lock().unwrap().len() == 2));
    assert_eq!(
        *log.lock().unwrap(),
        vec![">news:extra", ">sports.*@sports.tennis:ace"]
    );
    assert_eq!(failures.handler.load(Ordering::SeqCst), 0);

    listener.close();
    assert!(!listener.is_broken());
}
