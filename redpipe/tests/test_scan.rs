mod support;

use redpipe::{
    cmd, hscan_step, reduce_hash_scan, reduce_scan, run_pipeline, scan_step, Reduced, Value,
};
use redpipe_test::{MockCmd, MockPool, MockRedisConnection};

use crate::support::*;

fn scan_reply(cursor: &str, items: &[&str]) -> Value {
    Value::Array(vec![
        bulk(cursor),
        Value::Array(items.iter().map(|item| bulk(item)).collect()),
    ])
}

fn scan(cursor: &str) -> MockCmd {
    let reply = match cursor {
        "0" => scan_reply("5", &["user:1", "user:2"]),
        "5" => scan_reply("9", &["user:3"]),
        _ => scan_reply("0", &["user:4"]),
    };
    MockCmd::new(cmd("SCAN").arg(cursor).arg("MATCH").arg("user:*"), Ok(reply))
}

#[test]
fn test_reduce_scan_follows_cursor() {
    init_logging();
    let pool = MockPool::new(
        MockRedisConnection::new(vec![scan("0"), scan("5"), scan("9")])
            .assert_all_commands_consumed(),
    );

    let mut batches = 0;
    let mut keys = vec![];
    run_pipeline(&pool, || {
        keys = reduce_scan(
            |mut acc: Vec<String>, batch: Vec<String>| {
                batches += 1;
                acc.extend(batch);
                Reduced::Continue(acc)
            },
            vec![],
            scan_step("user:*"),
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(batches, 3);
    assert_eq!(keys, vec!["user:1", "user:2", "user:3", "user:4"]);
}

#[test]
fn test_reduce_scan_stops_early() {
    init_logging();
    let pool = MockPool::new(
        MockRedisConnection::new(vec![scan("0")]).assert_all_commands_consumed(),
    );

    let mut first = None;
    run_pipeline(&pool, || {
        first = reduce_scan(
            |_: Option<String>, batch: Vec<String>| Reduced::Done(batch.into_iter().next()),
            None,
            scan_step("user:*"),
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(first.as_deref(), Some("user:1"));
    assert!(pool.is_empty());
}

#[test]
fn test_reduce_hash_scan_skips_redelivered_fields() {
    init_logging();
    let pool = MockPool::new(
        MockRedisConnection::new(vec![
            MockCmd::new(
                cmd("HSCAN").arg("h").arg("0"),
                Ok(scan_reply("3", &["a", "1", "b", "2"])),
            ),
            MockCmd::new(
                cmd("HSCAN").arg("h").arg("3"),
                Ok(scan_reply("0", &["b", "2", "c", "3"])),
            ),
        ])
        .assert_all_commands_consumed(),
    );

    let mut fields = vec![];
    let mut total = 0;
    run_pipeline(&pool, || {
        total = reduce_hash_scan(
            |acc: i64, field: String, value: i64| {
                fields.push(field);
                Reduced::Continue(acc + value)
            },
            0,
            hscan_step("h"),
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(fields, vec!["a", "b", "c"]);
    assert_eq!(total, 6);
}

#[test]
fn test_hscan_rejects_odd_replies() {
    init_logging();
    let pool = MockPool::new(MockRedisConnection::new(vec![MockCmd::new(
        cmd("HSCAN").arg("h").arg("0"),
        Ok(scan_reply("0", &["a"])),
    )]));

    let err = run_pipeline(&pool, || {
        reduce_hash_scan(
            |acc: i64, _: String, value: i64| Reduced::Continue(acc + value),
            0,
            hscan_step("h"),
        )?;
        Ok(())
    })
    .unwrap_err();
    assert_eq!(err.kind(), redpipe::ErrorKind::TypeError);
}

#[test]
fn test_scan_rejects_non_cursor_replies() {
    init_logging();
    let pool = MockPool::new(MockRedisConnection::new(vec![MockCmd::new(
        cmd("SCAN").arg("0").arg("MATCH").arg("user:*"),
        Ok(bulk("oops")),
    )]));

    let err = run_pipeline(&pool, || {
        reduce_scan(
            |acc: Vec<String>, batch: Vec<String>| Reduced::Continue([acc, batch].concat()),
            vec![],
            scan_step("user:*"),
        )?;
        Ok(())
    })
    .unwrap_err();
    assert_eq!(err.kind(), redpipe::ErrorKind::TypeError);
}
