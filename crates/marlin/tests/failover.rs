//! Failover behaviour against scripted servers.

mod support;

use marlin::prelude::*;
use support::{FakeServer, dead_endpoint};

fn source(mode: HaMode, endpoints: Vec<Endpoint>) -> DataSource {
    let config = ConnectConfig::new()
        .endpoints(endpoints)
        .ha_mode(mode)
        .session(SessionConfig::new().user("app").password("secret").connect_timeout(2_000))
        .pool(PoolConfig::new(4).acquire_timeout(2_000));
    DataSource::new(config).unwrap()
}

fn served_by(result: &QueryResult) -> String {
    result
        .first()
        .and_then(|row| row.get(0))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[test]
fn sequential_open_skips_unreachable_endpoints() {
    let c = FakeServer::start("c");
    let source = source(
        HaMode::Sequential,
        vec![dead_endpoint(), dead_endpoint(), c.endpoint()],
    );

    let mut conn = source.get_connection().unwrap();
    let result = conn.query_buffered("SELECT 1").unwrap();
    assert_eq!(served_by(&result), "c");
    assert_eq!(conn.current_endpoint(), Some(&c.endpoint()));
    conn.close().unwrap();
}

#[test]
fn sequential_fails_over_to_next_endpoint() {
    let mut a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);

    let mut conn = source.get_connection().unwrap();
    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "a");

    a.kill();
    assert_eq!(served_by(&conn.query_buffered("SELECT 2").unwrap()), "b");
    // Sticky on the replacement.
    assert_eq!(served_by(&conn.query_buffered("SELECT 3").unwrap()), "b");
    assert_eq!(b.count("SELECT 2"), 1);
}

#[test]
fn sequential_open_fails_when_nothing_is_reachable() {
    let source = source(HaMode::Sequential, vec![dead_endpoint(), dead_endpoint()]);
    let err = source.get_connection().unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
}

#[test]
fn none_mode_failure_is_fatal() {
    let mut a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::None, vec![a.endpoint(), b.endpoint()]);

    let mut conn = source.get_connection().unwrap();
    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "a");

    a.kill();
    let err = conn.query_buffered("SELECT 2").unwrap_err();
    assert!(err.is_transient());
    let err = conn.query_buffered("SELECT 3").unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(b.handshakes(), 0);
}

#[test]
fn prepared_statement_survives_failover() {
    let mut a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    let sql = "SELECT name FROM heroes WHERE id = ?";
    let stmt = conn.prepare_read_only(sql).unwrap();
    assert_eq!(stmt.param_count(), 1);

    let before = conn.execute_buffered(&stmt, &[Value::Int(7)]).unwrap();
    assert_eq!(served_by(&before), "a");

    a.kill();
    let after = conn.execute_buffered(&stmt, &[Value::Int(7)]).unwrap();
    assert_eq!(served_by(&after), "b");
    assert_eq!(b.prepares(), 1);

    // Same answer as a fresh statement on the replacement.
    let fresh = conn.prepare_read_only(sql).unwrap();
    let expected = conn.execute_buffered(&fresh, &[Value::Int(7)]).unwrap();
    assert_eq!(after.rows[0].get(1), expected.rows[0].get(1));
    assert_eq!(after.rows[0].get(1).and_then(Value::as_str), Some(sql));
}

#[test]
fn streaming_execute_fails_over_before_the_first_row() {
    let mut a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    let stmt = conn.prepare("SELECT * FROM orders").unwrap();
    a.kill();

    let rows: Vec<Row> = conn
        .execute(&stmt, &[])
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0).and_then(Value::as_str), Some("b"));
}

#[test]
fn session_cut_between_calls_is_replaced() {
    let a = FakeServer::start("a");
    let source = source(HaMode::Sequential, vec![a.endpoint()]);
    let mut conn = source.get_connection().unwrap();
    let stmt = conn.prepare("SELECT 1").unwrap();

    a.drop_connections();
    // Every endpoint is backed off now; it is tried anyway.
    let result = conn.execute_buffered(&stmt, &[]).unwrap();
    assert_eq!(served_by(&result), "a");
    assert_eq!(a.handshakes(), 2);
    assert_eq!(a.prepares(), 2);
}

#[test]
fn authentication_errors_are_not_retried() {
    let a = FakeServer::start("a");
    let b = FakeServer::start("b");
    a.reject_auth();
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);

    let err = source.get_connection().unwrap_err();
    assert!(err.is_authentication(), "unexpected error: {err}");
    assert_eq!(b.handshakes(), 0);
}

#[test]
fn statement_errors_are_not_retried() {
    let a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    let err = conn.query_buffered("FAIL please").unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
    assert_eq!(a.count("FAIL please"), 1);
    assert_eq!(b.count("FAIL please"), 0);

    // The session is still usable.
    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "a");
}

#[test]
fn lost_transaction_is_not_replayed() {
    let mut a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::Sequential, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    conn.begin().unwrap();
    assert!(conn.in_transaction());
    a.kill();
    assert!(conn.query_buffered("UPDATE t SET x = 1").unwrap_err().is_transient());
    assert_eq!(b.count("UPDATE"), 0);

    // The next call starts over on the replacement.
    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "b");
}

#[test]
fn statement_handles_are_checked() {
    let a = FakeServer::start("a");
    let source = source(HaMode::Sequential, vec![a.endpoint()]);
    let mut first = source.get_connection().unwrap();
    let mut second = source.get_connection().unwrap();

    let stmt = first.prepare("SELECT ?").unwrap();
    assert!(matches!(
        second.execute_buffered(&stmt, &[Value::Int(1)]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        first.execute_buffered(&stmt, &[]),
        Err(Error::InvalidArgument(_))
    ));

    first.close_statement(&stmt).unwrap();
    first.close_statement(&stmt).unwrap();
    assert!(matches!(
        first.execute_buffered(&stmt, &[Value::Int(1)]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn error_in_a_trailing_result_is_returned() {
    let a = FakeServer::start("a");
    let source = source(HaMode::Sequential, vec![a.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    let err = conn.query_buffered("CALL raise_error()").unwrap_err();
    assert_eq!(err.server_code(), Some(1644));
    assert_eq!(err.sqlstate(), Some("45000"));

    let mut stream = conn.query("CALL raise_error()").unwrap();
    assert_eq!(stream.next_row().unwrap_err().server_code(), Some(1644));
    assert!(stream.is_done());
    drop(stream);

    // Same session, nothing left pending.
    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "a");
    assert_eq!(a.handshakes(), 1);
}

#[test]
fn session_cut_mid_stream_is_replaced_on_the_next_call() {
    let a = FakeServer::start("a");
    let source = source(HaMode::Sequential, vec![a.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    {
        let mut rows = conn.query("SELECT * FROM stream_until_cut").unwrap();
        let first = rows.next_row().unwrap().unwrap();
        assert_eq!(first.get(0).and_then(Value::as_str), Some("a"));

        a.drop_connections();
        let err = rows.next_row().unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
        assert!(rows.is_done());
    }

    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "a");
    assert_eq!(a.handshakes(), 2);
}
