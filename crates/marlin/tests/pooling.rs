//! Session reuse through the shared pool.

mod support;

use marlin::prelude::*;
use support::FakeServer;

fn config(server: &FakeServer) -> ConnectConfig {
    ConnectConfig::new()
        .endpoint(server.endpoint())
        .ha_mode(HaMode::Sequential)
        .session(SessionConfig::new().user("app").connect_timeout(2_000))
        .pool(PoolConfig::new(2).acquire_timeout(200))
}

#[test]
fn released_session_is_reused_without_handshake() {
    let a = FakeServer::start("a");
    let source = DataSource::new(config(&a)).unwrap();

    let mut conn = source.get_connection().unwrap();
    conn.query_buffered("SELECT 1").unwrap();
    conn.close().unwrap();
    assert_eq!(source.pool_stats().idle, 1);

    let mut conn = source.get_connection().unwrap();
    conn.query_buffered("SELECT 2").unwrap();
    conn.close().unwrap();
    assert_eq!(a.handshakes(), 1);
    assert_eq!(source.pool_stats().created, 1);
}

#[test]
fn equal_configurations_share_a_pool() {
    let a = FakeServer::start("a");
    let first = DataSource::new(config(&a)).unwrap();
    let second = DataSource::new(config(&a)).unwrap();

    first.get_connection().unwrap().close().unwrap();
    second.get_connection().unwrap().close().unwrap();
    assert_eq!(a.handshakes(), 1);
}

#[test]
fn statements_are_deallocated_on_close() {
    let a = FakeServer::start("a");
    let source = DataSource::new(config(&a)).unwrap();

    let mut conn = source.get_connection().unwrap();
    let stmt = conn.prepare("SELECT ?").unwrap();
    conn.execute_buffered(&stmt, &[Value::Text("x".into())]).unwrap();
    conn.close().unwrap();

    // The pooled session comes back without the old statement.
    let mut conn = source.get_connection().unwrap();
    let again = conn.prepare("SELECT ?").unwrap();
    assert_eq!(again.param_count(), 1);
    conn.execute_buffered(&again, &[Value::Null]).unwrap();
    assert_eq!(a.handshakes(), 1);
    assert_eq!(a.prepares(), 2);
}

#[test]
fn open_transaction_is_not_pooled() {
    let a = FakeServer::start("a");
    let source = DataSource::new(config(&a)).unwrap();

    let mut conn = source.get_connection().unwrap();
    conn.begin().unwrap();
    conn.close().unwrap();
    assert_eq!(source.pool_stats().idle, 0);

    source.get_connection().unwrap().close().unwrap();
    assert_eq!(a.handshakes(), 2);
}

#[test]
fn pool_limit_applies_per_endpoint() {
    let a = FakeServer::start("a");
    let source = DataSource::new(config(&a)).unwrap();

    let first = source.get_connection().unwrap();
    let second = source.get_connection().unwrap();
    let err = source.get_connection().unwrap_err();
    assert!(err.is_pool_exhausted(), "unexpected error: {err}");
    drop(first);
    drop(second);
}

#[test]
fn shutdown_closes_idle_sessions() {
    let a = FakeServer::start("a");
    let source = DataSource::new(config(&a)).unwrap();
    source.get_connection().unwrap().close().unwrap();
    assert_eq!(source.pool_stats().idle, 1);

    source.shutdown();
    assert_eq!(source.pool_stats().idle, 0);
    assert!(matches!(source.get_connection(), Err(Error::Pool(_))));
}
