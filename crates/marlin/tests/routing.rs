//! Load balancing and read/write splitting against scripted servers.

mod support;

use marlin::prelude::*;
use std::collections::HashMap;
use support::FakeServer;

fn source(mode: HaMode, endpoints: Vec<Endpoint>) -> DataSource {
    let config = ConnectConfig::new()
        .endpoints(endpoints)
        .ha_mode(mode)
        .session(SessionConfig::new().user("app").connect_timeout(2_000))
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
fn loadbalance_spreads_statements_evenly() {
    let servers: Vec<FakeServer> = ["a", "b", "c"].into_iter().map(FakeServer::start).collect();
    let source = source(
        HaMode::LoadBalance,
        servers.iter().map(FakeServer::endpoint).collect(),
    );
    let mut conn = source.get_connection().unwrap();

    let mut hits: HashMap<String, usize> = HashMap::new();
    for i in 0..30 {
        let result = conn.query_buffered(&format!("SELECT {i}")).unwrap();
        *hits.entry(served_by(&result)).or_default() += 1;
    }
    for server in &servers {
        let count = hits.get(server.name()).copied().unwrap_or(0);
        assert!((8..=12).contains(&count), "{}: {count} of 30", server.name());
    }
}

#[test]
fn loadbalance_follows_weights() {
    let heavy = FakeServer::start("heavy");
    let light = FakeServer::start("light");
    let source = source(
        HaMode::LoadBalance,
        vec![heavy.endpoint().weight(3), light.endpoint().weight(1)],
    );
    let mut conn = source.get_connection().unwrap();

    for i in 0..40 {
        conn.query_buffered(&format!("SELECT {i}")).unwrap();
    }
    assert_eq!(heavy.count("SELECT"), 30);
    assert_eq!(light.count("SELECT"), 10);
}

#[test]
fn loadbalance_skips_a_dead_endpoint() {
    let a = FakeServer::start("a");
    let mut b = FakeServer::start("b");
    let source = source(HaMode::LoadBalance, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    // Make sure a session to b is held, then lose it.
    for i in 0..2 {
        conn.query_buffered(&format!("SELECT {i}")).unwrap();
    }
    assert_eq!(b.count("SELECT"), 1);
    b.kill();

    for i in 0..6 {
        let result = conn.query_buffered(&format!("SELECT after {i}")).unwrap();
        assert_eq!(served_by(&result), "a");
    }
}

#[test]
fn loadbalance_sticks_to_the_transaction_session() {
    let a = FakeServer::start("a");
    let b = FakeServer::start("b");
    let source = source(HaMode::LoadBalance, vec![a.endpoint(), b.endpoint()]);
    let mut conn = source.get_connection().unwrap();

    conn.begin().unwrap();
    let owner = conn.current_endpoint().cloned().unwrap();
    for i in 0..4 {
        conn.query_buffered(&format!("SELECT {i}")).unwrap();
        assert_eq!(conn.current_endpoint(), Some(&owner));
    }
    conn.commit().unwrap();
    assert_eq!(conn.current_endpoint(), Some(&owner));
    assert!(!conn.in_transaction());

    let mut seen = Vec::new();
    for i in 0..2 {
        conn.query_buffered(&format!("SELECT after {i}")).unwrap();
        seen.push(conn.current_endpoint().cloned().unwrap());
    }
    assert_ne!(seen[0], seen[1]);
}

#[test]
fn replication_splits_reads_from_writes() {
    let writer = FakeServer::start("writer");
    let r1 = FakeServer::start("r1");
    let r2 = FakeServer::start("r2");
    let source = source(
        HaMode::Replication,
        vec![
            writer.endpoint(),
            r1.endpoint().role(Role::Reader),
            r2.endpoint().role(Role::Reader),
        ],
    );
    let mut conn = source.get_connection().unwrap();

    let read = conn.prepare_read_only("SELECT * FROM heroes").unwrap();
    let write = conn.prepare("SELECT * FROM heroes FOR UPDATE").unwrap();
    for _ in 0..6 {
        let result = conn.execute_buffered(&read, &[]).unwrap();
        assert_ne!(served_by(&result), "writer");
        let result = conn.execute_buffered(&write, &[]).unwrap();
        assert_eq!(served_by(&result), "writer");
    }
    assert_eq!(r1.count("FROM heroes"), 3);
    assert_eq!(r2.count("FROM heroes"), 3);

    assert_eq!(served_by(&conn.query_buffered("SELECT 1").unwrap()), "writer");
    conn.set_read_only(true).unwrap();
    assert_ne!(served_by(&conn.query_buffered("SELECT 2").unwrap()), "writer");
    assert_eq!(writer.count("SELECT 2"), 0);
}

#[test]
fn replication_reads_from_writer_without_readers() {
    let writer = FakeServer::start("writer");
    let mut reader = FakeServer::start("reader");
    let source = source(
        HaMode::Replication,
        vec![writer.endpoint(), reader.endpoint().role(Role::Reader)],
    );
    let mut conn = source.get_connection().unwrap();
    let read = conn.prepare_read_only("SELECT 1").unwrap();
    assert_eq!(served_by(&conn.execute_buffered(&read, &[]).unwrap()), "reader");

    reader.kill();
    assert_eq!(served_by(&conn.execute_buffered(&read, &[]).unwrap()), "writer");
}

#[test]
fn replication_transaction_stays_on_writer() {
    let writer = FakeServer::start("writer");
    let reader = FakeServer::start("reader");
    let source = source(
        HaMode::Replication,
        vec![writer.endpoint(), reader.endpoint().role(Role::Reader)],
    );
    let mut conn = source.get_connection().unwrap();
    let read = conn.prepare_read_only("SELECT 1").unwrap();

    conn.begin().unwrap();
    assert_eq!(served_by(&conn.execute_buffered(&read, &[]).unwrap()), "writer");
    conn.rollback().unwrap();
    assert_eq!(served_by(&conn.execute_buffered(&read, &[]).unwrap()), "reader");
}
