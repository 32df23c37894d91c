// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{test_config, wait_until, within, ConnectMode, FakeBroker};
use rabbitmq_resilience::{errors::AmqpError, Connection, ConnectionConfig, ConnectionState};
use std::{sync::Arc, time::Duration};

const LIMIT: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_connection() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());

    let (a, b, c) = tokio::join!(conn.connect(), conn.connect(), conn.connect());

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert!(c.is_ok());
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_connection_loss() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());
    conn.connect().await.unwrap();

    broker.drop_connections();

    wait_until(LIMIT, || conn.generation() == 2).await;
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(conn.stats().connections, 2);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn keeps_retrying_until_the_broker_comes_back() {
    let broker = FakeBroker::new();
    broker.set_connect_mode(ConnectMode::Refuse);
    let conn = broker.connection(test_config());

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.connect().await.map(|_| ()) }
    });

    wait_until(LIMIT, || broker.connect_attempts() >= 5).await;
    assert!(conn.stats().failed_attempts >= 4);
    assert!(!pending.is_finished());

    broker.set_connect_mode(ConnectMode::Accept);

    within(LIMIT, pending).await.unwrap().unwrap();
    assert_eq!(conn.stats().failed_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let broker = FakeBroker::new();
    broker.set_connect_mode(ConnectMode::Refuse);
    let conn = broker.connection(test_config().with_max_connection_attempts(3));

    let err = within(LIMIT, conn.connect()).await.err().unwrap();

    assert_eq!(err, AmqpError::ConnectionAttemptsExceeded(3));
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(conn.state(), ConnectionState::Failed);

    // later callers see the same terminal error
    let again = conn.load_channel("late").await.err().unwrap();
    assert_eq!(again, AmqpError::ConnectionAttemptsExceeded(3));
}

#[tokio::test(start_paused = true)]
async fn fails_fast_on_first_error_when_asked() {
    let broker = FakeBroker::new();
    broker.set_connect_mode(ConnectMode::Refuse);
    let conn = broker.connection(test_config().fail_on_first_connect_error());

    let err = within(LIMIT, conn.connect()).await.err().unwrap();

    assert!(matches!(err, AmqpError::ConnectionError(_)));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn hanging_attempts_time_out() {
    let broker = FakeBroker::new();
    broker.set_connect_mode(ConnectMode::Hang);
    let conn = broker.connection(test_config());

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.connect().await.map(|_| ()) }
    });

    wait_until(LIMIT, || broker.connect_attempts() >= 2).await;
    assert_eq!(
        conn.last_error(),
        Some(AmqpError::ConnectTimeout(Duration::from_millis(500)))
    );
    broker.set_connect_mode(ConnectMode::Accept);

    within(LIMIT, pending).await.unwrap().unwrap();
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(conn.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn follows_broker_flow_control() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());
    conn.connect().await.unwrap();

    broker.block();
    let state = within(LIMIT, conn.wait_for_state(|s| *s == ConnectionState::Blocked)).await;
    assert_eq!(state, ConnectionState::Blocked);
    assert!(conn.is_blocked());
    assert!(conn.is_connected());

    broker.unblock();
    within(LIMIT, conn.wait_for_state(|s| *s == ConnectionState::Connected)).await;
    assert!(!conn.is_blocked());
}

#[tokio::test(start_paused = true)]
async fn close_shuts_everything_down() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());
    conn.load_channel("worker").await.unwrap();

    within(LIMIT, conn.close()).await;

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(conn.connect().await.err(), Some(AmqpError::ConnectionClosed));
    assert_eq!(conn.load_channel("worker").await.err(), Some(AmqpError::ConnectionClosed));

    // nothing reconnects afterwards
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_before_connecting() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());

    within(LIMIT, conn.close()).await;

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(broker.connect_attempts(), 0);
}

#[test]
fn rejects_invalid_configuration() {
    let broker = FakeBroker::new();

    let bad_dsn = ConnectionConfig::new("http://localhost", "events", "tests");
    let err = Connection::with_transport(bad_dsn, Arc::new(broker.clone()))
        .err()
        .unwrap();
    assert!(err.is_configuration());

    let no_exchange = ConnectionConfig::new("amqp://localhost", "", "tests");
    assert!(Connection::with_transport(no_exchange, Arc::new(broker))
        .err()
        .unwrap()
        .is_configuration());
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_connection_error() {
    let broker = FakeBroker::new();
    let conn = broker.connection(test_config());
    conn.connect().await.unwrap();

    broker.error_connections();

    wait_until(LIMIT, || conn.generation() == 2).await;
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.open_connections(), 1);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn notices_a_connection_lost_before_connect_returned() {
    let broker = FakeBroker::new();
    broker.kill_next_on_connect();
    let conn = broker.connection(test_config());

    // the first handle may already be dead
    let _ = conn.connect().await;
    wait_until(LIMIT, || conn.generation() == 2).await;

    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.open_connections(), 1);
    assert!(conn.is_connected());
}
