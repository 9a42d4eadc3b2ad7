//! Connection lifecycle tests: broker outages, retry budgets and close semantics.

use std::time::Duration;

use stanchion::core::{Connection, ConnectionEvent, ConnectionState, RetryPolicy};
use stanchion::infra::broker::{BrokerError, InMemoryBroker};
use stanchion::runtime::TokioSpawner;
use tokio::sync::broadcast;

const KEY: &str = "outage:queue";

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

/// Collect events until `stop` matches one, failing after a generous timeout.
async fn events_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    stop: impl Fn(&ConnectionEvent) -> bool,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("connection events");
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("expected event in time");
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_outage_recovers_within_budget() {
    let broker = InMemoryBroker::new();
    let conn = Connection::new("outage", broker.clone(), policy(8));
    let mut rx = conn.subscribe();
    conn.start(&TokioSpawner::try_current().unwrap());
    events_until(&mut rx, |e| *e == ConnectionEvent::Ready).await;

    broker.go_offline();
    let restore = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.go_online();
        })
    };

    let seen = events_until(&mut rx, |e| *e == ConnectionEvent::Ready).await;
    restore.await.unwrap();
    assert!(matches!(seen[0], ConnectionEvent::Disconnecting(_)));
    assert_eq!(seen[1], ConnectionEvent::Cutted { is_final: false });
    assert!(seen
        .iter()
        .all(|e| !matches!(e, ConnectionEvent::Cutted { is_final: true })));
    assert_eq!(conn.state(), ConnectionState::Ready);

    conn.push(KEY, &["after".to_string()]).await.unwrap();
    assert_eq!(conn.len(KEY).await.unwrap(), 1);
    conn.close(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outage_outlasting_budget_is_final() {
    let broker = InMemoryBroker::new();
    let conn = Connection::new("outage", broker.clone(), policy(2));
    let mut rx = conn.subscribe();
    conn.start(&TokioSpawner::try_current().unwrap());
    events_until(&mut rx, |e| *e == ConnectionEvent::Ready).await;

    broker.go_offline();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ConnectionEvent::Cutted { is_final: true })
    })
    .await;

    let failed_attempts = seen
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::Error(_)))
        .count();
    assert_eq!(failed_attempts, 2);
    assert!(conn.is_closed());

    // Coming back online later does not revive a finally cut connection.
    broker.go_online();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(conn.is_closed());
    assert_eq!(conn.len(KEY).await, Err(BrokerError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_wait_for_first_connect() {
    let broker = InMemoryBroker::new();
    broker.go_offline();
    let conn = Connection::new("late", broker.clone(), policy(10));
    conn.start(&TokioSpawner::try_current().unwrap());

    let pusher = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.push(KEY, &["queued".to_string()]).await })
    };
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(!pusher.is_finished());

    broker.go_online();
    tokio::time::timeout(Duration::from_secs(5), pusher)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(broker.len_of(KEY), 1);
    conn.close(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_during_reconnect_ends_cleanly() {
    let broker = InMemoryBroker::new();
    let conn = Connection::new("closing", broker.clone(), policy(50));
    let mut rx = conn.subscribe();
    conn.start(&TokioSpawner::try_current().unwrap());
    events_until(&mut rx, |e| *e == ConnectionEvent::Ready).await;

    broker.go_offline();
    events_until(&mut rx, |e| *e == ConnectionEvent::Cutted { is_final: false }).await;
    tokio::time::timeout(Duration::from_secs(1), conn.close(true))
        .await
        .unwrap();
    assert!(conn.is_closed());

    broker.go_online();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.live_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_draining_close_never_loses_a_popped_job() {
    let spawner = TokioSpawner::try_current().unwrap();
    for round in 0..300 {
        let broker = InMemoryBroker::new();
        let conn = Connection::new("race", broker.clone(), policy(3));
        let mut rx = conn.subscribe();
        conn.start(&spawner);
        events_until(&mut rx, |e| *e == ConnectionEvent::Ready).await;

        let popper = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.pop(KEY, None).await })
        };
        tokio::task::yield_now().await;

        let pusher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.push_raw(KEY, "job") })
        };
        let closer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close(true).await })
        };

        let popped = tokio::time::timeout(Duration::from_secs(5), popper)
            .await
            .expect("pop settles under close")
            .unwrap()
            .unwrap();
        pusher.await.unwrap();
        assert!(
            popped.is_some() || broker.len_of(KEY) == 1,
            "round {round}: job left the broker without reaching the caller"
        );
        drop(popped);
        tokio::time::timeout(Duration::from_secs(5), closer)
            .await
            .expect("close resolves once the lease is returned")
            .unwrap();
        assert!(conn.is_closed());
    }
}
