//! Tests for tokio spawner utilities

use stanchion::runtime::{Spawn, TokioSpawner};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_spawn_with_handle_returns_output() {
    let spawner = TokioSpawner::try_current().unwrap();
    let handle = spawner.spawn_with_handle(async { 6 * 7 });
    assert_eq!(handle.await.unwrap(), 42);
}

#[test]
fn test_try_current_outside_runtime_fails() {
    let err = TokioSpawner::try_current().unwrap_err();
    assert!(err.to_string().starts_with("runtime unavailable"));
}
