//! Tests for builder modules

use stanchion::builders::{address_scheme, build_client};
use stanchion::config::ClientOptions;
use stanchion::core::QueueError;
use stanchion::infra::broker::InMemoryBroker;

#[test]
fn test_address_scheme() {
    assert_eq!(address_scheme("redis://localhost:6379").unwrap(), "redis");
    assert_eq!(address_scheme("memory://").unwrap(), "memory");
    assert!(address_scheme("localhost:6379").is_err());
}

#[tokio::test]
async fn test_build_client_hands_scheme_to_factory() {
    let options = ClientOptions::default().with_address("memory://local");
    let client = build_client(options, |scheme, _| {
        assert_eq!(scheme, "memory");
        Ok(InMemoryBroker::new())
    })
    .unwrap();
    client.push_one(1u32).await.unwrap();
    assert_eq!(client.size().await.unwrap(), 1);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_build_client_validates_first() {
    let options = ClientOptions::default().with_concurrency(0);
    let result = build_client(options, |_, _| -> Result<InMemoryBroker, QueueError> {
        panic!("factory must not run for invalid options")
    });
    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

#[cfg(feature = "redis-backend")]
#[tokio::test]
async fn test_redis_builder_rejects_other_schemes() {
    let options = ClientOptions::default().with_address("memory://local");
    let result = stanchion::builders::build_redis_client(options);
    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

#[cfg(feature = "redis-backend")]
#[tokio::test]
async fn test_redis_builder_is_lazy() {
    // Nothing listens here; building must still succeed without a round trip.
    let options = ClientOptions::default().with_address("redis://127.0.0.1:6399");
    let client = stanchion::builders::build_redis_client(options).unwrap();
    assert!(!client.is_shutdown());
    client.shutdown().await.unwrap();
}

#[cfg(feature = "redis-backend")]
#[tokio::test]
async fn test_redis_builder_from_env_reads_options() {
    let expected = ClientOptions::from_env().unwrap();
    let client = stanchion::builders::build_redis_client_from_env().unwrap();
    assert_eq!(client.options().queue_key, expected.queue_key);
    client.shutdown().await.unwrap();
}
