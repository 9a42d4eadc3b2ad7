//! Tests for error types

use stanchion::core::{ErrorClass, QueueError};
use stanchion::infra::broker::BrokerError;

#[test]
fn test_shutdown_error() {
    let err = QueueError::Shutdown;
    assert_eq!(format!("{err}"), "client is shut down");
    assert!(err.is_shutdown());
}

#[test]
fn test_over_fetch_is_an_invariant_violation() {
    let err = QueueError::OverFetch { ceiling: 4 };
    assert!(err.is_invariant_violation());
    assert!(err.to_string().contains('4'));
}

#[test]
fn test_broker_errors_are_transparent() {
    let err: QueueError = BrokerError::Command("WRONGTYPE".into()).into();
    assert_eq!(err.to_string(), "command failed: WRONGTYPE");
    assert_eq!(err.class(), ErrorClass::Backend);
}

#[test]
fn test_connection_errors_name_the_connection() {
    let err = QueueError::ConnectionDisconnecting {
        connection: "stanchion:worker:3".into(),
        cause: BrokerError::ConnectionLost("reset by peer".into()),
    };
    let msg = err.to_string();
    assert!(msg.contains("stanchion:worker:3"));
    assert!(msg.contains("reset by peer"));
    assert_eq!(err.class(), ErrorClass::Connection);
}

#[test]
fn test_deserialize_error_keeps_source() {
    let source = serde_json::from_str::<u32>("nope").unwrap_err();
    let err = QueueError::Deserialize(source);
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(err.class(), ErrorClass::PerJob);
}
