//! Tests for client option parsing and validation

use std::collections::HashMap;
use std::time::Duration;

use stanchion::config::ClientOptions;

#[test]
fn test_defaults() {
    let options = ClientOptions::default();
    assert_eq!(options.concurrency, 10);
    assert_eq!(options.queue_key, "stanchion:queue");
    assert_eq!(options.max_retries, 6);
    assert_eq!(options.address, "redis://127.0.0.1:6379");
    assert_eq!(options.pop_timeout(), None);
    assert!(options.validate().is_ok());
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let options = ClientOptions::default().with_concurrency(0);
    assert!(options.validate().unwrap_err().contains("concurrency"));
}

#[test]
fn test_empty_queue_key_is_rejected() {
    let options = ClientOptions::default().with_queue_key("  ");
    assert!(options.validate().is_err());
}

#[test]
fn test_inverted_retry_delays_are_rejected() {
    let options = ClientOptions::default()
        .with_retry_delays(Duration::from_secs(5), Duration::from_secs(1));
    assert!(options.validate().is_err());
}

#[test]
fn test_json_fills_missing_fields_with_defaults() {
    let options = ClientOptions::from_json_str(r#"{"concurrency": 3, "queue_key": "mail"}"#).unwrap();
    assert_eq!(options.concurrency, 3);
    assert_eq!(options.queue_key, "mail");
    assert_eq!(options.max_retries, 6);
}

#[test]
fn test_json_rejects_invalid_values() {
    assert!(ClientOptions::from_json_str(r#"{"concurrency": 0}"#).is_err());
    assert!(ClientOptions::from_json_str("not json")
        .unwrap_err()
        .starts_with("parse error"));
}

#[test]
fn test_retry_policy_mirrors_options() {
    let options = ClientOptions::default()
        .with_max_retries(2)
        .with_retry_delays(Duration::from_millis(10), Duration::from_millis(40));
    let policy = options.retry_policy();
    assert_eq!(policy.max_retries, 2);
    assert_eq!(policy.delay_for(0), Duration::from_millis(10));
    assert_eq!(policy.delay_for(5), Duration::from_millis(40));
}

#[test]
fn test_lookup_overrides_defaults() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("STANCHION_CONCURRENCY", "4"),
        ("STANCHION_QUEUE_KEY", "thumbnails"),
        ("STANCHION_POP_TIMEOUT_MS", "250"),
    ]);
    let options = ClientOptions::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
    assert_eq!(options.concurrency, 4);
    assert_eq!(options.queue_key, "thumbnails");
    assert_eq!(options.pop_timeout(), Some(Duration::from_millis(250)));
    assert_eq!(options.max_retries, 6);
}

#[test]
fn test_lookup_names_the_bad_variable() {
    let err = ClientOptions::from_lookup(|name| {
        (name == "STANCHION_MAX_RETRIES").then(|| "lots".to_string())
    })
    .unwrap_err();
    assert!(err.contains("STANCHION_MAX_RETRIES"));
}
