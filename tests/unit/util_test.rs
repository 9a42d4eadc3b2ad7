//! Tests for telemetry helpers

use stanchion::util::telemetry::{init_tracing, init_tracing_with, DEFAULT_DIRECTIVE};

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing_with("stanchion=debug");
    init_tracing();
    init_tracing();
    assert!(tracing::dispatcher::has_been_set());
}

#[test]
fn test_default_directive_targets_crate() {
    assert!(DEFAULT_DIRECTIVE.starts_with("stanchion"));
}
