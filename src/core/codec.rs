//! JSON wire format for jobs.

use super::error::QueueError;
use super::processor::JobPayload;

/// Encode a job into the string stored on the broker.
///
/// # Errors
///
/// Returns [`QueueError::Serialize`] if serde rejects the value.
pub fn encode<J: JobPayload>(job: &J) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(QueueError::Serialize)
}

/// Decode a payload popped from the broker.
///
/// # Errors
///
/// Returns [`QueueError::Deserialize`] for malformed or mistyped payloads.
pub fn decode<J: JobPayload>(payload: &str) -> Result<J, QueueError> {
    serde_json::from_str(payload).map_err(QueueError::Deserialize)
}
