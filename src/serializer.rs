//! Payload serialization boundary.
//!
//! The task envelope carries the user payload as opaque bytes; a
//! [`Serializer`] decides how those bytes are produced and read back.
//! The provided [`JsonSerializer`] covers the common case. Applications with
//! other wire needs (compression, a binary codec, encryption) implement the
//! trait and hand their serializer to the coordinator at construction.

use serde_json::Value;

use crate::error::BokchoyResult;

/// Codec for user payloads stored inside a task record.
///
/// Implementations must round-trip any value the application publishes:
/// `loads(dumps(v)) == v`. They are shared between all queues and workers,
/// so they must be cheap to call concurrently.
pub trait Serializer: Send + Sync {
    /// Encode a payload value to bytes.
    fn dumps(&self, value: &Value) -> BokchoyResult<Vec<u8>>;

    /// Decode bytes back into a payload value.
    fn loads(&self, data: &[u8]) -> BokchoyResult<Value>;

    /// Short name, shown in the startup banner.
    fn name(&self) -> &str;

    /// Whether the encoded form is human readable (affects banner output only).
    fn is_human_readable(&self) -> bool;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumps(&self, value: &Value) -> BokchoyResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> BokchoyResult<Value> {
        Ok(serde_json::from_slice(data)?)
    }

    fn name(&self) -> &str {
        "json"
    }

    fn is_human_readable(&self) -> bool {
        true
    }
}
