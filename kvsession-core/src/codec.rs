//! Value codecs
//!
//! A codec turns a session's value map into the string stored in the `value`
//! column and back. The store never inspects the encoded form.

use crate::error::{CoreError, CoreResult};
use crate::types::SessionValues;

/// Pluggable encoding of a session value map
pub trait ValueCodec: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Encode a value map. An empty map must encode to the empty string.
    fn encode(&self, values: &SessionValues) -> CoreResult<String>;

    /// Decode a stored value. The empty string must decode to an empty map.
    fn decode(&self, raw: &str) -> CoreResult<SessionValues>;
}

/// JSON object encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, values: &SessionValues) -> CoreResult<String> {
        if values.is_empty() {
            return Ok(String::new());
        }
        serde_json::to_string(values).map_err(|e| CoreError::codec(self.name(), "encode", e))
    }

    fn decode(&self, raw: &str) -> CoreResult<SessionValues> {
        if raw.is_empty() {
            return Ok(SessionValues::new());
        }
        serde_json::from_str(raw).map_err(|e| CoreError::codec(self.name(), "decode", e))
    }
}
