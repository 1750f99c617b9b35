//! JSON and CBOR encoders.

use crate::error::{CodecError, CodecResult};
use serde::Serialize;

/// Encode any serializable value to a JSON string.
///
/// Map keys of [`Value`](crate::Value) are already sorted, so equal values
/// always produce identical text.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> CodecResult<String> {
    serde_json::to_string(value).map_err(|e| CodecError::encoding_failed(e.to_string()))
}

/// Encode any serializable value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}
