//! CBOR codec for protocol messages.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a serializable value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// A message that travels over the wire as CBOR.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes to CBOR.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_input_is_a_decode_error() {
        let bytes = to_cbor(&vec![1u32, 2, 3]).unwrap();
        let result: ProtocolResult<Vec<u32>> = from_cbor(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn wrong_shape_is_a_decode_error() {
        let bytes = to_cbor("not a number").unwrap();
        let result: ProtocolResult<u64> = from_cbor(&bytes);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
