//! CBOR encoding for application payloads and state.
//!
//! The snapshot engine never looks inside a message or a state value. It
//! moves opaque CBOR bytes produced here. Encoding then decoding is also how
//! the [`StateStore`](crate::StateStore) takes a deep copy: the decoded value
//! shares nothing with the value that was encoded.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Bound for application messages and state carried by a node.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Encode a value to CBOR bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cargo {
        barrels: u32,
        owner: String,
    }

    #[test]
    fn test_encode_decode_struct() {
        let cargo = Cargo {
            barrels: 40,
            owner: "well-3".into(),
        };
        let bytes = encode(&cargo).unwrap();
        let back: Cargo = decode(&bytes).unwrap();
        assert_eq!(back, cargo);
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let bytes = encode(&"just a string").unwrap();
        let result: Result<Cargo> = decode(&bytes);
        assert!(matches!(result, Err(CoreError::DecodingError(_))));
    }

    #[test]
    fn test_decode_truncated_fails() {
        let bytes = encode(&vec![1u32, 2, 3, 4]).unwrap();
        let result: Result<Vec<u32>> = decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
