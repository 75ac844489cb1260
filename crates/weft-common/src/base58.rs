//! Base58 encoding and decoding utilities for weft identifiers.
//!
//! Wraps the `bs58` crate with convenience functions for the 20-byte
//! device ids and fleet addresses used throughout the overlay.

use thiserror::Error;

pub use bs58::decode::Error as DecodeError;

/// Errors that can occur when decoding a Base58-encoded device id.
///
/// # Examples
///
/// ```
/// use weft_common::base58;
/// // Wrong length returns WrongLength error
/// let short = base58::encode(&[1u8; 8]);
/// assert!(base58::decode_device(&short).is_err());
/// ```
#[derive(Debug, Error)]
pub enum DeviceDecodeError {
    /// The input is not valid Base58.
    #[error("invalid base58: {0}")]
    Base58(#[from] DecodeError),
    /// The decoded bytes are not exactly 20 bytes.
    #[error("device id must be exactly 20 bytes, got {0}")]
    WrongLength(usize),
}

/// Encodes raw bytes to a Base58 string.
///
/// # Examples
///
/// ```
/// let encoded = weft_common::base58::encode(&[1, 2, 3]);
/// assert!(!encoded.is_empty());
/// ```
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58 string to raw bytes.
///
/// # Errors
///
/// Returns `DecodeError` if the input is not valid Base58.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    bs58::decode(s).into_vec()
}

/// Decodes a Base58 string to a 20-byte device id or fleet address.
///
/// # Errors
///
/// Returns [`DeviceDecodeError`] if the input is not valid Base58
/// or does not decode to exactly 20 bytes.
///
/// # Examples
///
/// ```
/// let device = [0x42u8; 20];
/// let encoded = weft_common::base58::encode(&device);
/// let decoded = weft_common::base58::decode_device(&encoded).unwrap();
/// assert_eq!(decoded, device);
/// ```
pub fn decode_device(s: &str) -> Result<[u8; 20], DeviceDecodeError> {
    let bytes = decode(s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_: Vec<u8>| DeviceDecodeError::WrongLength(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let data = [0xABu8; 20];
        let encoded = encode(&data);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_device_round_trip() {
        let device = [0x42u8; 20];
        let encoded = encode(&device);
        let decoded = decode_device(&encoded).unwrap();
        assert_eq!(decoded, device);
    }

    #[test]
    fn decode_device_wrong_length() {
        let short = encode(&[1u8; 8]);
        let err = decode_device(&short).unwrap_err();
        assert!(matches!(err, DeviceDecodeError::WrongLength(8)));
    }

    #[test]
    fn decode_device_empty_string() {
        let err = decode_device("").unwrap_err();
        assert!(matches!(err, DeviceDecodeError::WrongLength(0)));
    }
}
