//! Weft binary frame serialization and parsing.
//!
//! Each frame is a type-length-value (TLV) binary message. The first byte
//! identifies the frame type; remaining bytes carry the payload. On the
//! wire every frame is preceded by a u32 big-endian length prefix, which
//! belongs to the framed transport, not to this codec.

use crate::types::DeviceId;
use thiserror::Error;

/// CALL frame type: client → node, an outbound RPC request.
pub const TYPE_CALL: u8 = 0x01;
/// RESPONSE frame type: node → client, answers a CALL by request id.
pub const TYPE_RESPONSE: u8 = 0x02;
/// PORT_OPEN frame type: node → client, a remote device dials a published port.
pub const TYPE_PORT_OPEN: u8 = 0x10;
/// PORT_SEND frame type: stream payload bytes, either direction.
pub const TYPE_PORT_SEND: u8 = 0x11;
/// PORT_CLOSE frame type: stream teardown, either direction.
pub const TYPE_PORT_CLOSE: u8 = 0x12;
/// PORT_OPEN_ACK frame type: client → node, the single response to a PORT_OPEN.
pub const TYPE_PORT_OPEN_ACK: u8 = 0x13;
/// GOODBYE frame type: node → client, authoritative session termination.
pub const TYPE_GOODBYE: u8 = 0x20;

/// Maximum frame body size in bytes (64 KiB - 1).
pub const MAX_PAYLOAD: usize = 65_535;

/// Bytes of PORT_SEND framing overhead (type byte + stream ref).
pub const PORT_SEND_OVERHEAD: usize = 1 + 8;

/// A parsed weft protocol frame.
///
/// Variants map 1:1 to wire frame types defined by `TYPE_*` constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Outbound RPC request from client to node.
    Call {
        /// Request id, unique and ascending within a session.
        id: u64,
        /// RPC method name.
        method: String,
        /// Method-specific argument bytes.
        args: Vec<u8>,
    },
    /// Node's answer to a `Call` with the same id.
    Response {
        /// Request id this response answers.
        id: u64,
        /// True when the body carries an error message instead of a result.
        error: bool,
        /// Method-specific result bytes, or an error message.
        body: Vec<u8>,
    },
    /// A remote device is dialing one of our published ports.
    PortOpen {
        /// The dialing device.
        device_id: DeviceId,
        /// The published port being dialed.
        port: u16,
        /// Node-assigned stream reference, unique within the session.
        stream_ref: u64,
    },
    /// Stream payload bytes.
    PortSend {
        /// Stream the bytes belong to.
        stream_ref: u64,
        /// Payload.
        data: Vec<u8>,
    },
    /// Stream teardown.
    PortClose {
        /// Stream being closed.
        stream_ref: u64,
    },
    /// The single response to a `PortOpen`.
    PortOpenAck {
        /// Stream reference from the `PortOpen`.
        stream_ref: u64,
        /// Denial reason; `None` means the open was accepted.
        error: Option<String>,
    },
    /// Authoritative session termination by the node.
    Goodbye {
        /// Human-readable reason.
        reason: String,
    },
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The input byte slice was empty.
    #[error("frame is empty")]
    Empty,
    /// The frame is too short for the declared type.
    #[error("frame too short")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The frame payload exceeds the maximum allowed size.
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed payload size.
        max: usize,
        /// Actual payload size received.
        actual: usize,
    },
    /// The first byte does not match any known frame type.
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
}

/// Safely convert a byte slice to a fixed-size array.
/// Returns `FrameError::TooShort` if the slice is the wrong length.
fn try_into_array<const N: usize>(data: &[u8]) -> Result<[u8; N], FrameError> {
    data.try_into().map_err(|_| FrameError::TooShort {
        expected: N,
        actual: data.len(),
    })
}

fn read_u64(data: &[u8], at: usize) -> Result<u64, FrameError> {
    if data.len() < at + 8 {
        return Err(FrameError::TooShort {
            expected: at + 8,
            actual: data.len(),
        });
    }
    Ok(u64::from_be_bytes(try_into_array(&data[at..at + 8])?))
}

impl Frame {
    /// Creates a new `Call` frame.
    #[must_use]
    pub fn call(id: u64, method: &str, args: Vec<u8>) -> Self {
        Self::Call {
            id,
            method: method.to_string(),
            args,
        }
    }

    /// Creates a success `Response` frame.
    #[must_use]
    pub fn response(id: u64, body: Vec<u8>) -> Self {
        Self::Response {
            id,
            error: false,
            body,
        }
    }

    /// Creates an error `Response` frame carrying a message.
    #[must_use]
    pub fn error_response(id: u64, message: &str) -> Self {
        Self::Response {
            id,
            error: true,
            body: message.as_bytes().to_vec(),
        }
    }

    /// Creates a `PortOpen` frame.
    #[must_use]
    pub const fn port_open(device_id: DeviceId, port: u16, stream_ref: u64) -> Self {
        Self::PortOpen {
            device_id,
            port,
            stream_ref,
        }
    }

    /// Creates a `PortSend` frame.
    #[must_use]
    pub fn port_send(stream_ref: u64, data: &[u8]) -> Self {
        Self::PortSend {
            stream_ref,
            data: data.to_vec(),
        }
    }

    /// Creates a `PortClose` frame.
    #[must_use]
    pub const fn port_close(stream_ref: u64) -> Self {
        Self::PortClose { stream_ref }
    }

    /// Creates a `PortOpenAck` frame; `error: None` accepts the open.
    #[must_use]
    pub const fn port_open_ack(stream_ref: u64, error: Option<String>) -> Self {
        Self::PortOpenAck { stream_ref, error }
    }

    /// Creates a `Goodbye` frame.
    #[must_use]
    pub fn goodbye(reason: &str) -> Self {
        Self::Goodbye {
            reason: reason.to_string(),
        }
    }

    /// Serializes this frame into a byte vector (without the length prefix).
    ///
    /// # Examples
    ///
    /// ```
    /// use weft_common::frame::{Frame, TYPE_PORT_CLOSE};
    /// let bytes = Frame::port_close(7).serialize();
    /// assert_eq!(bytes[0], TYPE_PORT_CLOSE);
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Call { id, method, args } => {
                let mut v = Vec::with_capacity(10 + method.len() + args.len());
                v.push(TYPE_CALL);
                v.extend_from_slice(&id.to_be_bytes());
                v.push(method.len().min(u8::MAX as usize) as u8);
                v.extend_from_slice(&method.as_bytes()[..method.len().min(u8::MAX as usize)]);
                v.extend_from_slice(args);
                v
            }
            Self::Response { id, error, body } => {
                let mut v = Vec::with_capacity(10 + body.len());
                v.push(TYPE_RESPONSE);
                v.extend_from_slice(&id.to_be_bytes());
                v.push(u8::from(*error));
                v.extend_from_slice(body);
                v
            }
            Self::PortOpen {
                device_id,
                port,
                stream_ref,
            } => {
                let mut v = Vec::with_capacity(31);
                v.push(TYPE_PORT_OPEN);
                v.extend_from_slice(device_id);
                v.extend_from_slice(&port.to_be_bytes());
                v.extend_from_slice(&stream_ref.to_be_bytes());
                v
            }
            Self::PortSend { stream_ref, data } => {
                let mut v = Vec::with_capacity(PORT_SEND_OVERHEAD + data.len());
                v.push(TYPE_PORT_SEND);
                v.extend_from_slice(&stream_ref.to_be_bytes());
                v.extend_from_slice(data);
                v
            }
            Self::PortClose { stream_ref } => {
                let mut v = Vec::with_capacity(9);
                v.push(TYPE_PORT_CLOSE);
                v.extend_from_slice(&stream_ref.to_be_bytes());
                v
            }
            Self::PortOpenAck { stream_ref, error } => {
                let message = error.as_deref().unwrap_or("");
                let mut v = Vec::with_capacity(10 + message.len());
                v.push(TYPE_PORT_OPEN_ACK);
                v.extend_from_slice(&stream_ref.to_be_bytes());
                v.push(u8::from(error.is_some()));
                v.extend_from_slice(message.as_bytes());
                v
            }
            Self::Goodbye { reason } => {
                let mut v = Vec::with_capacity(1 + reason.len());
                v.push(TYPE_GOODBYE);
                v.extend_from_slice(reason.as_bytes());
                v
            }
        }
    }

    /// Serializes a `PortSend` directly from raw parts.
    ///
    /// Avoids the intermediate `Frame::PortSend` allocation on the stream
    /// pump hot path where payloads can be tens of KiB.
    #[must_use]
    pub fn serialize_port_send(stream_ref: u64, data: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(PORT_SEND_OVERHEAD + data.len());
        v.push(TYPE_PORT_SEND);
        v.extend_from_slice(&stream_ref.to_be_bytes());
        v.extend_from_slice(data);
        v
    }

    /// Parses a byte slice into a typed `Frame`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the data is empty, too short for the
    /// declared type, oversize, or has an unrecognized type byte.
    ///
    /// # Examples
    ///
    /// ```
    /// use weft_common::frame::Frame;
    /// let frame = Frame::port_send(3, b"hello");
    /// let parsed = Frame::parse(&frame.serialize()).unwrap();
    /// assert_eq!(frame, parsed);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        if data.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: data.len(),
            });
        }
        match data[0] {
            TYPE_CALL => {
                if data.len() < 10 {
                    return Err(FrameError::TooShort {
                        expected: 10,
                        actual: data.len(),
                    });
                }
                let id = read_u64(data, 1)?;
                let method_len = data[9] as usize;
                if data.len() < 10 + method_len {
                    return Err(FrameError::TooShort {
                        expected: 10 + method_len,
                        actual: data.len(),
                    });
                }
                let method = String::from_utf8_lossy(&data[10..10 + method_len]).into_owned();
                Ok(Self::Call {
                    id,
                    method,
                    args: data[10 + method_len..].to_vec(),
                })
            }
            TYPE_RESPONSE => {
                if data.len() < 10 {
                    return Err(FrameError::TooShort {
                        expected: 10,
                        actual: data.len(),
                    });
                }
                Ok(Self::Response {
                    id: read_u64(data, 1)?,
                    error: data[9] != 0,
                    body: data[10..].to_vec(),
                })
            }
            TYPE_PORT_OPEN => {
                if data.len() < 31 {
                    return Err(FrameError::TooShort {
                        expected: 31,
                        actual: data.len(),
                    });
                }
                Ok(Self::PortOpen {
                    device_id: try_into_array(&data[1..21])?,
                    port: u16::from_be_bytes(try_into_array(&data[21..23])?),
                    stream_ref: read_u64(data, 23)?,
                })
            }
            TYPE_PORT_SEND => {
                if data.len() < 9 {
                    return Err(FrameError::TooShort {
                        expected: 9,
                        actual: data.len(),
                    });
                }
                Ok(Self::PortSend {
                    stream_ref: read_u64(data, 1)?,
                    data: data[9..].to_vec(),
                })
            }
            TYPE_PORT_CLOSE => {
                if data.len() < 9 {
                    return Err(FrameError::TooShort {
                        expected: 9,
                        actual: data.len(),
                    });
                }
                Ok(Self::PortClose {
                    stream_ref: read_u64(data, 1)?,
                })
            }
            TYPE_PORT_OPEN_ACK => {
                if data.len() < 10 {
                    return Err(FrameError::TooShort {
                        expected: 10,
                        actual: data.len(),
                    });
                }
                let stream_ref = read_u64(data, 1)?;
                let error = if data[9] != 0 {
                    Some(String::from_utf8_lossy(&data[10..]).into_owned())
                } else {
                    None
                };
                Ok(Self::PortOpenAck { stream_ref, error })
            }
            TYPE_GOODBYE => Ok(Self::Goodbye {
                reason: String::from_utf8_lossy(&data[1..]).into_owned(),
            }),
            t => Err(FrameError::UnknownType(t)),
        }
    }

    /// Returns the wire type byte for this frame.
    #[must_use]
    pub const fn frame_type(&self) -> u8 {
        match self {
            Self::Call { .. } => TYPE_CALL,
            Self::Response { .. } => TYPE_RESPONSE,
            Self::PortOpen { .. } => TYPE_PORT_OPEN,
            Self::PortSend { .. } => TYPE_PORT_SEND,
            Self::PortClose { .. } => TYPE_PORT_CLOSE,
            Self::PortOpenAck { .. } => TYPE_PORT_OPEN_ACK,
            Self::Goodbye { .. } => TYPE_GOODBYE,
        }
    }

    /// Returns the request id if this is a `Response` frame.
    #[must_use]
    pub const fn response_id(&self) -> Option<u64> {
        if let Self::Response { id, .. } = self {
            Some(*id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trip_preserves_id_and_method() {
        let frame = Frame::call(42, "getblockpeak", vec![]);
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        match parsed {
            Frame::Call { id, method, args } => {
                assert_eq!(id, 42);
                assert_eq!(method, "getblockpeak");
                assert!(args.is_empty());
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn call_with_args_round_trip() {
        let frame = Frame::call(7, "getblockheader", 1234u64.to_be_bytes().to_vec());
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn response_round_trip() {
        let frame = Frame::response(42, b"body".to_vec());
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.response_id(), Some(42));
        assert!(matches!(parsed, Frame::Response { error: false, .. }));
    }

    #[test]
    fn error_response_carries_message() {
        let frame = Frame::error_response(9, "no such method");
        match Frame::parse(&frame.serialize()).unwrap() {
            Frame::Response { id, error, body } => {
                assert_eq!(id, 9);
                assert!(error);
                assert_eq!(body, b"no such method");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn port_open_round_trip() {
        let frame = Frame::port_open([0x11; 20], 8080, 99);
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn port_send_round_trip() {
        let frame = Frame::port_send(3, b"stream bytes");
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn serialize_port_send_matches_frame_serialize() {
        let via_frame = Frame::port_send(17, b"abc").serialize();
        let direct = Frame::serialize_port_send(17, b"abc");
        assert_eq!(via_frame, direct);
    }

    #[test]
    fn port_open_ack_success_has_no_error() {
        let bytes = Frame::port_open_ack(5, None).serialize();
        match Frame::parse(&bytes).unwrap() {
            Frame::PortOpenAck { stream_ref, error } => {
                assert_eq!(stream_ref, 5);
                assert!(error.is_none());
            }
            other => panic!("expected PortOpenAck, got {other:?}"),
        }
    }

    #[test]
    fn port_open_ack_error_round_trip() {
        let bytes = Frame::port_open_ack(5, Some("port was not published".into())).serialize();
        match Frame::parse(&bytes).unwrap() {
            Frame::PortOpenAck { error, .. } => {
                assert_eq!(error.as_deref(), Some("port was not published"));
            }
            other => panic!("expected PortOpenAck, got {other:?}"),
        }
    }

    #[test]
    fn goodbye_round_trip() {
        let bytes = Frame::goodbye("node shutting down").serialize();
        match Frame::parse(&bytes).unwrap() {
            Frame::Goodbye { reason } => assert_eq!(reason, "node shutting down"),
            other => panic!("expected Goodbye, got {other:?}"),
        }
    }

    #[test]
    fn empty_frame_is_error() {
        assert_eq!(Frame::parse(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn unknown_type_is_error() {
        assert!(matches!(
            Frame::parse(&[0xFF, 0, 0]),
            Err(FrameError::UnknownType(0xFF))
        ));
    }

    #[test]
    fn truncated_port_open_is_error() {
        let mut bytes = Frame::port_open([0x22; 20], 80, 1).serialize();
        bytes.truncate(12);
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn oversize_frame_is_error() {
        let data = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            Frame::parse(&data),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_device() -> impl Strategy<Value = DeviceId> {
        prop::collection::vec(any::<u8>(), 20).prop_map(|v| {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(&v);
            arr
        })
    }

    fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..1024)
    }

    proptest! {
        #[test]
        fn call_serialize_parse_roundtrip(id in any::<u64>(), args in arb_payload()) {
            let frame = Frame::call(id, "portopen", args);
            let parsed = Frame::parse(&frame.serialize()).unwrap();
            prop_assert_eq!(frame, parsed);
        }

        #[test]
        fn port_send_serialize_parse_roundtrip(stream_ref in any::<u64>(), data in arb_payload()) {
            let frame = Frame::port_send(stream_ref, &data);
            let parsed = Frame::parse(&frame.serialize()).unwrap();
            prop_assert_eq!(frame, parsed);
        }

        #[test]
        fn port_open_serialize_parse_roundtrip(
            device in arb_device(),
            port in any::<u16>(),
            stream_ref in any::<u64>()
        ) {
            let frame = Frame::port_open(device, port, stream_ref);
            let parsed = Frame::parse(&frame.serialize()).unwrap();
            prop_assert_eq!(frame, parsed);
        }

        #[test]
        fn first_byte_is_always_frame_type(stream_ref in any::<u64>(), data in arb_payload()) {
            let bytes = Frame::port_send(stream_ref, &data).serialize();
            prop_assert_eq!(bytes[0], TYPE_PORT_SEND);
        }
    }
}
