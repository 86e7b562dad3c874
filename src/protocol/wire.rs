//! Wire Format Types
//!
//! Every frame is one binary WebSocket message: a 1-byte message-type tag
//! followed by a MessagePack payload. Payloads are always maps; structs are
//! written with field names (`to_vec_named`) so the browser client's msgpack
//! decoder sees plain objects.
//!
//! ```text
//! +--------+--------------------------------------+
//! | tag u8 | msgpack map                          |
//! +--------+--------------------------------------+
//!   0x10      {}                                    ping
//!   0xA0      {image: bin}                          identify
//!   0xB0      {first_image: bin, second_image: bin} verify
//!   0xF0      {}                                    diagnostic
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::error::CodecError;
use crate::queue::{FaceRect, Outcome};

/// Shortest frame worth decoding: one tag byte plus at least one payload byte.
pub const MIN_FRAME_LEN: usize = 2;

/// MessagePack encoding of an empty map.
pub const EMPTY_MAP: u8 = 0x80;

/// Pong frame: the tag followed by an empty map.
pub const PONG_FRAME: [u8; 2] = [MessageType::PongResponse as u8, EMPTY_MAP];

/// Detail sent with every throttled-response frame.
pub const THROTTLED_DETAIL: &str = "Too many requests, try again later.";

// ============================================================================
// Message Type
// ============================================================================

/// Message-type tag carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    PingRequest = 0x10,
    PongResponse = 0x11,

    IdentifyRequest = 0xA0,
    IdentifyResponse = 0xA1,

    VerifyRequest = 0xB0,
    VerifyResponse = 0xB1,

    DiagnosticRequest = 0xF0,
    DiagnosticResponse = 0xF1,

    ThrottledResponse = 0xFF,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::PingRequest,
        MessageType::PongResponse,
        MessageType::IdentifyRequest,
        MessageType::IdentifyResponse,
        MessageType::VerifyRequest,
        MessageType::VerifyResponse,
        MessageType::DiagnosticRequest,
        MessageType::DiagnosticResponse,
        MessageType::ThrottledResponse,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The response tag paired with a request tag.
    pub fn response(self) -> Option<MessageType> {
        match self {
            MessageType::PingRequest => Some(MessageType::PongResponse),
            MessageType::IdentifyRequest => Some(MessageType::IdentifyResponse),
            MessageType::VerifyRequest => Some(MessageType::VerifyResponse),
            MessageType::DiagnosticRequest => Some(MessageType::DiagnosticResponse),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_u8() == tag)
            .ok_or(CodecError::UnknownType(tag))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.as_u8())
    }
}

// ============================================================================
// Request payloads
// ============================================================================

/// One value of a request map, reduced to what the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Bytes(Vec<u8>),
    Other,
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldVisitor;

        impl<'de> Visitor<'de> for FieldVisitor {
            type Value = Field;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any MessagePack value")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Field, E> {
                Ok(Field::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Field, E> {
                Ok(Field::Bytes(v))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_str<E: de::Error>(self, _: &str) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_none<E: de::Error>(self) -> Result<Field, E> {
                Ok(Field::Other)
            }

            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Field, D2::Error> {
                Field::deserialize(d)
            }

            fn visit_newtype_struct<D2: Deserializer<'de>>(
                self,
                d: D2,
            ) -> Result<Field, D2::Error> {
                IgnoredAny::deserialize(d)?;
                Ok(Field::Other)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Field, A::Error> {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Field::Other)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Field, A::Error> {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(Field::Other)
            }
        }

        deserializer.deserialize_any(FieldVisitor)
    }
}

/// Decoded request payload: a string-keyed map of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct RequestFields(HashMap<String, Field>);

impl RequestFields {
    /// Remove and return a non-empty binary field. Missing, empty, or
    /// non-binary fields all count as absent.
    pub fn take_image(&mut self, key: &str) -> Option<Vec<u8>> {
        match self.0.remove(key) {
            Some(Field::Bytes(bytes)) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Empty request body, used for ping and diagnostic frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Identify-request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyRequest {
    pub image: ByteBuf,
}

/// Verify-request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub first_image: ByteBuf,
    pub second_image: ByteBuf,
}

// ============================================================================
// Response payloads
// ============================================================================

/// Successful identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationResponse {
    pub ok: bool,
    pub detail: Option<String>,
    pub faces_count: usize,
    pub faces: Vec<FaceRect>,
}

/// Successful verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub ok: bool,
    pub detail: Option<String>,
    pub is_match: bool,
    pub similarity_confidence: f64,
    pub faces: Vec<FaceRect>,
}

/// Failure body, shared by job failures and throttled responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Process introspection returned for diagnostic requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResponse {
    pub alive: bool,
    pub queue_len: usize,
    pub ws_clients: usize,
}

/// Body of an identify/verify response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Identification(IdentificationResponse),
    Verification(VerificationResponse),
    Error(ErrorResponse),
}

impl From<Outcome> for JobResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Identification { faces } => {
                JobResponse::Identification(IdentificationResponse {
                    ok: true,
                    detail: None,
                    faces_count: faces.len(),
                    faces,
                })
            }
            Outcome::Verification {
                is_match,
                confidence,
                faces,
            } => JobResponse::Verification(VerificationResponse {
                ok: true,
                detail: None,
                is_match,
                similarity_confidence: confidence,
                faces,
            }),
            Outcome::Failure { detail } => JobResponse::Error(ErrorResponse::new(detail)),
        }
    }
}

// ============================================================================
// Frame codec
// ============================================================================

/// Encode a frame: the tag byte followed by the named-map MessagePack payload.
pub fn encode<T: Serialize + ?Sized>(kind: MessageType, body: &T) -> Result<Vec<u8>, CodecError> {
    let mut frame = Vec::with_capacity(64);
    frame.push(kind.as_u8());
    rmp_serde::encode::write_named(&mut frame, body)?;
    Ok(frame)
}

/// Encode the response frame for a finished job.
pub fn encode_outcome(kind: MessageType, outcome: Outcome) -> Result<Vec<u8>, CodecError> {
    encode(kind, &JobResponse::from(outcome))
}

/// Encode the throttled-response frame.
pub fn encode_throttled() -> Result<Vec<u8>, CodecError> {
    encode(
        MessageType::ThrottledResponse,
        &ErrorResponse::new(THROTTLED_DETAIL),
    )
}

/// Split a frame into its tag and payload bytes without decoding the payload.
pub fn split_frame(frame: &[u8]) -> Result<(MessageType, &[u8]), CodecError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CodecError::TooShort { len: frame.len() });
    }
    match frame.split_first() {
        Some((tag, payload)) => Ok((MessageType::try_from(*tag)?, payload)),
        None => Err(CodecError::TooShort { len: 0 }),
    }
}

/// Decode a frame into its tag and a typed payload.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<(MessageType, T), CodecError> {
    let (kind, payload) = split_frame(frame)?;
    Ok((kind, rmp_serde::from_slice(payload)?))
}

/// Decode an inbound request frame. Payloads that are not maps are rejected.
pub fn decode_request(frame: &[u8]) -> Result<(MessageType, RequestFields), CodecError> {
    decode(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x1: i32, y1: i32, x2: i32, y2: i32) -> FaceRect {
        FaceRect {
            top_left: (x1, y1),
            bottom_right: (x2, y2),
        }
    }

    #[test]
    fn test_message_type_from_u8() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::try_from(kind.as_u8()).unwrap(), kind);
        }
        assert!(matches!(
            MessageType::try_from(0x42),
            Err(CodecError::UnknownType(0x42))
        ));
    }

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(MessageType::PingRequest.as_u8(), 0x10);
        assert_eq!(MessageType::PongResponse.as_u8(), 0x11);
        assert_eq!(MessageType::IdentifyRequest.as_u8(), 0xA0);
        assert_eq!(MessageType::IdentifyResponse.as_u8(), 0xA1);
        assert_eq!(MessageType::VerifyRequest.as_u8(), 0xB0);
        assert_eq!(MessageType::VerifyResponse.as_u8(), 0xB1);
        assert_eq!(MessageType::DiagnosticRequest.as_u8(), 0xF0);
        assert_eq!(MessageType::DiagnosticResponse.as_u8(), 0xF1);
        assert_eq!(MessageType::ThrottledResponse.as_u8(), 0xFF);
    }

    #[test]
    fn test_response_pairs() {
        assert_eq!(
            MessageType::IdentifyRequest.response(),
            Some(MessageType::IdentifyResponse)
        );
        assert_eq!(
            MessageType::VerifyRequest.response(),
            Some(MessageType::VerifyResponse)
        );
        assert_eq!(MessageType::ThrottledResponse.response(), None);
    }

    #[test]
    fn test_pong_frame_bytes() {
        assert_eq!(PONG_FRAME, [0x11, 0x80]);
        let (kind, body): (_, Empty) = decode(&PONG_FRAME).unwrap();
        assert_eq!(kind, MessageType::PongResponse);
        assert_eq!(body, Empty {});
    }

    #[test]
    fn test_encode_prefixes_tag() {
        let frame = encode(MessageType::PingRequest, &Empty {}).unwrap();
        assert_eq!(frame, vec![0x10, 0x80]);
    }

    #[test]
    fn test_short_frames_rejected_before_payload_decode() {
        assert!(matches!(
            split_frame(&[]),
            Err(CodecError::TooShort { len: 0 })
        ));
        // A lone valid tag is still too short
        assert!(matches!(
            decode_request(&[0x10]),
            Err(CodecError::TooShort { len: 1 })
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            decode_request(&[0x42, 0x80]),
            Err(CodecError::UnknownType(0x42))
        ));
    }

    #[test]
    fn test_non_map_payload_rejected() {
        // fixarray of length 0
        assert!(matches!(
            decode_request(&[0xA0, 0x90]),
            Err(CodecError::Decode(_))
        ));
        // positive fixint
        assert!(decode_request(&[0xA0, 0x01]).is_err());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        // map16 header with truncated body
        assert!(matches!(
            decode_request(&[0xA0, 0xDE, 0x00]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_identify_request_fields() {
        let frame = encode(
            MessageType::IdentifyRequest,
            &IdentifyRequest {
                image: ByteBuf::from(vec![1, 2, 3]),
            },
        )
        .unwrap();
        let (kind, mut fields) = decode_request(&frame).unwrap();
        assert_eq!(kind, MessageType::IdentifyRequest);
        assert_eq!(fields.take_image("image"), Some(vec![1, 2, 3]));
        assert_eq!(fields.take_image("image"), None);
    }

    #[test]
    fn test_non_binary_or_empty_image_counts_as_missing() {
        #[derive(Serialize)]
        struct Loose<'a> {
            image: &'a str,
            first_image: ByteBuf,
            second_image: Vec<u32>,
        }
        let frame = encode(
            MessageType::VerifyRequest,
            &Loose {
                image: "not bytes",
                first_image: ByteBuf::new(),
                second_image: vec![1, 2],
            },
        )
        .unwrap();
        let (_, mut fields) = decode_request(&frame).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.take_image("image"), None);
        assert_eq!(fields.take_image("first_image"), None);
        assert_eq!(fields.take_image("second_image"), None);
    }

    #[test]
    fn test_nested_values_are_skipped() {
        let mut nested = HashMap::new();
        nested.insert("inner", vec![vec![1u8, 2], vec![3]]);
        #[derive(Serialize)]
        struct Body {
            meta: HashMap<&'static str, Vec<Vec<u8>>>,
            image: ByteBuf,
        }
        let frame = encode(
            MessageType::IdentifyRequest,
            &Body {
                meta: nested,
                image: ByteBuf::from(vec![9]),
            },
        )
        .unwrap();
        let (_, mut fields) = decode_request(&frame).unwrap();
        assert_eq!(fields.take_image("image"), Some(vec![9]));
    }

    #[test]
    fn test_identification_outcome_roundtrip() {
        let faces = vec![rect(230, 230, 380, 380), rect(510, 130, 660, 280)];
        let frame = encode_outcome(
            MessageType::IdentifyResponse,
            Outcome::Identification {
                faces: faces.clone(),
            },
        )
        .unwrap();
        let (kind, body): (_, JobResponse) = decode(&frame).unwrap();
        assert_eq!(kind, MessageType::IdentifyResponse);
        assert_eq!(
            body,
            JobResponse::Identification(IdentificationResponse {
                ok: true,
                detail: None,
                faces_count: 2,
                faces,
            })
        );
    }

    #[test]
    fn test_verification_outcome_roundtrip() {
        let frame = encode_outcome(
            MessageType::VerifyResponse,
            Outcome::Verification {
                is_match: true,
                confidence: 0.93,
                faces: vec![rect(0, 0, 10, 10), rect(5, 5, 20, 20)],
            },
        )
        .unwrap();
        let (_, body): (_, JobResponse) = decode(&frame).unwrap();
        match body {
            JobResponse::Verification(v) => {
                assert!(v.ok);
                assert!(v.is_match);
                assert!((v.similarity_confidence - 0.93).abs() < f64::EPSILON);
                assert_eq!(v.faces.len(), 2);
            }
            other => panic!("expected verification, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_outcome_roundtrip() {
        let frame = encode_outcome(
            MessageType::IdentifyResponse,
            Outcome::failure("No faces were found"),
        )
        .unwrap();
        let (_, body): (_, JobResponse) = decode(&frame).unwrap();
        assert_eq!(
            body,
            JobResponse::Error(ErrorResponse::new("No faces were found"))
        );
    }

    #[test]
    fn test_rectangles_encode_as_pairs() {
        let frame = encode_outcome(
            MessageType::IdentifyResponse,
            Outcome::Identification {
                faces: vec![rect(1, 2, 3, 4)],
            },
        )
        .unwrap();
        let (_, body): (_, serde_json::Value) = decode(&frame).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "ok": true,
                "detail": null,
                "faces_count": 1,
                "faces": [{"top_left": [1, 2], "bottom_right": [3, 4]}],
            })
        );
    }

    #[test]
    fn test_throttled_frame() {
        let frame = encode_throttled().unwrap();
        assert_eq!(frame[0], 0xFF);
        let (kind, body): (_, ErrorResponse) = decode(&frame).unwrap();
        assert_eq!(kind, MessageType::ThrottledResponse);
        assert_eq!(body.detail, THROTTLED_DETAIL);
        assert!(!body.ok);
    }

    #[test]
    fn test_diagnostic_roundtrip() {
        let diag = DiagnosticResponse {
            alive: true,
            queue_len: 3,
            ws_clients: 7,
        };
        let frame = encode(MessageType::DiagnosticResponse, &diag).unwrap();
        let (kind, back): (_, DiagnosticResponse) = decode(&frame).unwrap();
        assert_eq!(kind, MessageType::DiagnosticResponse);
        assert_eq!(back, diag);
    }
}
