// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Wire types of the inter-process message protocol.
//!
//! Every packet is a 4-byte big-endian length followed by one JSON document.
//! There is no version field: both ends must come from the same build.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::Result;

/// Group used when the caller does not pick one.
pub const DEFAULT_GROUP: &str = "";

pub const CODE_OK: i32 = 1;
pub const CODE_ERROR: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageRequest {
    pub send_pid: u32,
    pub recv_pid: u32,
    #[serde(default)]
    pub group: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            message: String::new(),
            data: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Frame codec shared by both ends of a connection.
pub(crate) fn frame_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

/// Byte payloads travel as base64 strings; `null` reads back as empty.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_request_wire_field_names() {
        let req = MessageRequest {
            send_pid: 10,
            recv_pid: 20,
            group: "g1".to_string(),
            data: b"hello".to_vec(),
        };
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "SendPid": 10,
                "RecvPid": 20,
                "Group": "g1",
                "Data": "aGVsbG8=",
            })
        );
    }

    #[test]
    fn test_response_null_data_decodes_empty() {
        let resp: MessageResponse =
            decode(br#"{"Code":1,"Message":"","Data":null}"#).unwrap();
        assert!(resp.is_ok());
        assert!(resp.data.is_empty());

        let resp: MessageResponse = decode(br#"{"Code":0,"Message":"nope"}"#).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.message, "nope");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let err = decode::<MessageRequest>(br#"{"SendPid":1,"RecvPid":2,"Data":"%%%"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_frame_is_length_prefixed_big_endian() {
        let mut codec = frame_codec(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"{\"Code\":1}"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 10]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let resp: MessageResponse = decode(&frame).unwrap();
        assert_eq!(resp.code, CODE_OK);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = frame_codec(8);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 64][..]);
        buf.extend_from_slice(&[b'x'; 64]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
