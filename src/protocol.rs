//! Wire protocol for the session data channel
//!
//! Every frame is one JSON text message tagged by `type`:
//! - `{type:"message", payload, timestamp}`
//! - `{type:"file_start", fileName, fileSize, fileType, timestamp, transferId?}`
//! - `{type:"file_chunk", data:[u8...], offset, chunkIndex, isLast, transferId?}`
//! - `{type:"file_end", fileName, timestamp, transferId?}`
//!
//! `transferId` ties the frames of one file together. Peers that do not send
//! it are still understood (see `transfer::Reassembler`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

const KNOWN_TYPES: [&str; 4] = ["message", "file_start", "file_chunk", "file_end"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Message {
        payload: Value,
        #[serde(default)]
        timestamp: i64,
    },
    FileStart {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType", default)]
        file_type: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "transferId", default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
    },
    FileChunk {
        data: Vec<u8>,
        #[serde(default)]
        offset: u64,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        #[serde(rename = "isLast", default)]
        is_last: bool,
        #[serde(rename = "transferId", default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
    },
    FileEnd {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "transferId", default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
    },
}

impl Frame {
    pub fn message(payload: impl Into<Value>, timestamp: i64) -> Self {
        Frame::Message {
            payload: payload.into(),
            timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Message { .. } => "message",
            Frame::FileStart { .. } => "file_start",
            Frame::FileChunk { .. } => "file_chunk",
            Frame::FileEnd { .. } => "file_end",
        }
    }
}

/// Text carried by a message frame. String payloads pass through verbatim;
/// anything else is delivered as its JSON text.
pub fn payload_text(payload: Value) -> String {
    match payload {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one inbound frame.
///
/// `Ok(None)` means well-formed JSON with a `type` this side does not know;
/// such frames are skipped rather than treated as errors.
pub fn decode(data: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let value: Value = serde_json::from_slice(data)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if !KNOWN_TYPES.contains(&kind) {
        log::debug!("Skipping frame of unknown type '{kind}'");
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_frame_layout() {
        let text = encode(&Frame::message("hi", 42)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "message", "payload": "hi", "timestamp": 42}));
    }

    #[test]
    fn chunk_frame_layout() {
        let frame = Frame::FileChunk {
            data: vec![1, 2, 255],
            offset: 16384,
            chunk_index: 1,
            is_last: true,
            transfer_id: Some("t1".into()),
        };
        let value: Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "file_chunk",
                "data": [1, 2, 255],
                "offset": 16384,
                "chunkIndex": 1,
                "isLast": true,
                "transferId": "t1"
            })
        );
    }

    #[test]
    fn legacy_frames_without_transfer_id_decode() {
        let raw = br#"{"type":"file_start","fileName":"a.txt","fileSize":3,"fileType":"text/plain","timestamp":1}"#;
        let frame = decode(raw).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::FileStart {
                file_name: "a.txt".into(),
                file_size: 3,
                file_type: "text/plain".into(),
                timestamp: 1,
                transfer_id: None,
            }
        );
        let text = encode(&frame).unwrap();
        assert!(!text.contains("transferId"));
    }

    #[test]
    fn non_string_payload_becomes_json_text() {
        let raw = br#"{"type":"message","payload":{"type":"chat_message","message":"hi"}}"#;
        let Some(Frame::Message { payload, .. }) = decode(raw).unwrap() else {
            panic!("expected message frame");
        };
        let text = payload_text(payload);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json!({"type": "chat_message", "message": "hi"}));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode(br#"{"payload":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(br#"{"type":"file_chunk","data":"oops"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_types_are_skipped() {
        assert!(decode(br#"{"type":"ping"}"#).unwrap().is_none());
    }
}
