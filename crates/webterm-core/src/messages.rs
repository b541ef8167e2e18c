//! JSON terminal messages exchanged with the browser.
//!
//! Wire format: one JSON object per frame,
//! `{"type": "data" | "resize" | "error", "payload": ...}` where the payload
//! is a string for `data`/`error` and `{"width": int, "height": int}` for
//! `resize`.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `type` tag of a terminal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Data,
    Resize,
    Error,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Data => "data",
            MsgType::Resize => "resize",
            MsgType::Error => "error",
        }
    }
}

/// A decoded terminal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Terminal bytes (browser keystrokes inbound, shell output outbound).
    Data(String),
    /// Terminal dimensions in character cells.
    Resize { width: u32, height: u32 },
    /// Human-readable error shown to the browser.
    Error(String),
    /// A well-formed message with a `type` this gateway does not handle.
    Unknown(String),
}

#[derive(Serialize)]
struct ResizePayload {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    payload: P,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    payload: Value,
}

impl Message {
    /// Decode a raw frame.
    ///
    /// Unknown types decode to [`Message::Unknown`]; a frame that is not a
    /// JSON object with a string `type`, or whose payload does not fit its
    /// type, is [`RelayError::InvalidMessage`].
    pub fn decode(frame: &[u8]) -> RelayResult<Self> {
        let envelope: InboundEnvelope = serde_json::from_slice(frame)
            .map_err(|e| RelayError::InvalidMessage(format!("malformed frame: {e}")))?;

        match envelope.msg_type.as_str() {
            "data" => Ok(Message::Data(payload_text(envelope.payload, "data")?)),
            "error" => Ok(Message::Error(payload_text(envelope.payload, "error")?)),
            "resize" => {
                let width = dimension(&envelope.payload, "width")?;
                let height = dimension(&envelope.payload, "height")?;
                Ok(Message::Resize { width, height })
            }
            _ => Ok(Message::Unknown(envelope.msg_type)),
        }
    }

    /// Encode into a JSON frame.
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        let frame = match self {
            Message::Data(text) => serde_json::to_vec(&OutboundEnvelope {
                msg_type: MsgType::Data.as_str(),
                payload: text,
            })?,
            Message::Error(text) => serde_json::to_vec(&OutboundEnvelope {
                msg_type: MsgType::Error.as_str(),
                payload: text,
            })?,
            Message::Resize { width, height } => serde_json::to_vec(&OutboundEnvelope {
                msg_type: MsgType::Resize.as_str(),
                payload: ResizePayload {
                    width: *width,
                    height: *height,
                },
            })?,
            Message::Unknown(tag) => {
                return Err(RelayError::InvalidMessage(format!(
                    "cannot encode unknown message type {tag:?}"
                )))
            }
        };
        Ok(frame)
    }

    /// The type tag, or `None` for [`Message::Unknown`].
    pub fn msg_type(&self) -> Option<MsgType> {
        match self {
            Message::Data(_) => Some(MsgType::Data),
            Message::Resize { .. } => Some(MsgType::Resize),
            Message::Error(_) => Some(MsgType::Error),
            Message::Unknown(_) => None,
        }
    }
}

fn payload_text(payload: Value, kind: &str) -> RelayResult<String> {
    match payload {
        Value::String(text) => Ok(text),
        other => Err(RelayError::InvalidMessage(format!(
            "{kind} payload must be a string, got {other}"
        ))),
    }
}

fn dimension(payload: &Value, field: &str) -> RelayResult<u32> {
    let value = payload
        .get(field)
        .ok_or_else(|| RelayError::InvalidMessage(format!("resize payload missing {field}")))?;
    value
        .as_u64()
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            RelayError::InvalidMessage(format!(
                "resize {field} must be a positive integer, got {value}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_data() {
        let msg = Message::decode(br#"{"type":"data","payload":"ls -la\n"}"#).unwrap();
        assert_eq!(msg, Message::Data("ls -la\n".into()));
    }

    #[test]
    fn decode_resize() {
        let msg =
            Message::decode(br#"{"type":"resize","payload":{"width":120,"height":40}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Resize {
                width: 120,
                height: 40
            }
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = Message::decode(br#"{"type":"ping","payload":null}"#).unwrap();
        assert_eq!(msg, Message::Unknown("ping".into()));
        assert_eq!(msg.msg_type(), None);
    }

    #[test]
    fn resize_rejects_missing_and_non_numeric_fields() {
        for frame in [
            r#"{"type":"resize","payload":{"width":120}}"#,
            r#"{"type":"resize","payload":{"width":"wide","height":40}}"#,
            r#"{"type":"resize","payload":{"width":0,"height":40}}"#,
            r#"{"type":"resize","payload":{"width":-3,"height":40}}"#,
            r#"{"type":"resize","payload":"120x40"}"#,
        ] {
            let err = Message::decode(frame.as_bytes()).unwrap_err();
            assert!(matches!(err, RelayError::InvalidMessage(_)), "{frame}");
        }
    }

    #[test]
    fn data_payload_must_be_text() {
        let err = Message::decode(br#"{"type":"data","payload":42}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
    }

    #[test]
    fn garbage_frame_is_invalid() {
        assert!(matches!(
            Message::decode(b"not json"),
            Err(RelayError::InvalidMessage(_))
        ));
        assert!(matches!(
            Message::decode(br#"{"payload":"x"}"#),
            Err(RelayError::InvalidMessage(_))
        ));
    }

    #[test]
    fn encode_matches_wire_shape() {
        let frame = Message::Data("hello\n".into()).encode().unwrap();
        assert_eq!(frame, br#"{"type":"data","payload":"hello\n"}"#.to_vec());

        let frame = Message::Resize {
            width: 80,
            height: 24,
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["type"], "resize");
        assert_eq!(value["payload"]["width"], 80);
        assert_eq!(value["payload"]["height"], 24);
    }

    #[test]
    fn unknown_cannot_be_encoded() {
        assert!(Message::Unknown("x".into()).encode().is_err());
    }
}
