//! JSON frames exchanged with the controller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Terminal data value closing a request's stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame of type {kind} lacks field {field}")]
    MissingField { kind: String, field: &'static str },
}

/// File attached to a work item; `data` is base64 without a data-URL prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileToUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: String,
}

/// Unit of work pushed by the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkItem {
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub files_to_upload: Vec<FileToUpload>,
}

/// Every frame the controller may send.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ping { timestamp: Value },
    RefreshModels,
    ModelRegistryAck { count: u64 },
    ReconnectionAck { message: String, pending_request_ids: Vec<String> },
    RestorationAck { message: String, restored_count: u64 },
    AbortRequest { request_id: String },
    Work(WorkItem),
    Unknown(String),
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let Some(kind) = object.get("type").and_then(Value::as_str) else {
            if object.contains_key("request_id") {
                return Ok(InboundMessage::Work(serde_json::from_value(value)?));
            }
            return Ok(InboundMessage::Unknown(text.to_string()));
        };

        let message = match kind {
            "ping" => InboundMessage::Ping {
                timestamp: object.get("timestamp").cloned().unwrap_or(Value::Null),
            },
            "refresh_models" => InboundMessage::RefreshModels,
            "model_registry_ack" => InboundMessage::ModelRegistryAck {
                count: object.get("count").and_then(Value::as_u64).unwrap_or(0),
            },
            "reconnection_ack" => InboundMessage::ReconnectionAck {
                message: string_field(object, "message"),
                pending_request_ids: object
                    .get("pending_request_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "restoration_ack" => InboundMessage::RestorationAck {
                message: string_field(object, "message"),
                restored_count: object.get("restored_count").and_then(Value::as_u64).unwrap_or(0),
            },
            "abort_request" => InboundMessage::AbortRequest {
                request_id: object
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ProtocolError::MissingField {
                        kind: kind.to_string(),
                        field: "request_id",
                    })?,
            },
            other => InboundMessage::Unknown(other.to_string()),
        };
        Ok(message)
    }
}

fn string_field(object: &Map<String, Value>, field: &str) -> String {
    object
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Control frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    ReconnectionHandshake {
        pending_request_ids: Vec<String>,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    Pong {
        timestamp: Value,
    },
    ModelRegistry {
        models: Map<String, Value>,
    },
}

/// Payload of a data frame: one upstream line, the sentinel, or an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FrameData {
    Line(String),
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataFrame {
    pub request_id: String,
    pub data: FrameData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Control(ControlFrame),
    Data(DataFrame),
}

impl OutboundMessage {
    pub fn line(request_id: &str, line: impl Into<String>) -> Self {
        OutboundMessage::Data(DataFrame {
            request_id: request_id.to_string(),
            data: FrameData::Line(line.into()),
        })
    }

    pub fn done(request_id: &str) -> Self {
        Self::line(request_id, DONE_SENTINEL)
    }

    pub fn error(request_id: &str, message: impl Into<String>) -> Self {
        OutboundMessage::Data(DataFrame {
            request_id: request_id.to_string(),
            data: FrameData::Error {
                error: message.into(),
            },
        })
    }

    pub fn handshake(pending_request_ids: Vec<String>) -> Self {
        OutboundMessage::Control(ControlFrame::ReconnectionHandshake {
            pending_request_ids,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Request id of a data frame; `None` for control frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            OutboundMessage::Data(frame) => Some(&frame.request_id),
            OutboundMessage::Control(_) => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            OutboundMessage::Data(DataFrame { data: FrameData::Line(line), .. }) if line == DONE_SENTINEL
        )
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
