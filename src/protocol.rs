use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CableError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Message,
}

#[derive(Debug, Clone, Serialize)]
pub struct CableCommand {
    pub command: CommandKind,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl CableCommand {
    pub fn subscribe(identifier: &str) -> Self {
        Self {
            command: CommandKind::Subscribe,
            identifier: identifier.to_owned(),
            data: None,
        }
    }

    pub fn unsubscribe(identifier: &str) -> Self {
        Self {
            command: CommandKind::Unsubscribe,
            identifier: identifier.to_owned(),
            data: None,
        }
    }

    pub fn perform(identifier: &str, action: &str, payload: Value) -> Result<Self> {
        let mut data = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(CableError::InvalidPayload(format!(
                    "perform payload must be an object, got {other}"
                )))
            }
        };
        data.insert("action".to_owned(), Value::String(action.to_owned()));
        Ok(Self {
            command: CommandKind::Message,
            identifier: identifier.to_owned(),
            data: Some(serde_json::to_string(&Value::Object(data))?),
        })
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    reconnect: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Welcome,
    Ping,
    Confirm { identifier: String },
    Reject { identifier: String },
    Disconnect {
        reason: Option<String>,
        reconnect: bool,
    },
    Message { identifier: String, body: Value },
    Unknown(String),
}

pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text)?;
    Ok(frame_from_raw(raw))
}

pub(crate) fn frame_from_raw(raw: RawFrame) -> InboundFrame {
    match raw.kind.as_deref() {
        Some("welcome") => InboundFrame::Welcome,
        Some("ping") => InboundFrame::Ping,
        Some("confirm_subscription") => InboundFrame::Confirm {
            identifier: raw.identifier.unwrap_or_default(),
        },
        Some("reject_subscription") => InboundFrame::Reject {
            identifier: raw.identifier.unwrap_or_default(),
        },
        Some("disconnect") => InboundFrame::Disconnect {
            reason: raw.reason,
            reconnect: raw.reconnect.unwrap_or(false),
        },
        Some(other) if !other.is_empty() => InboundFrame::Unknown(other.to_owned()),
        _ => match (raw.identifier, raw.message) {
            (Some(identifier), Some(body)) => InboundFrame::Message { identifier, body },
            _ => InboundFrame::Unknown("untyped".to_owned()),
        },
    }
}

/// Keys are emitted in sorted order.
pub fn channel_identifier(name: &str, params: &Map<String, Value>) -> String {
    let mut identifier = params.clone();
    identifier.insert("channel".to_owned(), Value::String(name.to_owned()));
    Value::Object(identifier).to_string()
}

pub fn canonical_identifier(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value.to_string(),
        _ => raw.to_owned(),
    }
}
