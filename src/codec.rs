use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{CableError, Result};
use crate::protocol::{decode_frame, frame_from_raw, CableCommand, InboundFrame, RawFrame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    Msgpack,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Msgpack => "msgpack",
        }
    }

    pub fn encode(self, command: &CableCommand) -> Result<WsMessage> {
        match self {
            Self::Json => Ok(WsMessage::Text(serde_json::to_string(command)?)),
            Self::Msgpack => rmp_serde::to_vec_named(command)
                .map(WsMessage::Binary)
                .map_err(|err| CableError::Codec(format!("msgpack encode: {err}"))),
        }
    }

    pub fn decode_text(self, text: &str) -> Result<InboundFrame> {
        match self {
            Self::Json => decode_frame(text),
            Self::Msgpack => Err(CableError::Codec(format!(
                "unexpected {} byte text frame on a msgpack connection",
                text.len()
            ))),
        }
    }

    pub fn decode_binary(self, bytes: &[u8]) -> Result<InboundFrame> {
        match self {
            Self::Json => Err(CableError::Codec(format!(
                "unexpected {} byte binary frame on a json connection",
                bytes.len()
            ))),
            Self::Msgpack => {
                let raw: RawFrame = rmp_serde::from_slice(bytes)
                    .map_err(|err| CableError::Codec(format!("msgpack decode: {err}")))?;
                Ok(frame_from_raw(raw))
            }
        }
    }
}
