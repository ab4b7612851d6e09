//! Peer-channel frames
//!
//! Two shapes are valid on the channel: a data chunk `{iv, cipher}` with
//! base64 fields, and the terminal `{done: true}` marker.

use serde::{Deserialize, Serialize};

use crate::{IV_SIZE, ProtocolError, ProtocolResult};

/// One encrypted chunk: nonce plus AEAD ciphertext (tag included)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedChunk {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(rename = "cipher", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedChunk {
    /// The nonce as a fixed-size array
    pub fn iv_array(&self) -> ProtocolResult<[u8; IV_SIZE]> {
        self.iv.as_slice().try_into().map_err(|_| {
            ProtocolError::InvalidFrame(format!(
                "iv must be {} bytes, got {}",
                IV_SIZE,
                self.iv.len()
            ))
        })
    }
}

/// Message carried on the peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Chunk(EncryptedChunk),
    Done,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Chunk(EncryptedChunk),
    Done(DoneFrame),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DoneFrame {
    done: bool,
}

impl ChannelMessage {
    /// Serialize to the JSON text sent on the channel
    pub fn to_json(&self) -> ProtocolResult<String> {
        match self {
            Self::Chunk(chunk) => Ok(serde_json::to_string(chunk)?),
            Self::Done => Ok(serde_json::json!({ "done": true }).to_string()),
        }
    }

    /// Parse a frame received from the channel
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        let frame: WireFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;

        match frame {
            WireFrame::Chunk(chunk) => {
                chunk.iv_array()?;
                Ok(Self::Chunk(chunk))
            }
            WireFrame::Done(DoneFrame { done: true }) => Ok(Self::Done),
            WireFrame::Done(DoneFrame { done: false }) => Err(ProtocolError::InvalidFrame(
                "done marker must be true".to_string(),
            )),
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
