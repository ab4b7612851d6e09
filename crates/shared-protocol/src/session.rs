//! Session identity, participants and transfer state

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CODE_LENGTH, ProtocolError, ProtocolResult};

/// Six-digit numeric session code
///
/// Codes are drawn from `100000..=999999`, so the display form never has a
/// leading zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(u32);

impl SessionCode {
    /// Smallest valid code
    pub const MIN: u32 = 100_000;
    /// Largest valid code
    pub const MAX: u32 = 999_999;

    /// Build a code from its numeric value
    pub fn from_number(value: u32) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Parse user input, tolerating surrounding whitespace
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        let trimmed = input.trim();
        if trimmed.len() != CODE_LENGTH || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidCode(input.to_string()));
        }

        trimmed
            .parse::<u32>()
            .ok()
            .and_then(Self::from_number)
            .ok_or_else(|| ProtocolError::InvalidCode(input.to_string()))
    }

}

impl std::fmt::Display for SessionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl std::str::FromStr for SessionCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.to_string()
    }
}

/// File metadata supplied by the sender
///
/// The only session data the relay ever reads; names and sizes are not secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(rename = "fileName")]
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: content_type.into(),
        }
    }

    /// Check the metadata a sender submits when creating a session
    pub fn validate(&self, max_size: u64) -> ProtocolResult<()> {
        if self.name.trim().is_empty() {
            return Err(ProtocolError::MissingField("fileName"));
        }
        if self.size > max_size {
            return Err(ProtocolError::FileTooLarge {
                size: self.size,
                max: max_size,
            });
        }
        Ok(())
    }

    /// Content type to use when the sender did not provide one
    pub fn content_type_or_default(&self) -> &str {
        if self.content_type.is_empty() {
            "application/octet-stream"
        } else {
            &self.content_type
        }
    }
}

/// Role a participant claims when joining a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Creates the session and streams the file
    Sender,
    /// Enters the code and receives the file
    Receiver,
}

impl ParticipantRole {
    pub fn counterpart(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Opaque identifier of one relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-side transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Nothing in progress
    Idle,
    /// Session requested (sender) or code submitted (receiver)
    Waiting,
    /// Symmetric key derived
    Connected,
    /// Sender is streaming chunks
    Transferring,
    /// Receiver is accepting chunks
    Receiving,
    /// Transfer finished
    Completed,
    /// Terminal failure, needs a reset
    Error,
    /// Session lifetime elapsed
    Expired,
}

impl TransferState {
    /// Whether the state only leaves through an explicit reset
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_parse() {
        let code = SessionCode::parse(" 482913 ").unwrap();
        assert_eq!(Some(code), SessionCode::from_number(482913));
        assert_eq!(code.to_string(), "482913");

        assert!(SessionCode::parse("12345").is_err());
        assert!(SessionCode::parse("1234567").is_err());
        assert!(SessionCode::parse("12a456").is_err());
        assert!(SessionCode::parse("012345").is_err());
        assert!(SessionCode::parse("").is_err());
    }

    #[test]
    fn test_code_serde_as_string() {
        let code = SessionCode::from_number(700001).unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"700001\"");

        let parsed: SessionCode = serde_json::from_str("\"700001\"").unwrap();
        assert_eq!(parsed, code);
        assert!(serde_json::from_str::<SessionCode>("\"abc\"").is_err());
    }

    #[test]
    fn test_file_meta_wire_names() {
        let meta = FileMeta::new("report.pdf", 10, "application/pdf");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["fileName"], "report.pdf");
        assert_eq!(json["size"], 10);
        assert_eq!(json["type"], "application/pdf");
    }

    #[test]
    fn test_file_meta_validation() {
        assert!(FileMeta::new("a.bin", 10, "").validate(100).is_ok());
        assert!(matches!(
            FileMeta::new("  ", 10, "").validate(100),
            Err(ProtocolError::MissingField("fileName"))
        ));
        assert!(matches!(
            FileMeta::new("a.bin", 101, "").validate(100),
            Err(ProtocolError::FileTooLarge { size: 101, max: 100 })
        ));
        assert_eq!(
            FileMeta::new("a.bin", 1, "").content_type_or_default(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Error.is_terminal());
        assert!(TransferState::Expired.is_terminal());
        assert!(!TransferState::Receiving.is_terminal());
        assert!(!TransferState::Idle.is_terminal());
    }
}
