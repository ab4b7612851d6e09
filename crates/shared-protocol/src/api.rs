//! HTTP validation-plane bodies

use serde::{Deserialize, Serialize};

use crate::{FileMeta, SessionCode};

/// `POST /api/create-session` request body
pub type CreateSessionRequest = FileMeta;

/// `POST /api/create-session` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub code: SessionCode,
    #[serde(rename = "fileMeta")]
    pub file_meta: FileMeta,
}

/// `POST /api/check-session` request body
///
/// The code stays a raw string so malformed input yields `ok: false` rather
/// than a decoding error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSessionRequest {
    pub code: String,
}

/// `POST /api/check-session` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSessionResponse {
    pub ok: bool,
    #[serde(rename = "fileMeta", default, skip_serializing_if = "Option::is_none")]
    pub file_meta: Option<FileMeta>,
    #[serde(rename = "expiresInSecs", default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

impl CheckSessionResponse {
    pub fn not_ok() -> Self {
        Self {
            ok: false,
            file_meta: None,
            expires_in_secs: None,
        }
    }
}

/// Body of a non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
