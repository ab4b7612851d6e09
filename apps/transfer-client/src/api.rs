//! Validation-plane client (`/api/create-session`, `/api/check-session`)

use async_trait::async_trait;
use shared_protocol::{
    CheckSessionRequest, CheckSessionResponse, CreateSessionResponse, ErrorResponse, FileMeta,
};
use tracing::debug;

use crate::{ClientError, ClientResult};

#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Register a new session for `file_meta`
    async fn create_session(&self, file_meta: &FileMeta) -> ClientResult<CreateSessionResponse>;

    /// Stateless validity check of a code
    async fn check_session(&self, code: &str) -> ClientResult<CheckSessionResponse>;
}

/// [`SessionApi`] over HTTP
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, file_meta: &FileMeta) -> ClientResult<CreateSessionResponse> {
        let response = self
            .client
            .post(self.url("create-session"))
            .json(file_meta)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(ClientError::Api(message));
        }

        let created: CreateSessionResponse = response.json().await?;
        debug!("Created session {}", created.code);
        Ok(created)
    }

    async fn check_session(&self, code: &str) -> ClientResult<CheckSessionResponse> {
        let response = self
            .client
            .post(self.url("check-session"))
            .json(&CheckSessionRequest {
                code: code.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}
