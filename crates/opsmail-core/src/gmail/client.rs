use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::gmail::{
    mime_builder::{MAX_ATTACHMENT_BYTES, MailEnvelope, MimeBuildError},
    oauth::{
        DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, TOKEN_ENDPOINT, TokenStore,
        refresh_access_token_with_endpoint,
    },
    types::{
        ApiErrorResponse, AttachmentBody, ListHistoryResponse, ListThreadsResponse, Message, MessageId, Profile,
        SendMessageRequest, Thread, WatchRequest, WatchResponse,
    },
};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";
pub const REFRESH_FAILED_REASON: &str = "Token refresh failed. Please reconnect.";
pub const WATCH_LABELS: [&str; 2] = ["INBOX", "SENT"];

/// 403 reasons that mean "slow down" rather than "not allowed".
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

/// Builds the shared HTTP client with connect and per-request timeouts.
pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("mailbox authorization expired: {0}")]
    AuthExpired(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("history cursor is no longer valid: {0}")]
    InvalidCursor(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token persistence error: {0}")]
    TokenStore(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("attachment {filename} is {size} bytes, limit is {MAX_ATTACHMENT_BYTES}")]
    AttachmentTooLarge { filename: String, size: usize },
    #[error("invalid message: {0}")]
    Validation(String),
}

impl From<MimeBuildError> for GmailClientError {
    fn from(err: MimeBuildError) -> Self {
        match err {
            MimeBuildError::AttachmentTooLarge { filename, size } => {
                GmailClientError::AttachmentTooLarge { filename, size }
            }
            other => GmailClientError::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource or cursor is gone; callers resync or skip.
    NotFound,
    Transient,
    Auth,
    Permanent,
}

impl GmailClientError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            GmailClientError::AuthExpired(_) => ErrorClass::Auth,
            GmailClientError::NotFound(_) | GmailClientError::InvalidCursor(_) => {
                ErrorClass::NotFound
            }
            GmailClientError::Status { status, body } => match *status {
                403 if is_rate_limited(body) => ErrorClass::Transient,
                408 | 429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            GmailClientError::Http(_)
            | GmailClientError::OAuth(_)
            | GmailClientError::TokenStore(_) => ErrorClass::Transient,
            GmailClientError::Decode(_)
            | GmailClientError::AttachmentTooLarge { .. }
            | GmailClientError::Validation(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GmailClientError::NotFound(_))
    }
}

fn is_rate_limited(body: &str) -> bool {
    serde_json::from_str::<ApiErrorResponse>(body)
        .map(|parsed| {
            parsed.error.errors.iter().any(|item| {
                item.reason
                    .as_deref()
                    .is_some_and(|reason| RATE_LIMIT_REASONS.contains(&reason))
            })
        })
        .unwrap_or(false)
}

pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_endpoint: String,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    revoked: AtomicBool,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        initial_tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            tokens: RwLock::new(initial_tokens),
            refresh_lock: Mutex::new(()),
            revoked: AtomicBool::new(false),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.user_id, suffix)
    }

    /// Mailbox address and the current history cursor.
    pub async fn get_profile(&self) -> Result<Profile, GmailClientError> {
        let url = self.url("profile");
        self.send_json(|| self.http.get(&url)).await
    }

    pub async fn list_threads(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListThreadsResponse, GmailClientError> {
        let url = self.url("threads");
        self.send_json(|| {
            let mut builder = self.http.get(&url);
            if let Some(q) = query {
                builder = builder.query(&[("q", q)]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Thread, GmailClientError> {
        let url = self.url(&format!("threads/{thread_id}"));
        self.send_json(|| self.http.get(&url).query(&[("format", "full")]))
            .await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = self.url(&format!("messages/{message_id}"));
        self.send_json(|| self.http.get(&url).query(&[("format", "full")]))
            .await
    }

    /// History since `start_history_id`. A cursor the provider no longer
    /// knows is reported as `InvalidCursor`.
    pub async fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<ListHistoryResponse, GmailClientError> {
        let url = self.url("history");
        let result = self
            .send_json(|| {
                let mut builder = self.http.get(&url).query(&[
                    ("startHistoryId", start_history_id),
                    ("historyTypes", "messageAdded"),
                ]);
                if let Some(token) = page_token {
                    builder = builder.query(&[("pageToken", token)]);
                }
                builder
            })
            .await;

        match result {
            Err(GmailClientError::NotFound(body)) => Err(GmailClientError::InvalidCursor(body)),
            other => other,
        }
    }

    /// Validates and encodes the envelope before touching the network.
    pub async fn send_message(
        &self,
        envelope: &MailEnvelope,
        thread_id: Option<&str>,
    ) -> Result<MessageId, GmailClientError> {
        let request = SendMessageRequest {
            raw: envelope.to_base64_url()?,
            thread_id: thread_id.map(str::to_string),
        };
        let url = self.url("messages/send");
        self.send_json(|| self.http.post(&url).json(&request)).await
    }

    pub async fn watch(&self, topic_name: &str) -> Result<WatchResponse, GmailClientError> {
        let request = WatchRequest {
            topic_name: topic_name.to_string(),
            label_ids: WATCH_LABELS.iter().map(|label| label.to_string()).collect(),
            label_filter_behavior: "include".to_string(),
        };
        let url = self.url("watch");
        self.send_json(|| self.http.post(&url).json(&request)).await
    }

    pub async fn stop(&self) -> Result<(), GmailClientError> {
        let url = self.url("stop");
        self.perform_authenticated(|| self.http.post(&url)).await?;
        Ok(())
    }

    pub async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, GmailClientError> {
        let url = self.url(&format!("messages/{message_id}/attachments/{attachment_id}"));
        self.send_json(|| self.http.get(&url)).await
    }

    async fn send_json<T, B>(&self, build: B) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(GmailClientError::Decode)
    }

    async fn perform_authenticated<B>(
        &self,
        build: B,
    ) -> Result<reqwest::Response, GmailClientError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        if self.is_revoked() {
            return Err(GmailClientError::AuthExpired(
                REFRESH_FAILED_REASON.to_string(),
            ));
        }

        let tokens = self.ensure_fresh_token(false).await?;
        let mut response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("provider rejected access token, forcing refresh");
            let tokens = self.ensure_fresh_token(true).await?;
            response = build().bearer_auth(&tokens.access_token).send().await?;
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::AuthExpired(
                "provider rejected a freshly refreshed token".to_string(),
            ));
        }
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(GmailClientError::NotFound(body))
        } else {
            Err(GmailClientError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn ensure_fresh_token(
        &self,
        force_refresh: bool,
    ) -> Result<OAuthTokens, GmailClientError> {
        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        if self.is_revoked() {
            return Err(GmailClientError::AuthExpired(
                REFRESH_FAILED_REASON.to_string(),
            ));
        }

        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let current = { self.tokens.read().await.clone() };
        let refreshed = match refresh_access_token_with_endpoint(
            &self.http,
            &self.client_id,
            &self.client_secret,
            &current,
            &self.token_endpoint,
        )
        .await
        {
            Ok(refreshed) => refreshed,
            Err(err) if err.is_revocation() => {
                warn!(error = %err, "token refresh rejected, marking mailbox disconnected");
                self.revoked.store(true, Ordering::Release);
                self.token_store
                    .mark_revoked(REFRESH_FAILED_REASON)
                    .await
                    .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;
                return Err(GmailClientError::AuthExpired(
                    REFRESH_FAILED_REASON.to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        {
            let mut tokens = self.tokens.write().await;
            *tokens = refreshed.clone();
        }

        self.token_store
            .save_tokens(&refreshed)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;

        Ok(refreshed)
    }
}
