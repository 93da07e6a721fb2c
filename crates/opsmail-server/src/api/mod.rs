//! HTTP API handlers for the tenant dashboard.
//!
//! Authentication happens upstream. The acting user arrives in the
//! `x-user-id` and `x-user-role` headers.

pub mod automations;
pub mod conversations;
pub mod mailbox;

use axum::{
    Json, Router,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use opsmail_core::access::{Actor, Role};
use opsmail_core::automation::{DeliveryError, DispatchError, SettingsError};
use opsmail_core::gmail::GmailClientError;
use opsmail_core::mailbox::{MailboxServiceError, SyncError};

use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Routes nested under `/api/tenants/{tenant_id}`.
pub fn tenant_router() -> Router<AppState> {
    Router::new()
        .merge(mailbox::router())
        .merge(conversations::router())
        .merge(automations::router())
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    message: String,
}

/// Error response with a JSON `{error, message}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth_expired", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "attachment_too_large", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "delivery_failed", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = self.error, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(ApiErrorBody {
                error: self.error.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<GmailClientError> for ApiError {
    fn from(err: GmailClientError) -> Self {
        match &err {
            GmailClientError::AuthExpired(_) => ApiError::unauthorized(err.to_string()),
            GmailClientError::NotFound(_) => ApiError::not_found(err.to_string()),
            GmailClientError::AttachmentTooLarge { .. } => ApiError::too_large(err.to_string()),
            GmailClientError::Validation(_) => ApiError::bad_request(err.to_string()),
            _ => ApiError::bad_gateway(err.to_string()),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match &err {
            DeliveryError::Validation(_) => ApiError::bad_request(err.to_string()),
            DeliveryError::AttachmentTooLarge { .. } => ApiError::too_large(err.to_string()),
            DeliveryError::AuthExpired(_) => ApiError::unauthorized(err.to_string()),
            _ => ApiError::bad_gateway(err.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        if err.is_not_found() {
            return ApiError::not_found(err.to_string());
        }
        match &err {
            DispatchError::Forbidden(_) => ApiError::forbidden(err.to_string()),
            DispatchError::Settings(
                SettingsError::NotConfigurable(_) | SettingsError::InvalidTemplate { .. },
            ) => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match &err {
            SettingsError::NotConfigurable(_) | SettingsError::InvalidTemplate { .. } => {
                ApiError::bad_request(err.to_string())
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<MailboxServiceError> for ApiError {
    fn from(err: MailboxServiceError) -> Self {
        if err.is_not_found() {
            return ApiError::not_found(err.to_string());
        }
        let message = err.to_string();
        match err {
            MailboxServiceError::Validation(_) => ApiError::bad_request(message),
            MailboxServiceError::NotConnected(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "not_connected", message)
            }
            MailboxServiceError::AuthExpired(_) | MailboxServiceError::Decryption(_) => {
                ApiError::unauthorized(message)
            }
            MailboxServiceError::OAuth(oauth) if oauth.is_revocation() => {
                ApiError::bad_request(message)
            }
            MailboxServiceError::OAuth(_) => ApiError::bad_gateway(message),
            MailboxServiceError::Provider(provider) => provider.into(),
            MailboxServiceError::Delivery(delivery) => delivery.into(),
            MailboxServiceError::Dispatch(dispatch) => dispatch.into(),
            MailboxServiceError::Sync(SyncError::Provider(provider)) => provider.into(),
            MailboxServiceError::Sync(SyncError::Timeout(_)) => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "sync_timeout", message)
            }
            _ => ApiError::internal(message),
        }
    }
}

/// The acting user, taken from the upstream identity headers.
#[derive(Debug, Clone)]
pub struct CurrentActor(pub Actor);

impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let user_id = header(USER_ID_HEADER).ok_or_else(|| {
            ApiError::new(StatusCode::UNAUTHORIZED, "unauthenticated", "missing x-user-id")
        })?;
        let role = header(USER_ROLE_HEADER)
            .as_deref()
            .and_then(Role::from_str)
            .ok_or_else(|| ApiError::bad_request("x-user-role must be owner or staff"))?;
        Ok(CurrentActor(Actor::new(user_id, role)))
    }
}
