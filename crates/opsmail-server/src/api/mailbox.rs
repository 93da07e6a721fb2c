//! Mailbox endpoints:
//! - GET  /mailbox/connect - consent URL
//! - POST /mailbox/disconnect
//! - POST /mailbox/sync - inline sync pass
//! - GET  /mailbox/status
//! - GET  /mailbox/attachments/{message_id}/{attachment_id}
//!
//! The OAuth callback and the push webhook are mounted outside the tenant
//! prefix by `main`.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use opsmail_core::mailbox::{MailboxStatus, PushEnvelope};

use super::{ApiError, CurrentActor};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mailbox/connect", get(connect))
        .route("/mailbox/disconnect", post(disconnect))
        .route("/mailbox/sync", post(sync_now))
        .route("/mailbox/status", get(status))
        .route(
            "/mailbox/attachments/{message_id}/{attachment_id}",
            get(download_attachment),
        )
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub return_to: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub auth_url: String,
}

async fn connect(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
    Query(query): Query<ConnectQuery>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let return_to = query.return_to.filter(|path| is_local_path(path));
    let auth_url = state.mailbox.connect(&tenant_id, return_to).await?;
    Ok(Json(ConnectResponse { auth_url }))
}

async fn disconnect(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(actor): CurrentActor,
) -> Result<Json<MailboxStatus>, ApiError> {
    info!(tenant_id = %tenant_id, actor = %actor, "disconnecting mailbox");
    Ok(Json(state.mailbox.disconnect(&tenant_id).await?))
}

async fn sync_now(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
) -> Result<Json<MailboxStatus>, ApiError> {
    Ok(Json(state.mailbox.sync_now(&tenant_id).await?))
}

async fn status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
) -> Result<Json<MailboxStatus>, ApiError> {
    Ok(Json(state.mailbox.status(&tenant_id).await?))
}

async fn download_attachment(
    State(state): State<AppState>,
    Path((tenant_id, message_id, attachment_id)): Path<(String, String, String)>,
    CurrentActor(_actor): CurrentActor,
) -> Result<Response, ApiError> {
    let download = state
        .mailbox
        .download_attachment(&tenant_id, &message_id, &attachment_id)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        download.data,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /api/mailbox/callback
///
/// Finishes the consent flow and sends the browser back to the dashboard.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let client_url = state.links.client_url.trim_end_matches('/').to_string();
    let (code, connect_state) = match (query.code, query.state, query.error) {
        (_, _, Some(error)) => {
            warn!(error = %error, "consent was not granted");
            return Redirect::to(&format!("{client_url}/settings?mailbox=denied"));
        }
        (Some(code), Some(connect_state), None) => (code, connect_state),
        _ => return Redirect::to(&format!("{client_url}/settings?mailbox=error")),
    };

    match state.mailbox.handle_callback(&code, &connect_state).await {
        Ok(outcome) => {
            let path = outcome
                .return_to
                .filter(|path| is_local_path(path))
                .unwrap_or_else(|| "/settings".to_string());
            let separator = if path.contains('?') { '&' } else { '?' };
            Redirect::to(&format!("{client_url}{path}{separator}mailbox=connected"))
        }
        Err(err) => {
            warn!(error = %err, "mailbox connection failed");
            Redirect::to(&format!("{client_url}/settings?mailbox=error"))
        }
    }
}

/// POST /webhooks/gmail
///
/// Always answers 204 at once; the sync is queued in the background.
pub async fn push_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    tokio::spawn(async move {
        let envelope: PushEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "malformed push body dropped");
                return;
            }
        };
        match state.mailbox.enqueue_push(&envelope).await {
            Ok(Some(job_id)) => info!(job_id = %job_id, "push queued mailbox sync"),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "push dropped"),
        }
    });
    StatusCode::NO_CONTENT
}

/// Only same-origin paths are accepted as redirect targets.
fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_paths_must_stay_on_the_dashboard() {
        assert!(is_local_path("/settings/integrations"));
        assert!(!is_local_path("//evil.test/phish"));
        assert!(!is_local_path("https://evil.test"));
        assert!(!is_local_path("settings"));
    }
}
