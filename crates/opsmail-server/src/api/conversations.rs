//! Conversation endpoints:
//! - POST /conversations/{conversation_id}/reply
//! - POST /conversations/{conversation_id}/resume (owner only)

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use opsmail_core::conversations::Conversation;
use opsmail_core::gmail::MimeAttachment;
use opsmail_core::messages::ConversationMessage;

use super::{ApiError, CurrentActor};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversations/{conversation_id}/reply", post(reply))
        .route("/conversations/{conversation_id}/resume", post(resume))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAttachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Standard base64.
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<ReplyAttachment>,
}

impl ReplyRequest {
    fn decode_attachments(self) -> Result<(String, Vec<MimeAttachment>), ApiError> {
        let attachments = self
            .attachments
            .into_iter()
            .map(|attachment| {
                let data = STANDARD.decode(attachment.data.trim()).map_err(|err| {
                    ApiError::bad_request(format!("attachment {}: {err}", attachment.filename))
                })?;
                Ok(MimeAttachment {
                    content_type: attachment
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    filename: attachment.filename,
                    data,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;
        Ok((self.body, attachments))
    }
}

async fn reply(
    State(state): State<AppState>,
    Path((tenant_id, conversation_id)): Path<(String, String)>,
    CurrentActor(actor): CurrentActor,
    Json(request): Json<ReplyRequest>,
) -> Result<Json<ConversationMessage>, ApiError> {
    let (body, attachments) = request.decode_attachments()?;
    let message = state
        .mailbox
        .send_reply(&tenant_id, &conversation_id, &body, attachments, &actor)
        .await?;
    Ok(Json(message))
}

async fn resume(
    State(state): State<AppState>,
    Path((tenant_id, conversation_id)): Path<(String, String)>,
    CurrentActor(actor): CurrentActor,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(
        state
            .mailbox
            .resume(&tenant_id, &conversation_id, &actor)
            .await?,
    ))
}
