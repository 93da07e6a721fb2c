//! Automation endpoints:
//! - GET/PUT /automations/settings
//! - GET  /automations/logs
//! - GET  /automations/stats
//! - POST /automations/events - fire a trigger for a domain event
//! - PUT  /inventory/{item_id}/quantity

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post, put},
};
use serde::Deserialize;

use opsmail_core::automation::{
    AutomationLogEntry, AutomationSettings, AutomationStats, DispatchResult, InventoryUpdate,
    LogFilter, RuleUpdate, TriggerEvent, TriggerKind,
};

use super::{ApiError, CurrentActor};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/automations/settings", get(get_settings).put(update_settings))
        .route("/automations/logs", get(list_logs))
        .route("/automations/stats", get(stats))
        .route("/automations/events", post(fire_event))
        .route("/inventory/{item_id}/quantity", put(set_quantity))
}

async fn get_settings(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
) -> Result<Json<AutomationSettings>, ApiError> {
    let dispatcher = state.mailbox.dispatcher();
    Ok(Json(dispatcher.rules().get(&tenant_id).await?))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(actor): CurrentActor,
    Json(updates): Json<BTreeMap<TriggerKind, RuleUpdate>>,
) -> Result<Json<AutomationSettings>, ApiError> {
    if !actor.is_owner() {
        return Err(ApiError::forbidden("only the tenant owner may change automations"));
    }
    let dispatcher = state.mailbox.dispatcher();
    Ok(Json(dispatcher.rules().update(&tenant_id, updates).await?))
}

async fn list_logs(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
    Query(filter): Query<LogFilter>,
) -> Result<Json<Vec<AutomationLogEntry>>, ApiError> {
    Ok(Json(state.mailbox.dispatcher().logs(&tenant_id, &filter).await?))
}

async fn stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
) -> Result<Json<AutomationStats>, ApiError> {
    Ok(Json(state.mailbox.dispatcher().stats(&tenant_id).await?))
}

async fn fire_event(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    CurrentActor(_actor): CurrentActor,
    Json(event): Json<TriggerEvent>,
) -> Result<Json<DispatchResult>, ApiError> {
    Ok(Json(state.mailbox.dispatcher().fire(&tenant_id, &event).await?))
}

#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    #[serde(alias = "stock")]
    pub quantity: i64,
}

async fn set_quantity(
    State(state): State<AppState>,
    Path((tenant_id, item_id)): Path<(String, String)>,
    CurrentActor(_actor): CurrentActor,
    Json(request): Json<QuantityRequest>,
) -> Result<Json<InventoryUpdate>, ApiError> {
    if request.quantity < 0 {
        return Err(ApiError::bad_request("quantity cannot be negative"));
    }
    Ok(Json(
        state
            .mailbox
            .dispatcher()
            .record_inventory_level(&tenant_id, &item_id, request.quantity)
            .await?,
    ))
}
