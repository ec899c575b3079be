use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{json_body, LimitQuery};
use crate::control::{Objective, ObjectiveMode};
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::TelemetryRecord;

const HISTORY_DEFAULT_LIMIT: usize = 100;
const HISTORY_MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectiveRequest {
    mode: String,
    #[serde(default)]
    target_soc: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ObjectiveResponse {
    status: &'static str,
    mode: &'static str,
    target_soc: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ClearedResponse {
    status: &'static str,
    message: &'static str,
    removed: bool,
}

async fn set_objective(
    State(state): State<AppState>,
    Path((endpoint_id, battery_index)): Path<(String, u32)>,
    body: Result<Json<ObjectiveRequest>, JsonRejection>,
) -> AppResult<Json<ObjectiveResponse>> {
    state.endpoint(&endpoint_id)?;
    let request = json_body(body)?;
    let mode = ObjectiveMode::from_parts(&request.mode, request.target_soc)?;

    state
        .store
        .upsert_objective(&Objective::new(endpoint_id.clone(), battery_index, mode))?;
    tracing::info!(
        endpoint = %endpoint_id,
        battery = battery_index,
        mode = mode.as_str(),
        target_soc = ?mode.target_soc(),
        "objective set"
    );
    Ok(Json(ObjectiveResponse {
        status: "ok",
        mode: mode.as_str(),
        target_soc: mode.target_soc(),
    }))
}

async fn clear_objective(
    State(state): State<AppState>,
    Path((endpoint_id, battery_index)): Path<(String, u32)>,
) -> AppResult<Json<ClearedResponse>> {
    let endpoint = state.endpoint(&endpoint_id)?;
    if let Err(err) = state.commands.clear(endpoint, battery_index).await {
        tracing::error!(
            endpoint = %endpoint_id,
            battery = battery_index,
            error = %err,
            "device clear failed; removing objective anyway"
        );
    }
    let removed = state.store.delete_objective(&endpoint_id, battery_index)?;
    Ok(Json(ClearedResponse {
        status: "ok",
        message: "objective cleared on device and removed from store",
        removed,
    }))
}

async fn history(
    State(state): State<AppState>,
    Path((endpoint_id, battery_index)): Path<(String, u32)>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<TelemetryRecord>>> {
    let limit = query.resolve(HISTORY_DEFAULT_LIMIT, HISTORY_MAX_LIMIT);
    Ok(Json(state.store.telemetry_history(&endpoint_id, battery_index, limit)?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/batteries/{endpoint}/{index}/objective",
            post(set_objective).delete(clear_objective),
        )
        .route("/batteries/{endpoint}/{index}/history", get(history))
}
