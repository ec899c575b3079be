use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::collections::BTreeMap;

use crate::error::AppResult;
use crate::state::AppState;
use crate::status::EndpointStatus;

async fn get_status(State(state): State<AppState>) -> AppResult<Json<BTreeMap<String, EndpointStatus>>> {
    Ok(Json(state.status.snapshot()?))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(get_status))
}
