use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::json_body;
use crate::error::{AppError, AppResult, ValidationError};
use crate::state::AppState;
use crate::store::ControlParams;

#[derive(Debug, Deserialize)]
pub(crate) struct ControlParamsRequest {
    alpha: f64,
    beta: f64,
    gamma: f64,
    #[serde(default)]
    price: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ControlParamsResponse {
    status: &'static str,
    pushed: bool,
    #[serde(flatten)]
    params: ControlParams,
}

impl ControlParamsRequest {
    fn into_params(self, endpoint_id: String, default_price: f64) -> Result<ControlParams, ValidationError> {
        let price = self.price.unwrap_or(default_price);
        for (name, value) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
            ("price", price),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::new(format!("{name} must be a finite number")));
            }
        }
        Ok(ControlParams {
            endpoint_id,
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
            price,
            updated_at: Utc::now(),
        })
    }
}

async fn get_control_params(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
) -> AppResult<Json<ControlParams>> {
    state
        .store
        .control_params(&endpoint_id)?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no control params for {endpoint_id}")))
}

async fn set_control_params(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    body: Result<Json<ControlParamsRequest>, JsonRejection>,
) -> AppResult<Json<ControlParamsResponse>> {
    let endpoint = state.endpoint(&endpoint_id)?;
    let params = json_body(body)?.into_params(endpoint_id.clone(), state.default_price)?;

    state.store.upsert_control_params(&params)?;
    let pushed = match state.commands.push_control_params(endpoint, &params).await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(endpoint = %endpoint_id, error = %err, "control params stored but not delivered");
            false
        }
    };
    tracing::info!(
        endpoint = %endpoint_id,
        alpha = params.alpha,
        beta = params.beta,
        gamma = params.gamma,
        price = params.price,
        pushed,
        "control params updated"
    );
    Ok(Json(ControlParamsResponse {
        status: "ok",
        pushed,
        params,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/endpoints/{endpoint}/control_params",
        get(get_control_params).post(set_control_params),
    )
}
