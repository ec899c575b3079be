pub mod alerts;
pub mod batteries;
pub mod endpoints;
pub mod health;
pub mod status;

use axum::extract::rejection::JsonRejection;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(status::router())
                .merge(batteries::router())
                .merge(endpoints::router())
                .merge(alerts::router()),
        )
        .with_state(state)
}

/// Turns body rejections into plain 400s.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    pub(crate) limit: Option<i64>,
}

impl LimitQuery {
    pub(crate) fn resolve(&self, default: usize, max: usize) -> usize {
        match self.limit {
            Some(limit) => limit.clamp(1, max as i64) as usize,
            None => default,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::status::StatusAggregator;
    use crate::test_support::{endpoint, Harness};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value as JsonValue;
    use std::sync::Arc;
    use tower::ServiceExt;

    pub(crate) fn app(harness: &Harness) -> Router {
        let status = Arc::new(StatusAggregator::new(harness.store.clone(), 64, 0.25));
        let state = AppState::new(
            harness.store.clone(),
            status,
            harness.commands.clone(),
            &[endpoint("ug1"), endpoint("ug2")],
            0.25,
        );
        router(state)
    }

    pub(crate) async fn call(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_defaulted_and_clamped() {
        assert_eq!(LimitQuery { limit: None }.resolve(100, 1000), 100);
        assert_eq!(LimitQuery { limit: Some(5000) }.resolve(100, 1000), 1000);
        assert_eq!(LimitQuery { limit: Some(-3) }.resolve(50, 1000), 1);
        assert_eq!(LimitQuery { limit: Some(20) }.resolve(50, 1000), 20);
    }
}
