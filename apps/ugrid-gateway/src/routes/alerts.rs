use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use super::LimitQuery;
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::AlertRecord;

const ALERTS_DEFAULT_LIMIT: usize = 50;
const ALERTS_MAX_LIMIT: usize = 1000;

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<AlertRecord>>> {
    let limit = query.resolve(ALERTS_DEFAULT_LIMIT, ALERTS_MAX_LIMIT);
    Ok(Json(state.store.recent_alerts(limit)?))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/alerts", get(list_alerts))
}

#[cfg(test)]
mod tests {
    use crate::alerts::{Alert, AlertLevel};
    use crate::routes::testing::{app, call};
    use crate::test_support::Harness;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn alerts_are_newest_first() {
        let harness = Harness::new();
        harness
            .store
            .insert_alert(&Alert::new(AlertLevel::Info, "first"))
            .unwrap();
        harness
            .store
            .insert_alert(
                &Alert::new(AlertLevel::Critical, "hot")
                    .for_battery("ug1", 3)
                    .with_payload(json!({"temperature_c": 61.0})),
            )
            .unwrap();

        let (status, body) = call(app(&harness), "GET", "/api/alerts?limit=5", None).await;

        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["level"], "critical");
        assert_eq!(rows[0]["battery_index"], 3);
        assert_eq!(rows[0]["payload"]["temperature_c"], 61.0);
        assert_eq!(rows[1]["message"], "first");
        assert!(rows[1]["endpoint_id"].is_null());
    }
}
