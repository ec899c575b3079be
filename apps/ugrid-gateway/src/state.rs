use crate::device::{CommandPort, Endpoint};
use crate::error::{AppError, AppResult};
use crate::status::StatusAggregator;
use crate::store::Store;
use axum::extract::FromRef;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub status: Arc<StatusAggregator>,
    pub commands: CommandPort,
    pub endpoints: Arc<BTreeMap<String, Endpoint>>,
    pub default_price: f64,
}

impl AppState {
    pub fn new(
        store: Store,
        status: Arc<StatusAggregator>,
        commands: CommandPort,
        endpoints: &[Endpoint],
        default_price: f64,
    ) -> Self {
        let endpoints = endpoints
            .iter()
            .map(|endpoint| (endpoint.id.clone(), endpoint.clone()))
            .collect();
        Self {
            store,
            status,
            commands,
            endpoints: Arc::new(endpoints),
            default_price,
        }
    }

    /// Configured endpoint or 404.
    pub fn endpoint(&self, id: &str) -> AppResult<&Endpoint> {
        self.endpoints
            .get(id)
            .ok_or_else(|| AppError::not_found(format!("unknown endpoint {id}")))
    }
}

impl FromRef<AppState> for Store {
    fn from_ref(state: &AppState) -> Store {
        state.store.clone()
    }
}
