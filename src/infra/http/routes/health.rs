use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::broker::BrokerClient;
use crate::infra::db::PostgresRepositories;
use crate::infra::http::db_health_response;

#[derive(Clone)]
pub struct HealthState {
    pub service: &'static str,
    pub broker: Arc<BrokerClient>,
    pub db: Option<Arc<PostgresRepositories>>,
}

pub(in crate::infra::http) fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<HealthState>) -> Response {
    if let Some(db) = state.db.as_ref() {
        let result = db.health_check().await;
        if result.is_err() {
            return db_health_response(result);
        }
    }

    Json(json!({
        "success": true,
        "service": state.service,
        "broker": state.broker.is_connected().await,
    }))
    .into_response()
}
