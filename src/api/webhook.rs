//! Inbound provider webhook endpoint.

use crate::auth::verify_webhook_token;
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(receive))
}

/// Always answers `200 {success:true}` once authenticated: the provider
/// disables webhooks that keep failing, so ingestion errors stay internal.
async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    verify_webhook_token(&headers, state.config.webhook.secret.as_deref())?;

    if let Some(Json(payload)) = body {
        state.ingestor.ingest(payload).await;
    }

    Ok(Json(json!({"success": true})))
}
