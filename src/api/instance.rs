//! Instance lifecycle endpoints for the agent console.

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::{InstanceStatus, InstanceUpdate};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/instance/connect", post(connect))
        .route("/instance/status", get(status))
        .route("/instance/disconnect", delete(disconnect))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    instance_name: Option<String>,
}

async fn connect(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    body: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = match body {
        Ok(Json(request)) => request,
        // No body at all is fine; a body that fails to parse is not.
        Err(JsonRejection::MissingJsonContentType(_)) => ConnectRequest::default(),
        Err(rejection) => return Err(ApiError::Validation(rejection.body_text())),
    };
    let requested_name = request
        .instance_name
        .filter(|name| !name.trim().is_empty());

    if state.config.deferred_connect {
        let outcome = state
            .reconciler
            .connect_deferred(user.account_id, requested_name)
            .await?;
        let code = if outcome.status == InstanceStatus::Initializing {
            StatusCode::ACCEPTED
        } else {
            StatusCode::OK
        };
        return Ok((
            code,
            Json(json!({
                "success": true,
                "status": outcome.status,
                "instanceName": outcome.instance_name,
                "instanceId": outcome.instance_id,
                "qrCode": outcome.qr_code,
                "message": outcome.message,
            })),
        ));
    }

    let outcome = state
        .reconciler
        .connect(user.account_id, requested_name)
        .await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "status": outcome.status,
            "instanceName": outcome.instance_name,
            "instanceId": outcome.instance_id,
            "qrCode": outcome.qr_code,
            "message": outcome.message,
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    instance_name: Option<String>,
}

async fn status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let name = query
        .instance_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("instanceName is required".into()))?;

    let instance = state
        .instances
        .get_by_name(&name)
        .await?
        .ok_or(ApiError::NotFound("instance"))?;
    if instance.account_id != user.account_id {
        return Err(ApiError::Permission);
    }

    // The remote state is advisory here: a provider hiccup must not turn a
    // status poll into an error, the local row is still the answer.
    let evolution_state = match state.provider.get_instance_status(&instance.name).await {
        Ok(remote) => Some(remote.as_str()),
        Err(e) => {
            warn!("Status check for {} failed: {}", instance.name, e);
            None
        }
    };

    Ok(Json(json!({
        "status": instance.status,
        "phoneNumber": instance.phone_number,
        "profilePicUrl": instance.profile_pic_url,
        "evolutionState": evolution_state,
        "qrCode": instance.qr_code,
    })))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .instances
        .get_by_account_id(user.account_id)
        .await?
        .ok_or(ApiError::NotFound("instance"))?;

    match state.provider.logout_instance(&instance.name).await {
        Ok(()) => {}
        // Already gone remotely still counts as logged out.
        Err(e) if e.is_not_found() => {
            warn!("Logout for {} found no remote instance", instance.name)
        }
        Err(e) => return Err(ApiError::Provider(e)),
    }

    state
        .instances
        .update(
            instance.id,
            InstanceUpdate {
                status: Some(InstanceStatus::Disconnected),
                qr_code: Some(None),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(json!({"success": true, "status": InstanceStatus::Disconnected})))
}
