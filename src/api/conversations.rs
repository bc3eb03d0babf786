//! Conversation endpoints for the agent console: listing, history, agent
//! replies, takeover and resolution. Everything is scoped to the caller's
//! account; reaching into another tenant's conversation is a 403.

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::{
    Conversation, ConversationFilter, ConversationStatus, ConversationUpdate, Instance,
    MessageStatus, NewMessage, SentBy,
};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", get(list))
        .route("/conversations/:id", get(detail))
        .route(
            "/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/:id/takeover", post(takeover))
        .route("/conversations/:id/resolve", post(resolve))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<String>,
    instance_name: Option<String>,
}

async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ConversationStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status {raw:?}")))
        })
        .transpose()?;

    let instance_id = match query.instance_name.as_deref() {
        Some(name) => {
            let instance = state
                .instances
                .get_by_name(name)
                .await?
                .ok_or(ApiError::NotFound("instance"))?;
            if instance.account_id != user.account_id {
                return Err(ApiError::Permission);
            }
            Some(instance.id)
        }
        None => None,
    };

    let conversations = state
        .conversations
        .list_conversations(ConversationFilter {
            account_id: Some(user.account_id),
            instance_id,
            status,
        })
        .await?;
    Ok(Json(json!({"conversations": conversations})))
}

async fn detail(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation, _) = authorize(&state, id, user.account_id).await?;
    let contact = state.conversations.get_contact(conversation.contact_id).await?;
    Ok(Json(json!({"conversation": conversation, "contact": contact})))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, id, user.account_id).await?;
    let messages = state.conversations.list_messages(id).await?;
    Ok(Json(json!({"messages": messages})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    #[serde(default)]
    message: String,
    media_url: Option<String>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.message.trim().is_empty() && body.media_url.is_none() {
        return Err(ApiError::Validation(
            "message or mediaUrl must be present".into(),
        ));
    }

    let (conversation, instance) = authorize(&state, id, user.account_id).await?;
    let contact = state
        .conversations
        .get_contact(conversation.contact_id)
        .await?
        .ok_or(ApiError::NotFound("contact"))?;

    match body.media_url.as_deref() {
        Some(media_url) => {
            let caption = Some(body.message.as_str()).filter(|m| !m.trim().is_empty());
            state
                .provider
                .send_media(&instance.name, &contact.phone_number, media_url, caption)
                .await?;
        }
        None => {
            state
                .provider
                .send_text_message(&instance.name, &contact.phone_number, &body.message)
                .await?;
        }
    }

    let now = Utc::now();
    let message = state
        .conversations
        .create_message(NewMessage {
            conversation_id: conversation.id,
            from_me: true,
            body: body.message,
            timestamp: now,
            status: MessageStatus::Sent,
            sent_by: SentBy::Agent,
            agent_id: Some(user.user_id),
        })
        .await?;
    state
        .conversations
        .update_conversation(
            conversation.id,
            ConversationUpdate {
                last_message_at: Some(now),
                ..Default::default()
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"message": message}))))
}

async fn takeover(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation, _) = authorize(&state, id, user.account_id).await?;
    state
        .conversations
        .update_conversation(
            conversation.id,
            ConversationUpdate {
                status: Some(ConversationStatus::InService),
                assigned_to: Some(Some(user.user_id)),
                transferred_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(json!({"success": true, "status": ConversationStatus::InService})))
}

async fn resolve(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation, _) = authorize(&state, id, user.account_id).await?;
    state
        .conversations
        .update_conversation(
            conversation.id,
            ConversationUpdate {
                status: Some(ConversationStatus::Resolved),
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(json!({"success": true, "status": ConversationStatus::Resolved})))
}

/// Load a conversation and its owning instance, rejecting cross-tenant
/// access. The tenant check reads the instance's account_id.
async fn authorize(
    state: &AppState,
    conversation_id: Uuid,
    account_id: Uuid,
) -> Result<(Conversation, Instance), ApiError> {
    let conversation = state
        .conversations
        .get_conversation(conversation_id)
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;
    let instance = state
        .instances
        .get_by_id(conversation.instance_id)
        .await?
        .ok_or(ApiError::NotFound("instance"))?;
    if instance.account_id != account_id {
        return Err(ApiError::Permission);
    }
    Ok((conversation, instance))
}
