//! Product catalog CRUD, account-scoped.

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::{NewProduct, Product, ProductUpdate};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/products", get(list).post(create))
        .route("/products/:id", get(detail).put(update).delete(remove))
}

async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let products = state.products.list_products(user.account_id).await?;
    Ok(Json(json!({"products": products})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProductRequest {
    name: String,
    description: Option<String>,
    price: f64,
    image_url: Option<String>,
}

async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    if body.price < 0.0 {
        return Err(ApiError::Validation("price must not be negative".into()));
    }

    let product = state
        .products
        .create_product(NewProduct {
            account_id: user.account_id,
            name: body.name,
            description: body.description,
            price: body.price,
            image_url: body.image_url,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"product": product}))))
}

async fn detail(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let product = authorize(&state, id, user.account_id).await?;
    Ok(Json(json!({"product": product})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProductRequest {
    name: Option<String>,
    description: Option<String>,
    price: Option<f64>,
    image_url: Option<String>,
}

async fn update(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProductRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, id, user.account_id).await?;
    if let Some(price) = body.price {
        if price < 0.0 {
            return Err(ApiError::Validation("price must not be negative".into()));
        }
    }

    state
        .products
        .update_product(
            id,
            ProductUpdate {
                name: body.name,
                description: body.description,
                price: body.price,
                image_url: body.image_url,
            },
        )
        .await?;
    Ok(Json(json!({"success": true})))
}

async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, id, user.account_id).await?;
    state.products.delete_product(id).await?;
    Ok(Json(json!({"success": true})))
}

async fn authorize(state: &AppState, id: Uuid, account_id: Uuid) -> Result<Product, ApiError> {
    let product = state
        .products
        .get_product(id)
        .await?
        .ok_or(ApiError::NotFound("product"))?;
    if product.account_id != account_id {
        return Err(ApiError::Permission);
    }
    Ok(product)
}
