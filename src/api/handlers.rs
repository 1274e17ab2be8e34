use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::models::token::{
    ApiTokenListItem, AuthContext, CreateApiTokenRequest, UpdateApiTokenRequest,
};
use crate::AppState;

// ── Query DTOs ───────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListTokensParams {
    pub kb_id: String,
}

#[derive(Deserialize)]
pub struct DeleteTokenParams {
    pub id: String,
    pub kb_id: String,
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/pro/v1/token/create
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateApiTokenRequest>,
) -> Result<(StatusCode, Json<ApiTokenListItem>), AppError> {
    let token = state.tokens.create(&auth, payload).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

/// GET /api/pro/v1/token/list?kb_id=
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<ListTokensParams>,
) -> Result<Json<Vec<ApiTokenListItem>>, AppError> {
    let tokens = state.tokens.list(&auth, &params.kb_id).await?;
    Ok(Json(tokens))
}

/// PATCH /api/pro/v1/token/update
pub async fn update_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<UpdateApiTokenRequest>,
) -> Result<Json<ApiTokenListItem>, AppError> {
    let token = state.tokens.update(&auth, payload).await?;
    Ok(Json(token))
}

/// DELETE /api/pro/v1/token/delete?id=&kb_id=
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<DeleteTokenParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.tokens.delete(&auth, &params.id, &params.kb_id).await?;
    Ok(Json(json!({ "id": params.id, "deleted": true })))
}
