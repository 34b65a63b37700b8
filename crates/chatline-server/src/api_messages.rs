//! Authenticated HTTP endpoints over stored conversations.

use crate::auth::{caller_id, AuthContext};
use crate::AppState;
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::Json,
};
use chatline_messages::{list_friends_with_last_message, list_history, RepositoryError};
use chatline_types::{FriendSummary, HistoryEntry, UserId};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct FriendChatParams {
    pub user_id: Option<String>,
}

fn repository_err_to_status(e: RepositoryError) -> StatusCode {
    tracing::error!(error = %e, "message query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /api/messages/friends
///
/// Everyone the caller has exchanged messages with, each with the latest
/// message of the conversation, newest first.
pub async fn friends_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
) -> Result<Json<Vec<FriendSummary>>, StatusCode> {
    let user_id = caller_id(ctx)?;

    let friends = tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to get db connection for friends");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        list_friends_with_last_message(&conn, user_id).map_err(repository_err_to_status)
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "friends task join error");
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok(Json(friends))
}

/// GET /api/messages/friend/chats?user_id=<peer>
///
/// Conversation between the caller and `user_id`, most recent first.
pub async fn history_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
    Query(params): Query<FriendChatParams>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let user_id = caller_id(ctx)?;
    let peer_id: UserId = params
        .user_id
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let history = tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to get db connection for history");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        list_history(&conn, user_id, peer_id).map_err(repository_err_to_status)
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "history task join error");
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok(Json(history))
}
