//! Authenticated user directory: listing, lookup, search and self-service
//! profile edits.

use crate::auth::{caller_claims, caller_id, AuthContext};
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use chatline_messages::{
    delete_user, get_user, list_users, search_users, update_user, RepositoryError,
    UpdateUserParams,
};
use chatline_types::{UserId, UserProfile, UserSearchResult, LAST_SEEN_PLACEHOLDER};
use rusqlite::Connection;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

fn status_for(e: RepositoryError) -> StatusCode {
    match e {
        RepositoryError::NotFound(what) => {
            tracing::debug!(%what, "user directory lookup missed");
            StatusCode::NOT_FOUND
        }
        RepositoryError::Conflict(what) => {
            tracing::debug!(%what, "user directory write rejected");
            StatusCode::CONFLICT
        }
        RepositoryError::Database(e) => {
            tracing::error!(error = %e, "user directory query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Runs `op` on a pooled connection off the async runtime.
async fn with_conn<T, F>(state: Arc<AppState>, op: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = state.pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to get db connection for user directory");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        op(&conn).map_err(status_for)
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "user directory task join error");
        StatusCode::INTERNAL_SERVER_ERROR
    })?
}

/// Profile edits and deletion are limited to the caller's own account.
fn require_self(caller: UserId, target: UserId) -> Result<(), StatusCode> {
    if caller == target {
        Ok(())
    } else {
        tracing::warn!(caller, target, "refusing to modify another user's account");
        Err(StatusCode::FORBIDDEN)
    }
}

/// GET /api/users
pub async fn list_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
) -> Result<Json<Vec<UserProfile>>, StatusCode> {
    caller_claims(ctx)?;
    let users = with_conn(state, list_users).await?;
    Ok(Json(users.iter().map(|u| u.profile()).collect()))
}

/// GET /api/users/search?q=<text>
///
/// `@name` searches usernames only. The caller never appears in the results.
pub async fn search_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<UserSearchResult>>, StatusCode> {
    let caller = caller_claims(ctx)?.username;
    let users = with_conn(state, move |conn| search_users(conn, &caller, &params.q)).await?;

    Ok(Json(
        users
            .iter()
            .map(|u| UserSearchResult {
                profile: u.friend_profile(),
                last_seen: LAST_SEEN_PLACEHOLDER.to_string(),
            })
            .collect(),
    ))
}

/// GET /api/users/{id}
pub async fn get_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<UserId>,
) -> Result<Json<UserProfile>, StatusCode> {
    caller_claims(ctx)?;
    let user = with_conn(state, move |conn| get_user(conn, id)).await?;
    Ok(Json(user.profile()))
}

/// PUT /api/users/{id}
pub async fn update_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<UserId>,
    Json(params): Json<UpdateUserParams>,
) -> Result<Json<UserProfile>, StatusCode> {
    require_self(caller_id(ctx)?, id)?;
    let user = with_conn(state, move |conn| update_user(conn, id, &params)).await?;
    tracing::info!(user_id = id, "profile updated");
    Ok(Json(user.profile()))
}

/// DELETE /api/users/{id}
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<UserId>,
) -> Result<StatusCode, StatusCode> {
    require_self(caller_id(ctx)?, id)?;
    with_conn(state, move |conn| delete_user(conn, id)).await?;
    tracing::info!(user_id = id, "account deleted");
    Ok(StatusCode::NO_CONTENT)
}
