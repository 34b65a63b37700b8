//! Bearer token verification for the authenticated HTTP endpoints.

use crate::AppState;
use chatline_types::UserId;
use axum::{
    body::Body,
    extract::Extension,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// The only token type accepted on authenticated routes.
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims carried by an access token.
///
/// `user_id` is a string on the wire; handlers parse it into a `UserId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub token_type: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

/// Verified caller attached to the request extensions by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthContext(pub TokenClaims);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header is missing")]
    MissingToken,
    #[error("authorization header is not a bearer token")]
    MalformedHeader,
    #[error("invalid token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("expected an access token, got {0:?}")]
    WrongTokenType(String),
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Verifies HS256 access tokens against a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Decodes `token`, checks its signature and expiry, and requires
    /// `token_type == "access"`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = decode::<TokenClaims>(token, &self.key, &self.validation)
            .map_err(AuthError::InvalidToken)?
            .claims;

        if claims.token_type != ACCESS_TOKEN_TYPE {
            return Err(AuthError::WrongTokenType(claims.token_type));
        }
        Ok(claims)
    }
}

/// Signs `claims` with HS256.
pub fn issue_access_token(secret: &[u8], claims: &TokenClaims) -> Result<String, AuthError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(AuthError::Signing)
}

fn bearer_token(req: &Request<Body>) -> Result<&str, AuthError> {
    let value = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MalformedHeader)
}

/// Middleware that authenticates requests via `Authorization: Bearer <jwt>`
/// and inserts an [`AuthContext`] for downstream handlers.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let claims = match bearer_token(&req).and_then(|token| state.tokens.verify(token)) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(path = %req.uri().path(), "rejecting request: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    req.extensions_mut().insert(AuthContext(claims));
    Ok(next.run(req).await)
}

/// Claims of the authenticated caller, or 401 when the middleware did not
/// run.
pub(crate) fn caller_claims(
    ctx: Option<Extension<AuthContext>>,
) -> Result<TokenClaims, StatusCode> {
    ctx.map(|Extension(AuthContext(claims))| claims)
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// The caller's numeric identity. A `user_id` claim that is not a number is
/// 400.
pub(crate) fn caller_id(ctx: Option<Extension<AuthContext>>) -> Result<UserId, StatusCode> {
    let claims = caller_claims(ctx)?;
    claims.user_id.parse().map_err(|_| {
        tracing::warn!(user_id = %claims.user_id, "token user_id is not a number");
        StatusCode::BAD_REQUEST
    })
}
