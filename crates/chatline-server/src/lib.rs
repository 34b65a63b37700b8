//! Chatline server library logic.

pub mod api_messages;
pub mod api_users;
pub mod auth;
pub mod config;
pub mod registry;
pub mod router;
pub mod session;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, put},
    Extension, Json, Router,
};
use chatline_db::DbPool;
use chatline_messages::MessageStore;
use config::Config;
use registry::ConnectionRegistry;
use router::MessageRouter;
use serde_json::{json, Value};
use session::SessionContext;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Live connections, keyed by user id.
    pub registry: ConnectionRegistry,
    /// Persists and fans out messages from live connections.
    pub router: MessageRouter,
    /// Access token verification for the HTTP endpoints.
    pub tokens: auth::TokenVerifier,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Origins allowed by CORS; empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// Wires the registry and router around `store`.
    ///
    /// A zero `realtime.outbound_buffer` is raised to 1; per-connection queues
    /// cannot be unbuffered.
    pub fn new(pool: DbPool, store: Arc<dyn MessageStore>, config: &Config) -> Self {
        let registry = ConnectionRegistry::new();
        let outbound_buffer = config.realtime.outbound_buffer.max(1);
        if outbound_buffer != config.realtime.outbound_buffer {
            tracing::warn!(
                configured = config.realtime.outbound_buffer,
                using = outbound_buffer,
                "outbound buffer must hold at least one frame"
            );
        }
        Self {
            pool,
            router: MessageRouter::new(registry.clone(), store),
            registry,
            tokens: auth::TokenVerifier::new(config.auth.access_token_secret.as_bytes()),
            outbound_buffer,
            allowed_origins: config.cors.allowed_origins.clone(),
        }
    }

    pub(crate) fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            router: self.router.clone(),
            outbound_buffer: self.outbound_buffer,
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin: {}", e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(12 * 60 * 60))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/messages/friends", get(api_messages::friends_handler))
        .route(
            "/api/messages/friend/chats",
            get(api_messages::history_handler),
        )
        .route("/api/users", get(api_users::list_handler))
        .route("/api/users/search", get(api_users::search_handler))
        .route(
            "/api/users/{id}",
            put(api_users::update_handler)
                .get(api_users::get_handler)
                .delete(api_users::delete_handler),
        )
        .layer(axum::middleware::from_fn(auth::auth_middleware));

    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/api/messages/ws", get(session::ws_handler))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(Arc::new(state)))
}
