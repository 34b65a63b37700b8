#![allow(dead_code)]

use chatline_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use chatline_messages::{
    create_user, find_user_by_username, CreateUserParams, PooledMessageStore, User,
};
use chatline_server::auth::{issue_access_token, TokenClaims};
use chatline_server::config::Config;
use chatline_server::registry::ConnectionRegistry;
use chatline_server::{app, AppState};
use chatline_types::UserId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const SECRET: &str = "integration-secret";

/// A database in a temporary directory with migrations applied.
pub struct TestDb {
    pub pool: DbPool,
    _dir: TempDir,
}

pub fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("chatline.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("failed to create pool");
    run_migrations(&pool.get().unwrap()).expect("failed to run migrations");
    TestDb { pool, _dir: dir }
}

/// Registers a user through the repository and returns the stored record,
/// as read back by username.
pub fn seed_user(pool: &DbPool, username: &str, first_name: &str) -> User {
    let conn = pool.get().unwrap();
    let created = create_user(
        &conn,
        &CreateUserParams {
            username: username.to_string(),
            first_name: first_name.to_string(),
            last_name: "Tester".to_string(),
            email: format!("{username}@example.com"),
            profile_image_url: format!("https://img.example/{username}.png"),
            password_hash: "not-a-real-hash".to_string(),
        },
    )
    .expect("failed to seed user");

    let stored = find_user_by_username(&conn, username).expect("seeded user should be findable");
    assert_eq!(stored, created);
    stored
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.access_token_secret = SECRET.to_string();
    config
}

pub fn test_state(pool: &DbPool) -> AppState {
    let store = Arc::new(PooledMessageStore::new(pool.clone()));
    AppState::new(pool.clone(), store, &test_config())
}

fn sign(claims: TokenClaims) -> String {
    issue_access_token(SECRET.as_bytes(), &claims).expect("failed to issue token")
}

/// A token with an arbitrary `user_id` claim.
pub fn token_for(user_id: &str, token_type: &str) -> String {
    sign(TokenClaims {
        user_id: user_id.to_string(),
        username: format!("user{user_id}"),
        email: format!("user{user_id}@example.com"),
        token_type: token_type.to_string(),
        exp: chrono::Utc::now().timestamp() + 600,
    })
}

/// An access token carrying `user`'s real claims.
pub fn access_token(user: &User) -> String {
    sign(TokenClaims {
        user_id: user.id.to_string(),
        username: user.username.clone(),
        email: user.email.clone(),
        token_type: "access".to_string(),
        exp: chrono::Utc::now().timestamp() + 600,
    })
}

/// A server listening on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub db: TestDb,
}

impl TestServer {
    pub fn ws_url(&self, user_id: impl std::fmt::Display) -> String {
        format!("ws://{}/api/messages/ws?user_id={}", self.addr, user_id)
    }

    /// Waits until `user_id` has a live registry entry.
    pub async fn wait_online(&self, user_id: UserId) {
        wait_until(|| self.registry.lookup(user_id).is_some()).await;
    }

    pub async fn wait_offline(&self, user_id: UserId) {
        wait_until(|| self.registry.lookup(user_id).is_none()).await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn start_server(db: TestDb) -> TestServer {
    let state = test_state(&db.pool);
    let registry = state.registry.clone();
    let app = app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, registry, db }
}
