mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chatline_messages::{create_message, get_user, CreateMessageParams, User};
use chatline_server::app;
use chatline_types::{UserProfile, UserSearchResult, LAST_SEEN_PLACEHOLDER};
use common::{access_token, seed_user, test_db, test_state, TestDb};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Directory {
    db: TestDb,
    router: Router,
    ada: User,
    grace: User,
    alan: User,
}

fn directory() -> Directory {
    let db = test_db();
    let ada = seed_user(&db.pool, "ada", "Ada");
    let grace = seed_user(&db.pool, "grace", "Grace");
    let alan = seed_user(&db.pool, "alan", "Alan");
    let router = app(test_state(&db.pool));
    Directory {
        db,
        router,
        ada,
        grace,
        alan,
    }
}

async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(json) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn directory_requires_a_token() {
    let dir = directory();
    for uri in [
        "/api/users".to_string(),
        "/api/users/search?q=a".to_string(),
        format!("/api/users/{}", dir.ada.id),
    ] {
        let (status, _) = call(&dir.router, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
    }
}

#[tokio::test]
async fn list_and_get_return_public_profiles() {
    let dir = directory();
    let token = access_token(&dir.ada);

    let (status, body) = call(&dir.router, Method::GET, "/api/users", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let users: Vec<UserProfile> = serde_json::from_slice(&body).unwrap();
    let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, vec!["ada", "grace", "alan"]);

    let raw: Value = serde_json::from_slice(&body).unwrap();
    assert!(raw[0].get("password").is_none());
    assert!(raw[0].get("password_hash").is_none());

    let uri = format!("/api/users/{}", dir.grace.id);
    let (status, body) = call(&dir.router, Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let grace: UserProfile = serde_json::from_slice(&body).unwrap();
    assert_eq!(grace, dir.grace.profile());
}

#[tokio::test]
async fn unknown_or_malformed_user_ids() {
    let dir = directory();
    let token = access_token(&dir.ada);

    let (status, _) = call(&dir.router, Method::GET, "/api/users/9999", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&dir.router, Method::GET, "/api/users/ada", Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_excludes_caller_and_reports_placeholder_last_seen() {
    let dir = directory();
    let token = access_token(&dir.ada);

    let (status, body) = call(
        &dir.router,
        Method::GET,
        "/api/users/search?q=a",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let hits: Vec<UserSearchResult> = serde_json::from_slice(&body).unwrap();
    let ids: Vec<u32> = hits.iter().map(|h| h.profile.id).collect();
    assert_eq!(ids, vec![dir.alan.id, dir.grace.id]);
    assert!(hits.iter().all(|h| h.last_seen == LAST_SEEN_PLACEHOLDER));
    assert_eq!(hits[0].profile.username, "alan");
    assert_eq!(hits[0].profile.first_name, "Alan");
}

#[tokio::test]
async fn search_by_handle_and_blank_query() {
    let dir = directory();
    let token = access_token(&dir.grace);

    let (_, body) = call(
        &dir.router,
        Method::GET,
        "/api/users/search?q=%40al",
        Some(&token),
        None,
    )
    .await;
    let hits: Vec<UserSearchResult> = serde_json::from_slice(&body).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].profile.id, dir.alan.id);

    for uri in ["/api/users/search", "/api/users/search?q="] {
        let (status, body) = call(&dir.router, Method::GET, uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, Value::Array(Vec::new()), "{uri}");
    }
}

#[tokio::test]
async fn owner_can_update_own_profile_only() {
    let dir = directory();
    let token = access_token(&dir.ada);

    let own = format!("/api/users/{}", dir.ada.id);
    let (status, body) = call(
        &dir.router,
        Method::PUT,
        &own,
        Some(&token),
        Some(json!({ "last_name": "King", "profile_image_url": "https://img.example/ak.png" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let updated: UserProfile = serde_json::from_slice(&body).unwrap();
    assert_eq!(updated.first_name, "Ada");
    assert_eq!(updated.last_name, "King");

    let stored = get_user(&dir.db.pool.get().unwrap(), dir.ada.id).unwrap();
    assert_eq!(stored.profile_image_url, "https://img.example/ak.png");

    let other = format!("/api/users/{}", dir.grace.id);
    let (status, _) = call(
        &dir.router,
        Method::PUT,
        &other,
        Some(&token),
        Some(json!({ "first_name": "Mallory" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let grace = get_user(&dir.db.pool.get().unwrap(), dir.grace.id).unwrap();
    assert_eq!(grace.first_name, "Grace");
}

#[tokio::test]
async fn delete_own_account() {
    let dir = directory();
    let token = access_token(&dir.alan);
    let uri = format!("/api/users/{}", dir.alan.id);

    let (status, _) = call(&dir.router, Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&dir.router, Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_is_refused_for_others_and_for_users_with_messages() {
    let dir = directory();
    create_message(
        &dir.db.pool.get().unwrap(),
        &CreateMessageParams {
            content: "hello".to_string(),
            sender_id: dir.ada.id,
            receiver_id: dir.grace.id,
        },
    )
    .unwrap();

    let grace_uri = format!("/api/users/{}", dir.grace.id);
    let (status, _) = call(
        &dir.router,
        Method::DELETE,
        &grace_uri,
        Some(&access_token(&dir.ada)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &dir.router,
        Method::DELETE,
        &grace_uri,
        Some(&access_token(&dir.grace)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(get_user(&dir.db.pool.get().unwrap(), dir.grace.id).is_ok());
}
