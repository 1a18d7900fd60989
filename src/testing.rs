//! Postgres-backed test support. Tests using it are skipped unless
//! `TEST_DATABASE_URL` points at a database the migrations may run on.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use tower::ServiceExt;

use crate::{
    app::{connect_db, new_id, now_iso, random_token, router, AppState},
    config::Config,
    types::WhatsAppConnection,
};

/// The dispatcher claims due rows across tenants, so database tests run one
/// at a time.
static SERIAL: Mutex<()> = Mutex::const_new(());

pub struct TestDb {
    pub state: Arc<AppState>,
    _serial: MutexGuard<'static, ()>,
}

pub async fn test_db(whatsapp_api_url: Option<String>) -> Option<TestDb> {
    let url = std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())?;
    let serial = SERIAL.lock().await;
    let mut config = Config::for_tests();
    config.database_url = url;
    if let Some(api_url) = whatsapp_api_url {
        config.whatsapp_api_url = api_url;
    }
    let db = connect_db(&config).await.expect("connect test database");
    Some(TestDb {
        state: Arc::new(AppState::new(db, config)),
        _serial: serial,
    })
}

/// Serves a Graph API stand-in that accepts every send.
pub async fn stub_graph_api() -> String {
    let app = Router::new().fallback(|| async {
        Json(json!({ "messages": [{ "id": "wamid.test" }] }))
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v18.0")
}

/// One JSON request through the full router as the session `token`.
pub async fn call(
    state: &Arc<AppState>,
    method: Method,
    uri: &str,
    token: &str,
    body: Value,
) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

pub async fn user(db: &PgPool) -> String {
    let id = new_id();
    let now = now_iso();
    sqlx::query(
        "INSERT INTO users (id, email, password_hash, name, role, created_at, updated_at) \
         VALUES ($1,$2,'x','Test','client',$3,$3)",
    )
    .bind(&id)
    .bind(format!("{id}@test.heyhey.com"))
    .bind(&now)
    .execute(db)
    .await
    .unwrap();
    id
}

/// Bearer token of a fresh session for `user_id`.
pub async fn session(db: &PgPool, user_id: &str) -> String {
    let token = random_token(48);
    sqlx::query(
        "INSERT INTO user_sessions (token, user_id, created_at, expires_at) \
         VALUES ($1,$2,$3,'2999-01-01T00:00:00.000Z')",
    )
    .bind(&token)
    .bind(user_id)
    .bind(now_iso())
    .execute(db)
    .await
    .unwrap();
    token
}

pub async fn connection(db: &PgPool, user_id: &str) -> WhatsAppConnection {
    let now = now_iso();
    let connection = WhatsAppConnection {
        id: new_id(),
        user_id: user_id.to_string(),
        phone_number: "+52 55 5000 0000".to_string(),
        phone_number_id: new_id(),
        waba_id: new_id(),
        business_name: Some("Tienda".to_string()),
        access_token: Some("test-token".to_string()),
        status: "connected".to_string(),
        connected_at: Some(now.clone()),
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO whatsapp_connections \
         (id, user_id, phone_number, phone_number_id, waba_id, business_name, access_token, status, connected_at, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&connection.id)
    .bind(&connection.user_id)
    .bind(&connection.phone_number)
    .bind(&connection.phone_number_id)
    .bind(&connection.waba_id)
    .bind(&connection.business_name)
    .bind(&connection.access_token)
    .bind(&connection.status)
    .bind(&connection.connected_at)
    .bind(&connection.created_at)
    .bind(&connection.updated_at)
    .execute(db)
    .await
    .unwrap();
    connection
}

/// Inserts a scheduled row and returns its id.
pub async fn scheduled(
    db: &PgPool,
    connection: &WhatsAppConnection,
    scheduled_at: &str,
    status: &str,
    updated_at: &str,
) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO scheduled_messages \
         (id, user_id, connection_id, recipient_phone, content, message_type, scheduled_at, status, created_at, updated_at) \
         VALUES ($1,$2,$3,'5215550001','Recordatorio','text',$4,$5,$6,$6)",
    )
    .bind(&id)
    .bind(&connection.user_id)
    .bind(&connection.id)
    .bind(scheduled_at)
    .bind(status)
    .bind(updated_at)
    .execute(db)
    .await
    .unwrap();
    id
}

pub async fn scheduled_status(db: &PgPool, id: &str) -> String {
    sqlx::query_scalar("SELECT status FROM scheduled_messages WHERE id = $1")
        .bind(id)
        .fetch_one(db)
        .await
        .unwrap()
}

/// Removes the user and everything owned through cascades.
pub async fn cleanup(db: &PgPool, user_id: &str) {
    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(db)
        .await
        .unwrap();
}
