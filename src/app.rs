use std::{error::Error, sync::Arc, time::Duration};

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bcrypt::{hash, DEFAULT_COST};
use chrono::{SecondsFormat, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    chatbot::{ConversationLocks, ReplyQueue},
    config::Config,
    error::{ApiError, ApiResult},
    routes, scheduler,
    types::UserProfile,
};

pub const SESSION_COOKIE: &str = "heyhey_session";

pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub http: reqwest::Client,
    pub conversation_locks: ConversationLocks,
    pub reply_queue: ReplyQueue,
}

impl AppState {
    pub fn new(db: PgPool, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            db,
            config,
            http,
            conversation_locks: ConversationLocks::default(),
            reply_queue: ReplyQueue::default(),
        }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    limit.filter(|l| *l > 0).unwrap_or(default).min(max)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| session_cookie(headers))
}

pub async fn auth_user_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> ApiResult<UserProfile> {
    let token = session_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing session token".to_string()))?;

    let row = sqlx::query(
        "SELECT u.id, u.email, u.name, u.role, u.created_at \
         FROM user_sessions s JOIN users u ON u.id = s.user_id \
         WHERE s.token = $1 AND s.expires_at > $2",
    )
    .bind(&token)
    .bind(now_iso())
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::Unauthorized("invalid or expired session".to_string()))?;

    Ok(UserProfile::from_row(&row))
}

pub async fn require_admin(state: &Arc<AppState>, headers: &HeaderMap) -> ApiResult<UserProfile> {
    let user = auth_user_from_headers(state, headers).await?;
    if !user.is_admin() {
        return Err(ApiError::Forbidden("access denied".to_string()));
    }
    Ok(user)
}

pub async fn create_notification(
    db: &PgPool,
    user_id: &str,
    kind: &str,
    title: &str,
    content: &str,
    link: Option<&str>,
) -> Result<String, sqlx::Error> {
    let id = new_id();
    sqlx::query(
        "INSERT INTO notifications (id, user_id, kind, title, content, link, is_read, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,false,$7)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(kind)
    .bind(title)
    .bind(content)
    .bind(link)
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(id)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

pub fn router(state: Arc<AppState>) -> Router {
    use routes::*;

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/forgot-password", post(auth::forgot_password))
        .route("/api/auth/reset-password", post(auth::reset_password))
        .route(
            "/api/whatsapp/connect",
            get(connections::list_connections)
                .post(connections::connect)
                .delete(connections::delete_connection),
        )
        .route(
            "/api/whatsapp/send",
            get(connections::list_messages).post(connections::send),
        )
        .route(
            "/api/v1/messages",
            get(public_api::list_messages).post(public_api::send_message),
        )
        .route(
            "/api/webhooks/whatsapp",
            get(webhooks::verify).post(webhooks::receive),
        )
        .route(
            "/api/chatbot/flows",
            get(flows::list_flows)
                .post(flows::create_flow)
                .put(flows::update_flow)
                .delete(flows::delete_flow),
        )
        .route("/api/chatbot/ai", post(flows::ai_playground))
        .route(
            "/api/contacts",
            get(contacts::list_contacts)
                .post(contacts::create_contact)
                .put(contacts::update_contact)
                .delete(contacts::delete_contact),
        )
        .route(
            "/api/contacts/tags",
            get(contacts::list_tags)
                .post(contacts::create_tag)
                .delete(contacts::delete_tag),
        )
        .route(
            "/api/contacts/groups",
            get(contacts::list_groups)
                .post(contacts::create_group)
                .put(contacts::update_group)
                .delete(contacts::delete_group),
        )
        .route(
            "/api/contacts/notes",
            post(contacts::create_note)
                .put(contacts::update_note)
                .delete(contacts::delete_note),
        )
        .route(
            "/api/quick-replies",
            get(quick_replies::list_quick_replies)
                .post(quick_replies::create_quick_reply)
                .put(quick_replies::update_quick_reply)
                .delete(quick_replies::delete_quick_reply),
        )
        .route(
            "/api/templates",
            get(templates::list_templates)
                .post(templates::create_template)
                .delete(templates::delete_template),
        )
        .route(
            "/api/scheduled-messages",
            get(scheduled::list_scheduled)
                .post(scheduled::create_scheduled)
                .delete(scheduled::cancel_scheduled),
        )
        .route(
            "/api/notifications",
            get(notifications::list_notifications)
                .post(notifications::create_notification)
                .put(notifications::mark_read)
                .delete(notifications::delete_notifications),
        )
        .route(
            "/api/settings/api-keys",
            get(api_keys::list_api_keys)
                .post(api_keys::create_api_key)
                .delete(api_keys::delete_api_key),
        )
        .route("/api/stats/dashboard", get(stats::dashboard))
        .route("/api/export/conversations", get(stats::export_conversations))
        .route("/api/admin/users", get(admin::users))
        .route("/api/admin/stats", get(admin::stats))
        .route("/api/admin/webhooks", get(admin::webhooks))
        .route("/api/admin/export", get(admin::export))
        .fallback(|| async { ApiError::not_found("route not found") })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn connect_db(config: &Config) -> Result<PgPool, sqlx::Error> {
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    Ok(db)
}

pub async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let port = config.port;
    let db = connect_db(&config).await?;
    let state = Arc::new(AppState::new(db, config));

    let dispatcher = scheduler::spawn(state.clone());
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "heyhey server listening");
    axum::serve(listener, app).await?;

    dispatcher.abort();
    Ok(())
}

/// Creates the demo admin and client accounts if they do not exist yet.
pub async fn seed(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let db = connect_db(&config).await?;
    let accounts = [
        ("admin@heyhey.com", "admin123", "Administrador", "admin"),
        ("cliente@test.com", "client123", "Cliente Demo", "client"),
    ];
    for (email, password, name, role) in accounts {
        let password_hash = hash(password, DEFAULT_COST)?;
        let now = now_iso();
        let inserted = sqlx::query(
            "INSERT INTO users (id, email, password_hash, name, role, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$6) ON CONFLICT (email) DO NOTHING",
        )
        .bind(new_id())
        .bind(email)
        .bind(&password_hash)
        .bind(name)
        .bind(role)
        .bind(&now)
        .execute(&db)
        .await?
        .rows_affected();
        if inserted > 0 {
            tracing::info!(email, role, "seeded user");
        } else {
            tracing::info!(email, "user already present, skipped");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    let config = Config::for_tests();
    let db = PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("lazy pool");
    Arc::new(AppState::new(db, config))
}
