use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    app::{
        auth_user_from_headers, bearer_token, new_id, normalize_email, now_iso, random_token,
        session_cookie, AppState, SESSION_COOKIE,
    },
    error::{ApiError, ApiResult},
    mailer,
    prompting::{password_reset_email, welcome_email},
    types::{ForgotPasswordBody, LoginBody, RegisterBody, ResetPasswordBody, UserProfile},
};

const MIN_PASSWORD_LEN: usize = 6;
const RESET_TOKEN_LEN: usize = 64;
const RESET_TOKEN_TTL_MINUTES: i64 = 60;
const FORGOT_PASSWORD_REPLY: &str =
    "If the email is registered, you will receive a link to reset your password";

fn expires_in(duration: Duration) -> String {
    (Utc::now() + duration).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn default_name(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

fn session_cookie_header(token: &str, max_age_secs: i64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

fn hash_password(password: &str) -> ApiResult<String> {
    hash(password, DEFAULT_COST).map_err(|_| ApiError::internal("unable to hash password"))
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&body.email);
    if email.is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(
            "password must be at least 6 characters",
        ));
    }

    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.db)
        .await?;
    if exists > 0 {
        return Err(ApiError::Conflict("email already registered".to_string()));
    }

    let name = body
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_name(&email));
    let password_hash = hash_password(&body.password)?;
    let now = now_iso();
    let user = UserProfile {
        id: new_id(),
        email,
        name,
        role: "client".to_string(),
        created_at: now.clone(),
    };
    sqlx::query(
        "INSERT INTO users (id, email, password_hash, name, role, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$6)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&password_hash)
    .bind(&user.name)
    .bind(&user.role)
    .bind(&now)
    .execute(&state.db)
    .await?;
    tracing::info!(user_id = %user.id, "user registered");

    let welcome = welcome_email(&user.name);
    if let Err(err) = mailer::send_email(&state.config, &user.email, &welcome).await {
        tracing::warn!(user_id = %user.id, error = %err, "welcome email failed");
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "user created", "user": user })),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> ApiResult<impl IntoResponse> {
    let invalid = || ApiError::Unauthorized("invalid credentials".to_string());
    let email = normalize_email(&body.email);
    let row = sqlx::query(
        "SELECT id, email, name, role, created_at, password_hash FROM users WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(invalid)?;

    let password_hash: String = row.get("password_hash");
    if !verify(&body.password, &password_hash).unwrap_or(false) {
        return Err(invalid());
    }
    let user = UserProfile::from_row(&row);

    let token = Uuid::new_v4().to_string();
    let ttl_hours = state.config.session_ttl_hours;
    sqlx::query(
        "INSERT INTO user_sessions (token, user_id, created_at, expires_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(&token)
    .bind(&user.id)
    .bind(now_iso())
    .bind(expires_in(Duration::hours(ttl_hours)))
    .execute(&state.db)
    .await?;

    let cookie = session_cookie_header(&token, ttl_hours * 3600);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "token": token, "user": user })),
    ))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    if let Some(token) = bearer_token(&headers).or_else(|| session_cookie(&headers)) {
        sqlx::query("DELETE FROM user_sessions WHERE token = $1")
            .bind(&token)
            .execute(&state.db)
            .await?;
    }
    Ok((
        [(header::SET_COOKIE, session_cookie_header("", 0))],
        Json(json!({ "success": true })),
    ))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    Ok(Json(json!({ "user": user })))
}

pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ForgotPasswordBody>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&body.email);
    if email.is_empty() {
        return Err(ApiError::bad_request("email is required"));
    }

    let user_id: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;
    let Some(user_id) = user_id else {
        return Ok(Json(json!({ "message": FORGOT_PASSWORD_REPLY })));
    };

    sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1")
        .bind(&user_id)
        .execute(&state.db)
        .await?;
    let token = random_token(RESET_TOKEN_LEN);
    sqlx::query(
        "INSERT INTO password_reset_tokens (token, user_id, expires_at, created_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(&token)
    .bind(&user_id)
    .bind(expires_in(Duration::minutes(RESET_TOKEN_TTL_MINUTES)))
    .bind(now_iso())
    .execute(&state.db)
    .await?;

    let reset_url = format!("{}/reset-password?token={token}", state.config.public_base_url);
    match mailer::send_email(&state.config, &email, &password_reset_email(&reset_url)).await {
        Ok(mailer::Delivery::Logged) => {
            tracing::info!(%user_id, %reset_url, "password reset link (smtp disabled)");
        }
        Ok(mailer::Delivery::Sent) => {}
        Err(err) => tracing::warn!(%user_id, error = %err, "password reset email failed"),
    }

    Ok(Json(json!({ "message": FORGOT_PASSWORD_REPLY })))
}

pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetPasswordBody>,
) -> ApiResult<impl IntoResponse> {
    let token = body.token.trim();
    if token.is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("token and password are required"));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(
            "password must be at least 6 characters",
        ));
    }

    let row = sqlx::query("SELECT user_id, expires_at FROM password_reset_tokens WHERE token = $1")
        .bind(token)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::bad_request("invalid or expired token"))?;
    let user_id: String = row.get("user_id");
    let expires_at: String = row.get("expires_at");

    if expires_at <= now_iso() {
        sqlx::query("DELETE FROM password_reset_tokens WHERE token = $1")
            .bind(token)
            .execute(&state.db)
            .await?;
        return Err(ApiError::bad_request("token has expired"));
    }

    let password_hash = hash_password(&body.password)?;
    let mut tx = state.db.begin().await?;
    sqlx::query("UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3")
        .bind(&password_hash)
        .bind(now_iso())
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM password_reset_tokens WHERE token = $1")
        .bind(token)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM user_sessions WHERE user_id = $1")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(%user_id, "password reset");

    Ok(Json(json!({ "message": "password updated" })))
}
