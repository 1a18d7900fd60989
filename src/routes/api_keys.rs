use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgRow, Row};

use crate::{
    app::{auth_user_from_headers, bearer_token, new_id, now_iso, random_token, AppState},
    error::{ApiError, ApiResult},
    routes::{required, required_id},
    types::{ApiKeyRecord, ApiKeySummary, CreateApiKeyBody, IdBody},
};

pub const KEY_PREFIX: &str = "hh_";
const KEY_RANDOM_LEN: usize = 40;
const DISPLAY_PREFIX_LEN: usize = 10;
const DISPLAY_SUFFIX_LEN: usize = 4;

pub const PERMISSION_READ: &str = "read_messages";
pub const PERMISSION_SEND: &str = "send_messages";

pub fn generate_key() -> String {
    format!("{KEY_PREFIX}{}", random_token(KEY_RANDOM_LEN))
}

pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Display prefix and suffix stored next to the digest.
pub fn key_display_parts(key: &str) -> (String, String) {
    let chars = key.chars().collect::<Vec<_>>();
    let prefix = chars.iter().take(DISPLAY_PREFIX_LEN).collect::<String>();
    let suffix = chars[chars.len().saturating_sub(DISPLAY_SUFFIX_LEN)..]
        .iter()
        .collect::<String>();
    (prefix, suffix)
}

pub fn mask(prefix: &str, suffix: &str) -> String {
    format!("{prefix}...{suffix}")
}

pub fn parse_permissions(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn summary_from_row(row: &PgRow) -> ApiKeySummary {
    let prefix: String = row.get("key_prefix");
    let suffix: String = row.get("key_suffix");
    ApiKeySummary {
        id: row.get("id"),
        name: row.get("name"),
        key: mask(&prefix, &suffix),
        permissions: parse_permissions(&row.get::<String, _>("permissions")),
        is_active: row.get("is_active"),
        last_used_at: row.get("last_used_at"),
        created_at: row.get("created_at"),
    }
}

/// Resolves the bearer API key of a public API call and stamps its last use.
pub async fn authenticate(state: &Arc<AppState>, headers: &HeaderMap) -> ApiResult<ApiKeyRecord> {
    let unauthorized = || ApiError::Unauthorized("invalid or missing API key".to_string());
    let key = bearer_token(headers).ok_or_else(unauthorized)?;
    let row = sqlx::query(
        "UPDATE api_keys SET last_used_at = $1 WHERE key_hash = $2 AND is_active = true \
         RETURNING id, user_id, permissions, is_active",
    )
    .bind(now_iso())
    .bind(key_digest(&key))
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(unauthorized)?;
    Ok(ApiKeyRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        permissions: parse_permissions(&row.get::<String, _>("permissions")),
        is_active: row.get("is_active"),
    })
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(
        "SELECT id, name, key_prefix, key_suffix, permissions, is_active, last_used_at, created_at \
         FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let keys = rows.iter().map(summary_from_row).collect::<Vec<_>>();
    Ok(Json(json!({ "apiKeys": keys })))
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let name = required(&body.name, "name")?;
    let permissions = body
        .permissions
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| vec![PERMISSION_READ.to_string(), PERMISSION_SEND.to_string()]);

    let key = generate_key();
    let (prefix, suffix) = key_display_parts(&key);
    let id = new_id();
    let created_at = now_iso();
    sqlx::query(
        "INSERT INTO api_keys (id, user_id, name, key_hash, key_prefix, key_suffix, permissions, is_active, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,true,$8)",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&name)
    .bind(key_digest(&key))
    .bind(&prefix)
    .bind(&suffix)
    .bind(serde_json::to_string(&permissions).unwrap_or_else(|_| "[]".to_string()))
    .bind(&created_at)
    .execute(&state.db)
    .await?;
    tracing::info!(user_id = %user.id, api_key_id = %id, "api key created");

    Ok(Json(json!({
        "apiKey": {
            "id": id,
            "name": name,
            "key": key,
            "permissions": permissions,
            "createdAt": created_at,
        },
        "message": "Store this key now; it will not be shown again."
    })))
}

pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;
    sqlx::query("DELETE FROM api_keys WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_prefix_and_length() {
        let key = generate_key();
        assert!(key.starts_with("hh_"));
        assert_eq!(key.len(), 43);
        assert!(key[3..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn masking_keeps_first_ten_and_last_four() {
        let key = "hh_abcdefghijklmnopqrstuvwxyz0123456789ABCD";
        let (prefix, suffix) = key_display_parts(key);
        assert_eq!(prefix, "hh_abcdefg");
        assert_eq!(suffix, "ABCD");
        assert_eq!(mask(&prefix, &suffix), "hh_abcdefg...ABCD");
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = key_digest("hh_test");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, key_digest("hh_test"));
        assert_ne!(digest, key_digest("hh_tesT"));
    }

    #[test]
    fn permissions_parse_leniently() {
        assert_eq!(parse_permissions(r#"["read_messages"]"#), vec!["read_messages"]);
        assert!(parse_permissions("not json").is_empty());
    }
}
