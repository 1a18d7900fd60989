use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    app::{auth_user_from_headers, new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, required_id},
    types::{CreateQuickReplyBody, IdQuery, QuickReply, UpdateQuickReplyBody},
};

const COLUMNS: &str = "id, user_id, shortcut, title, content, category, created_at, updated_at";

/// Shortcuts are stored with a leading `/`.
pub fn normalize_shortcut(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn duplicate_shortcut() -> ApiError {
    ApiError::Conflict("shortcut already exists".to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

pub async fn list_quick_replies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM quick_replies WHERE user_id = $1 ORDER BY shortcut ASC"
    ))
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let quick_replies = rows.iter().map(QuickReply::from_row).collect::<Vec<_>>();
    Ok(Json(json!({ "quickReplies": quick_replies })))
}

pub async fn create_quick_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateQuickReplyBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(shortcut), Some(title), Some(content)) = (
        non_blank(Some(body.shortcut.as_str())),
        non_blank(Some(body.title.as_str())),
        non_blank(Some(body.content.as_str())),
    ) else {
        return Err(ApiError::bad_request("shortcut, title and content are required"));
    };

    let now = now_iso();
    let quick_reply = QuickReply {
        id: new_id(),
        user_id: user.id.clone(),
        shortcut: normalize_shortcut(&shortcut),
        title,
        content,
        category: non_blank(body.category.as_deref()).unwrap_or_else(|| "general".to_string()),
        created_at: now.clone(),
        updated_at: now,
    };
    let inserted = sqlx::query(&format!(
        "INSERT INTO quick_replies ({COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
         ON CONFLICT (user_id, shortcut) DO NOTHING"
    ))
    .bind(&quick_reply.id)
    .bind(&quick_reply.user_id)
    .bind(&quick_reply.shortcut)
    .bind(&quick_reply.title)
    .bind(&quick_reply.content)
    .bind(&quick_reply.category)
    .bind(&quick_reply.created_at)
    .bind(&quick_reply.updated_at)
    .execute(&state.db)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Err(duplicate_shortcut());
    }
    Ok((StatusCode::CREATED, Json(json!({ "quickReply": quick_reply }))))
}

pub async fn update_quick_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateQuickReplyBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;
    let shortcut = non_blank(body.shortcut.as_deref()).map(|s| normalize_shortcut(&s));

    let row = sqlx::query(&format!(
        "UPDATE quick_replies SET shortcut = COALESCE($1, shortcut), title = COALESCE($2, title), \
         content = COALESCE($3, content), category = COALESCE($4, category), updated_at = $5 \
         WHERE id = $6 AND user_id = $7 RETURNING {COLUMNS}"
    ))
    .bind(&shortcut)
    .bind(non_blank(body.title.as_deref()))
    .bind(non_blank(body.content.as_deref()))
    .bind(non_blank(body.category.as_deref()))
    .bind(now_iso())
    .bind(&id)
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            duplicate_shortcut()
        } else {
            err.into()
        }
    })?
    .ok_or_else(|| ApiError::not_found("quick reply not found"))?;
    Ok(Json(json!({ "quickReply": QuickReply::from_row(&row) })))
}

pub async fn delete_quick_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query("DELETE FROM quick_replies WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("quick reply not found"));
    }
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortcuts_gain_a_single_slash() {
        assert_eq!(normalize_shortcut("hola"), "/hola");
        assert_eq!(normalize_shortcut("/hola"), "/hola");
        assert_eq!(normalize_shortcut("  precios "), "/precios");
    }

    #[test]
    fn duplicate_shortcut_is_conflict() {
        assert_eq!(duplicate_shortcut().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn normalized_shortcuts_conflict_on_create_and_update() {
        use axum::http::Method;

        use crate::testing;

        let Some(test) = testing::test_db(None).await else {
            return;
        };
        let db = &test.state.db;
        let user = testing::user(db).await;
        let token = testing::session(db, &user).await;
        let reply = |shortcut: &str| json!({ "shortcut": shortcut, "title": "Saludo", "content": "¡Hola!" });

        let (status, body) =
            testing::call(&test.state, Method::POST, "/api/quick-replies", &token, reply("hola")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["quickReply"]["shortcut"], "/hola");
        let (status, _) =
            testing::call(&test.state, Method::POST, "/api/quick-replies", &token, reply("/hola")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) =
            testing::call(&test.state, Method::POST, "/api/quick-replies", &token, reply("precios")).await;
        let id = body["quickReply"]["id"].as_str().unwrap().to_string();
        let (status, _) = testing::call(
            &test.state,
            Method::PUT,
            "/api/quick-replies",
            &token,
            json!({ "id": id, "shortcut": "hola" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        testing::cleanup(db, &user).await;
    }
}
