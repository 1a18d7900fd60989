use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    app::{self, auth_user_from_headers, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, required_id},
    types::{CreateNotificationBody, DeleteNotificationQuery, MarkNotificationBody, Notification},
};

const COLUMNS: &str = "id, user_id, kind, title, content, link, is_read, created_at";
const LIST_LIMIT: i64 = 50;

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
    ))
    .bind(&user.id)
    .bind(LIST_LIMIT)
    .fetch_all(&state.db)
    .await?;
    let unread_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = false",
    )
    .bind(&user.id)
    .fetch_one(&state.db)
    .await?;

    let notifications = rows.iter().map(Notification::from_row).collect::<Vec<_>>();
    Ok(Json(json!({
        "notifications": notifications,
        "unreadCount": unread_count,
    })))
}

pub async fn create_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNotificationBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(kind), Some(title), Some(content)) = (
        non_blank(Some(body.kind.as_str())),
        non_blank(Some(body.title.as_str())),
        non_blank(Some(body.content.as_str())),
    ) else {
        return Err(ApiError::bad_request("type, title and content are required"));
    };
    let link = non_blank(body.link.as_deref());

    let id = app::create_notification(&state.db, &user.id, &kind, &title, &content, link.as_deref())
        .await?;
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM notifications WHERE id = $1"))
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "notification": Notification::from_row(&row) })),
    ))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MarkNotificationBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    if body.mark_all_read {
        let updated = sqlx::query(
            "UPDATE notifications SET is_read = true WHERE user_id = $1 AND is_read = false",
        )
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
        return Ok(Json(json!({ "success": true, "updated": updated })));
    }

    let id = required_id(body.id.as_deref())?;
    let updated = sqlx::query("UPDATE notifications SET is_read = true WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(ApiError::not_found("notification not found"));
    }
    Ok(Json(json!({ "success": true, "updated": updated })))
}

pub async fn delete_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeleteNotificationQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let deleted = if query.all.as_deref() == Some("true") {
        sqlx::query("DELETE FROM notifications WHERE user_id = $1")
            .bind(&user.id)
            .execute(&state.db)
            .await?
            .rows_affected()
    } else {
        let id = required_id(query.id.as_deref())?;
        sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(&id)
            .bind(&user.id)
            .execute(&state.db)
            .await?
            .rows_affected()
    };
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}
