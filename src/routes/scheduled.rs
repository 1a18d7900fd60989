use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Row};

use crate::{
    app::{auth_user_from_headers, new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, owned_connection, required_id},
    scheduler::normalize_timestamp,
    types::{CreateScheduledBody, IdQuery, ScheduledMessage, SCHEDULED_COLUMNS},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionLabel {
    phone_number: String,
    business_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledItem {
    #[serde(flatten)]
    message: ScheduledMessage,
    connection: Option<ConnectionLabel>,
}

pub async fn list_scheduled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let labels = sqlx::query(
        "SELECT id, phone_number, business_name FROM whatsapp_connections WHERE user_id = $1",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?
    .into_iter()
    .map(|row| {
        (
            row.get::<String, _>("id"),
            ConnectionLabel {
                phone_number: row.get("phone_number"),
                business_name: row.get("business_name"),
            },
        )
    })
    .collect::<HashMap<_, _>>();

    let rows = sqlx::query(&format!(
        "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE user_id = $1 ORDER BY scheduled_at ASC"
    ))
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let scheduled = rows
        .iter()
        .map(ScheduledMessage::from_row)
        .map(|message| ScheduledItem {
            connection: labels.get(&message.connection_id).cloned(),
            message,
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "scheduledMessages": scheduled })))
}

pub async fn create_scheduled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateScheduledBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(connection_id), Some(recipient_phone), Some(content), Some(raw_scheduled_at)) = (
        non_blank(Some(body.connection_id.as_str())),
        non_blank(Some(body.recipient_phone.as_str())),
        non_blank(Some(body.content.as_str())),
        non_blank(Some(body.scheduled_at.as_str())),
    ) else {
        return Err(ApiError::bad_request(
            "connectionId, recipientPhone, content and scheduledAt are required",
        ));
    };
    let scheduled_at = normalize_timestamp(&raw_scheduled_at)
        .ok_or_else(|| ApiError::bad_request("scheduledAt must be an RFC 3339 timestamp"))?;
    let connection = owned_connection(&state, &user.id, &connection_id).await?;

    let now = now_iso();
    let message = ScheduledMessage {
        id: new_id(),
        user_id: user.id.clone(),
        connection_id: connection.id,
        recipient_phone,
        content,
        message_type: non_blank(body.message_type.as_deref()).unwrap_or_else(|| "text".to_string()),
        media_url: non_blank(body.media_url.as_deref()),
        scheduled_at,
        status: "pending".to_string(),
        sent_at: None,
        error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(&format!(
        "INSERT INTO scheduled_messages ({SCHEDULED_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)"
    ))
    .bind(&message.id)
    .bind(&message.user_id)
    .bind(&message.connection_id)
    .bind(&message.recipient_phone)
    .bind(&message.content)
    .bind(&message.message_type)
    .bind(&message.media_url)
    .bind(&message.scheduled_at)
    .bind(&message.status)
    .bind(&message.sent_at)
    .bind(&message.error)
    .bind(&message.created_at)
    .bind(&message.updated_at)
    .execute(&state.db)
    .await?;
    tracing::info!(scheduled_id = %message.id, scheduled_at = %message.scheduled_at, "message scheduled");
    Ok((StatusCode::CREATED, Json(json!({ "scheduledMessage": message }))))
}

/// Only messages the dispatcher has not claimed can be cancelled.
pub(crate) fn ensure_cancellable(status: &str) -> ApiResult<()> {
    match status {
        "pending" | "failed" | "cancelled" => Ok(()),
        "sent" => Err(ApiError::bad_request("cannot cancel a message that was already sent")),
        _ => Err(ApiError::Conflict("message is being sent".to_string())),
    }
}

pub(crate) async fn cancel(db: &PgPool, user_id: &str, id: &str) -> ApiResult<ScheduledMessage> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM scheduled_messages WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(db)
            .await?;
    let status = status.ok_or_else(|| ApiError::not_found("scheduled message not found"))?;
    ensure_cancellable(&status)?;

    // The dispatcher may claim it between the check and this update.
    let row = sqlx::query(&format!(
        "UPDATE scheduled_messages SET status = 'cancelled', updated_at = $1 \
         WHERE id = $2 AND user_id = $3 AND status IN ('pending', 'failed', 'cancelled') \
         RETURNING {SCHEDULED_COLUMNS}"
    ))
    .bind(now_iso())
    .bind(id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::Conflict("message is being sent".to_string()))?;
    Ok(ScheduledMessage::from_row(&row))
}

pub async fn cancel_scheduled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let message = cancel(&state.db, &user.id, &id).await?;
    tracing::info!(scheduled_id = %message.id, "scheduled message cancelled");
    Ok(Json(json!({ "scheduledMessage": message })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_and_sent_messages_cannot_be_cancelled() {
        assert!(ensure_cancellable("pending").is_ok());
        assert!(ensure_cancellable("failed").is_ok());
        assert_eq!(ensure_cancellable("sent").unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(ensure_cancellable("sending").unwrap_err().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn list_items_flatten_the_message() {
        let item = ScheduledItem {
            message: ScheduledMessage {
                id: "s1".to_string(),
                user_id: "u1".to_string(),
                connection_id: "c1".to_string(),
                recipient_phone: "5215550001".to_string(),
                content: "hola".to_string(),
                message_type: "text".to_string(),
                media_url: None,
                scheduled_at: "2024-03-05T14:00:00.000Z".to_string(),
                status: "pending".to_string(),
                sent_at: None,
                error: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            connection: Some(ConnectionLabel {
                phone_number: "+52 55 5000".to_string(),
                business_name: None,
            }),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["recipientPhone"], "5215550001");
        assert_eq!(value["connection"]["phoneNumber"], "+52 55 5000");
    }

    #[tokio::test]
    async fn cancel_applies_the_status_rules() {
        let Some(test) = crate::testing::test_db(None).await else {
            return;
        };
        let db = &test.state.db;
        let user = crate::testing::user(db).await;
        let connection = crate::testing::connection(db, &user).await;
        let later = "2999-01-01T00:00:00.000Z";
        let pending = crate::testing::scheduled(db, &connection, later, "pending", &now_iso()).await;
        let sent = crate::testing::scheduled(db, &connection, later, "sent", &now_iso()).await;

        let cancelled = cancel(db, &user, &pending).await.unwrap();
        assert_eq!(cancelled.status, "cancelled");
        assert_eq!(cancel(db, &user, &sent).await.unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(crate::testing::scheduled_status(db, &sent).await, "sent");

        let stranger = crate::testing::user(db).await;
        assert_eq!(cancel(db, &stranger, &pending).await.unwrap_err().status(), StatusCode::NOT_FOUND);
        crate::testing::cleanup(db, &stranger).await;
        crate::testing::cleanup(db, &user).await;
    }
}
