//! `/api/v1/messages`: API-key authenticated access for integrations.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    app::{clamp_limit, AppState},
    error::{ApiError, ApiResult},
    routes::{
        api_keys::{authenticate, PERMISSION_READ, PERMISSION_SEND},
        non_blank,
    },
    types::{
        ApiKeyRecord, ApiSendMessageBody, Message, MessagesQuery, WhatsAppConnection,
        CONNECTION_COLUMNS, MESSAGE_COLUMNS,
    },
    whatsapp,
};

fn require_permission(key: &ApiKeyRecord, permission: &str) -> ApiResult<()> {
    if key.allows(permission) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "api key lacks the {permission} permission"
        )))
    }
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ApiSendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let key = authenticate(&state, &headers).await?;
    require_permission(&key, PERMISSION_SEND)?;

    let (Some(phone_number_id), Some(to)) = (
        non_blank(Some(body.phone_number_id.as_str())),
        non_blank(Some(body.to.as_str())),
    ) else {
        return Err(ApiError::bad_request(
            "phoneNumberId, to and message are required",
        ));
    };
    if whatsapp::message_is_empty(&body.message) {
        return Err(ApiError::bad_request(
            "phoneNumberId, to and message are required",
        ));
    }

    let connection = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections WHERE phone_number_id = $1 AND user_id = $2"
    ))
    .bind(&phone_number_id)
    .bind(&key.user_id)
    .fetch_optional(&state.db)
    .await?
    .map(|row| WhatsAppConnection::from_row(&row))
    .filter(|c| c.usable_access_token().is_some())
    .ok_or_else(|| ApiError::not_found("connection not found or missing access token"))?;

    let message_type = non_blank(body.message_type.as_deref()).unwrap_or_else(|| "text".to_string());
    let outcome =
        whatsapp::send_and_record(&state, &connection, &to, &message_type, &body.message).await?;
    tracing::info!(api_key_id = %key.id, connection_id = %connection.id, "message sent via api key");
    Ok(Json(json!({ "success": true, "messageId": outcome.message_id })))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let key = authenticate(&state, &headers).await?;
    require_permission(&key, PERMISSION_READ)?;

    let limit = clamp_limit(query.limit, 50, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let connection_filter = non_blank(query.connection_id.as_deref());

    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE connection_id IN (SELECT id FROM whatsapp_connections WHERE user_id = $1) \
           AND ($2::TEXT IS NULL OR connection_id = $2) \
         ORDER BY created_at DESC LIMIT $3 OFFSET $4"
    ))
    .bind(&key.user_id)
    .bind(&connection_filter)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await?;
    let messages = rows.iter().map(Message::from_row).collect::<Vec<_>>();
    Ok(Json(json!({ "messages": messages })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    #[test]
    fn permission_check() {
        let key = ApiKeyRecord {
            id: "k".to_string(),
            user_id: "u".to_string(),
            permissions: vec![PERMISSION_READ.to_string()],
            is_active: true,
        };
        assert!(require_permission(&key, PERMISSION_READ).is_ok());
        let err = require_permission(&key, PERMISSION_SEND).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let response = crate::app::router(crate::app::test_state())
            .oneshot(Request::builder().uri("/api/v1/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
