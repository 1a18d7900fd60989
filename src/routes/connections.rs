use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    app::{auth_user_from_headers, clamp_limit, new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, owned_connection, required},
    types::{
        ConnectBody, DeleteConnectionBody, Message, MessagesQuery, SendMessageBody,
        WhatsAppConnection, CONNECTION_COLUMNS, MESSAGE_COLUMNS,
    },
    whatsapp,
};

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let connections = rows
        .iter()
        .map(WhatsAppConnection::from_row)
        .collect::<Vec<_>>();
    Ok(Json(json!({ "connections": connections })))
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConnectBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(phone_number_id), Some(waba_id)) = (
        non_blank(Some(body.phone_number_id.as_str())),
        non_blank(Some(body.waba_id.as_str())),
    ) else {
        return Err(ApiError::bad_request("phoneNumberId and wabaId are required"));
    };
    let phone_number = body.phone_number.trim().to_string();
    let business_name = non_blank(body.business_name.as_deref());
    let access_token = non_blank(body.access_token.as_deref());
    let now = now_iso();

    let existing: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM whatsapp_connections WHERE phone_number_id = $1")
            .bind(&phone_number_id)
            .fetch_optional(&state.db)
            .await?;

    match existing {
        Some(owner) if owner != user.id => Err(ApiError::Conflict(
            "phone number is connected to another account".to_string(),
        )),
        Some(_) => {
            let row = sqlx::query(&format!(
                "UPDATE whatsapp_connections SET phone_number = $1, waba_id = $2, \
                 business_name = COALESCE($3, business_name), access_token = COALESCE($4, access_token), \
                 status = 'connected', connected_at = $5, updated_at = $5 \
                 WHERE phone_number_id = $6 RETURNING {CONNECTION_COLUMNS}"
            ))
            .bind(&phone_number)
            .bind(&waba_id)
            .bind(&business_name)
            .bind(&access_token)
            .bind(&now)
            .bind(&phone_number_id)
            .fetch_one(&state.db)
            .await?;
            let connection = WhatsAppConnection::from_row(&row);
            tracing::info!(connection_id = %connection.id, "whatsapp connection updated");
            Ok(Json(json!({ "message": "connection updated", "connection": connection })))
        }
        None => {
            let connection = WhatsAppConnection {
                id: new_id(),
                user_id: user.id.clone(),
                phone_number,
                phone_number_id,
                waba_id,
                business_name,
                access_token,
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
            .execute(&state.db)
            .await?;
            tracing::info!(connection_id = %connection.id, "whatsapp connection created");
            Ok(Json(json!({ "message": "connection created", "connection": connection })))
        }
    }
}

pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeleteConnectionBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let connection_id = required(&body.connection_id, "connectionId")?;
    let connection = owned_connection(&state, &user.id, &connection_id).await?;
    sqlx::query("DELETE FROM whatsapp_connections WHERE id = $1")
        .bind(&connection.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "message": "connection deleted" })))
}

pub async fn send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    if body.connection_id.trim().is_empty()
        || body.to.trim().is_empty()
        || whatsapp::message_is_empty(&body.message)
    {
        return Err(ApiError::bad_request(
            "connectionId, to and message are required",
        ));
    }
    let connection = owned_connection(&state, &user.id, body.connection_id.trim()).await?;
    let message_type = non_blank(body.message_type.as_deref()).unwrap_or_else(|| "text".to_string());

    let outcome =
        whatsapp::send_and_record(&state, &connection, body.to.trim(), &message_type, &body.message)
            .await?;
    Ok(Json(json!({ "success": true, "messageId": outcome.message_id })))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let connection_id = non_blank(query.connection_id.as_deref())
        .ok_or_else(|| ApiError::bad_request("connectionId is required"))?;
    let connection = owned_connection(&state, &user.id, &connection_id).await?;
    let limit = clamp_limit(query.limit, 50, 500);

    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE connection_id = $1 ORDER BY created_at DESC LIMIT $2"
    ))
    .bind(&connection.id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    let messages = rows.iter().map(Message::from_row).collect::<Vec<_>>();
    Ok(Json(json!({ "messages": messages })))
}
