//! Meta webhook endpoint: subscription handshake and event delivery.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use sqlx::Row;

use crate::{
    app::{create_notification, json_text, new_id, now_iso, AppState},
    chatbot::{conversation_id, process_chatbot_message, IncomingMessage},
    error::{ApiError, ApiResult},
    types::{WhatsAppConnection, CONNECTION_COLUMNS},
    whatsapp::{self, InboundMessage, NewMessage, WebhookPayload},
};

const WABA_OBJECT: &str = "whatsapp_business_account";
const PREVIEW_CHARS: usize = 80;

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe" && token == state.config.whatsapp_verify_token {
        tracing::info!("webhook verified");
        return (StatusCode::OK, challenge).into_response();
    }
    ApiError::Forbidden("forbidden".to_string()).into_response()
}

pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !whatsapp::verify_signature(&state.config.whatsapp_app_secret, signature, &body) {
        return Err(ApiError::Forbidden("invalid webhook signature".to_string()));
    }
    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("invalid webhook payload"))?;

    if payload.object != WABA_OBJECT {
        tracing::debug!(object = %payload.object, "ignoring webhook object");
        return Ok(Json(json!({ "status": "received" })));
    }

    for entry in payload.entry {
        let connection = connection_by_waba(&state, &entry.id).await?;
        if connection.is_none() {
            tracing::warn!(waba_id = %entry.id, "webhook for unknown waba id");
        }
        for change in entry.changes {
            let log_id = log_event(&state, connection.as_ref(), &change.field, &change.value).await?;
            let handled = match change.field.as_str() {
                "messages" => {
                    handle_messages(&state, connection.as_ref(), &entry.id, &change.value).await
                }
                "message_template_status_update" => {
                    handle_template_status(&state, connection.as_ref(), &change.value).await
                }
                other => {
                    tracing::debug!(field = other, "unhandled webhook field");
                    Ok(())
                }
            };
            match handled {
                Ok(()) => {
                    sqlx::query("UPDATE webhook_logs SET processed = true WHERE id = $1")
                        .bind(&log_id)
                        .execute(&state.db)
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(field = %change.field, error = %err, "webhook change failed");
                }
            }
        }
    }

    Ok(Json(json!({ "status": "received" })))
}

async fn connection_by_waba(
    state: &Arc<AppState>,
    waba_id: &str,
) -> Result<Option<WhatsAppConnection>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections WHERE waba_id = $1 ORDER BY created_at ASC LIMIT 1"
    ))
    .bind(waba_id)
    .fetch_optional(&state.db)
    .await?;
    Ok(row.as_ref().map(WhatsAppConnection::from_row))
}

async fn log_event(
    state: &Arc<AppState>,
    connection: Option<&WhatsAppConnection>,
    event_type: &str,
    value: &Value,
) -> Result<String, sqlx::Error> {
    let id = new_id();
    sqlx::query(
        "INSERT INTO webhook_logs (id, connection_id, user_id, event_type, payload, processed, created_at) \
         VALUES ($1,$2,$3,$4,$5,false,$6)",
    )
    .bind(&id)
    .bind(connection.map(|c| c.id.as_str()))
    .bind(connection.map(|c| c.user_id.as_str()))
    .bind(event_type)
    .bind(json_text(value))
    .bind(now_iso())
    .execute(&state.db)
    .await?;
    Ok(id)
}

fn preview(text: &str) -> String {
    let mut out = text.chars().take(PREVIEW_CHARS).collect::<String>();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

/// Creates the contact on first contact and fills a missing name from the
/// WhatsApp profile. Returns whether the contact is blocked.
async fn upsert_contact(
    state: &Arc<AppState>,
    user_id: &str,
    phone_number: &str,
    profile_name: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let now = now_iso();
    let row = sqlx::query(
        "INSERT INTO contacts (id, user_id, phone_number, name, is_blocked, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,false,$5,$5) \
         ON CONFLICT (user_id, phone_number) DO UPDATE SET \
         name = COALESCE(contacts.name, EXCLUDED.name), updated_at = EXCLUDED.updated_at \
         RETURNING is_blocked",
    )
    .bind(new_id())
    .bind(user_id)
    .bind(phone_number)
    .bind(profile_name)
    .bind(&now)
    .fetch_one(&state.db)
    .await?;
    Ok(row.get("is_blocked"))
}

async fn handle_messages(
    state: &Arc<AppState>,
    connection: Option<&WhatsAppConnection>,
    waba_id: &str,
    value: &Value,
) -> Result<(), sqlx::Error> {
    let Some(connection) = connection else {
        return Ok(());
    };

    for (wamid, status) in whatsapp::status_updates(value) {
        sqlx::query(
            "UPDATE messages SET status = $1 WHERE whatsapp_message_id = $2 AND connection_id = $3",
        )
        .bind(&status)
        .bind(&wamid)
        .bind(&connection.id)
        .execute(&state.db)
        .await?;
    }

    let names = whatsapp::contact_profile_names(value);
    for inbound in whatsapp::inbound_messages(value) {
        whatsapp::record_message(
            &state.db,
            NewMessage {
                connection_id: &connection.id,
                direction: "inbound",
                from: &inbound.from,
                to: &connection.phone_number,
                message_type: &inbound.message_type,
                content: &inbound.content,
                status: "received",
                whatsapp_message_id: inbound.whatsapp_id.as_deref(),
            },
        )
        .await?;

        let profile_name = names.get(&inbound.from).map(String::as_str);
        let blocked = upsert_contact(state, &connection.user_id, &inbound.from, profile_name).await?;

        create_notification(
            &state.db,
            &connection.user_id,
            "new_message",
            "Nuevo mensaje",
            &format!(
                "{}: {}",
                profile_name.unwrap_or(&inbound.from),
                preview(&inbound.content)
            ),
            Some("/dashboard/messages"),
        )
        .await?;

        if blocked {
            tracing::info!(connection_id = %connection.id, "message from blocked contact, chatbot skipped");
            continue;
        }
        queue_chatbot_reply(state, connection.clone(), waba_id.to_string(), inbound);
    }
    Ok(())
}

/// Replies run in the background, one after another per sender, in the order
/// the messages were received.
fn queue_chatbot_reply(
    state: &Arc<AppState>,
    connection: WhatsAppConnection,
    waba_id: String,
    inbound: InboundMessage,
) {
    let Some(text) = inbound.text else {
        return;
    };
    let key = conversation_id(&waba_id, &inbound.from);
    let state_for_task = state.clone();
    state.reply_queue.submit(&key, async move {
        let state = state_for_task;
        let incoming = IncomingMessage {
            from: inbound.from,
            text,
            connection_id: connection.id.clone(),
            waba_id,
        };
        let response = match process_chatbot_message(&state, &incoming).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(connection_id = %connection.id, error = %err, "chatbot failed");
                return;
            }
        };
        let Some(reply) = response.response.filter(|_| response.should_respond) else {
            return;
        };
        if let Err(err) = whatsapp::send_and_record(
            &state,
            &connection,
            &incoming.from,
            "text",
            &Value::String(reply),
        )
        .await
        {
            tracing::warn!(connection_id = %connection.id, error = %err, "chatbot reply not delivered");
        }
    });
}

async fn handle_template_status(
    state: &Arc<AppState>,
    connection: Option<&WhatsAppConnection>,
    value: &Value,
) -> Result<(), sqlx::Error> {
    let Some((name, status)) = whatsapp::template_status(value) else {
        return Ok(());
    };
    tracing::info!(template = %name, %status, "template status update");
    let Some(connection) = connection else {
        return Ok(());
    };
    sqlx::query(
        "UPDATE message_templates SET status = $1, updated_at = $2 WHERE name = $3 AND user_id = $4",
    )
    .bind(&status)
    .bind(now_iso())
    .bind(&name)
    .bind(&connection.user_id)
    .execute(&state.db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    async fn get(uri: &str) -> (StatusCode, String) {
        let response = crate::app::router(crate::app::test_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post(body: &'static str) -> (StatusCode, Value) {
        let response = crate::app::router(crate::app::test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/whatsapp")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn verification_echoes_challenge() {
        let (status, body) = get(
            "/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=heyhey_webhook_token&hub.challenge=12345",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "12345");
    }

    #[tokio::test]
    async fn verification_rejects_wrong_token_or_mode() {
        let (status, _) = get(
            "/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = get(
            "/api/webhooks/whatsapp?hub.mode=unsubscribe&hub.verify_token=heyhey_webhook_token&hub.challenge=1",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_request() {
        let (status, _) = post("{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn foreign_objects_are_acknowledged() {
        let (status, body) = post(r#"{"object":"instagram","entry":[]}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "received" }));
    }

    #[test]
    fn previews_are_cut() {
        assert_eq!(preview("hola"), "hola");
        let long = "a".repeat(100);
        assert_eq!(preview(&long).len(), PREVIEW_CHARS + 3);
    }
}
