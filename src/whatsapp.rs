//! WhatsApp Cloud API plumbing: outbound sends, message log rows and webhook
//! payload parsing.

use std::{collections::HashMap, sync::Arc};

use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;

use crate::{
    app::{new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    types::{Message, WhatsAppConnection},
};

pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Envelope keys a message type must not shadow.
const ENVELOPE_KEYS: [&str; 4] = ["messaging_product", "recipient_type", "to", "type"];

pub fn check_message_type(message_type: &str) -> ApiResult<()> {
    let valid = !message_type.is_empty()
        && message_type.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        && !ENVELOPE_KEYS.contains(&message_type);
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("unsupported messageType: {message_type}")))
    }
}

/// Text messages wrap a plain string as `{ "body": ... }`; every other type
/// carries the caller's object verbatim.
pub fn outbound_payload(to: &str, message_type: &str, message: &Value) -> Value {
    let body = match (message_type, message) {
        ("text", Value::String(text)) => json!({ "body": text }),
        _ => message.clone(),
    };
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": digits_only(to),
        "type": message_type,
    });
    payload[message_type] = body;
    payload
}

/// Stored representation of an outbound message body.
pub fn message_content(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn message_is_empty(message: &Value) -> bool {
    match message {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn upstream_error_message(body: &Value) -> String {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("failed to send message")
        .to_string()
}

fn sent_message_id(body: &Value) -> Option<String> {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|m| m.first())
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: Option<String>,
}

pub async fn send_message(
    state: &Arc<AppState>,
    connection: &WhatsAppConnection,
    to: &str,
    message_type: &str,
    message: &Value,
) -> ApiResult<SendOutcome> {
    check_message_type(message_type)?;
    let access_token = connection
        .usable_access_token()
        .ok_or_else(|| ApiError::bad_request("access token not available"))?;
    let url = format!(
        "{}/{}/messages",
        state.config.whatsapp_api_url, connection.phone_number_id
    );

    let response = state
        .http
        .post(url)
        .bearer_auth(access_token)
        .json(&outbound_payload(to, message_type, message))
        .send()
        .await
        .map_err(|err| {
            tracing::warn!(connection_id = %connection.id, error = %err, "whatsapp request failed");
            ApiError::Upstream {
                status: StatusCode::BAD_GATEWAY,
                message: "failed to reach WhatsApp API".to_string(),
            }
        })?;

    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
    if !status.is_success() {
        tracing::warn!(connection_id = %connection.id, status = status.as_u16(), body = %raw_body, "whatsapp api error");
        return Err(ApiError::Upstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            message: upstream_error_message(&body),
        });
    }

    Ok(SendOutcome {
        message_id: sent_message_id(&body),
    })
}

pub struct NewMessage<'a> {
    pub connection_id: &'a str,
    pub direction: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub message_type: &'a str,
    pub content: &'a str,
    pub status: &'a str,
    pub whatsapp_message_id: Option<&'a str>,
}

pub async fn record_message(db: &PgPool, new: NewMessage<'_>) -> Result<Message, sqlx::Error> {
    let message = Message {
        id: new_id(),
        connection_id: new.connection_id.to_string(),
        direction: new.direction.to_string(),
        from_number: new.from.to_string(),
        to_number: new.to.to_string(),
        message_type: new.message_type.to_string(),
        content: new.content.to_string(),
        status: new.status.to_string(),
        whatsapp_message_id: new.whatsapp_message_id.map(str::to_string),
        created_at: now_iso(),
    };
    sqlx::query(
        "INSERT INTO messages (id, connection_id, direction, from_number, to_number, message_type, content, status, whatsapp_message_id, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(&message.id)
    .bind(&message.connection_id)
    .bind(&message.direction)
    .bind(&message.from_number)
    .bind(&message.to_number)
    .bind(&message.message_type)
    .bind(&message.content)
    .bind(&message.status)
    .bind(&message.whatsapp_message_id)
    .bind(&message.created_at)
    .execute(db)
    .await?;
    Ok(message)
}

/// Sends through the Cloud API and logs the outbound row on success.
pub async fn send_and_record(
    state: &Arc<AppState>,
    connection: &WhatsAppConnection,
    to: &str,
    message_type: &str,
    message: &Value,
) -> ApiResult<SendOutcome> {
    let outcome = send_message(state, connection, to, message_type, message).await?;
    record_message(
        &state.db,
        NewMessage {
            connection_id: &connection.id,
            direction: "outbound",
            from: &connection.phone_number,
            to,
            message_type,
            content: &message_content(message),
            status: "sent",
            whatsapp_message_id: outcome.message_id.as_deref(),
        },
    )
    .await?;
    Ok(outcome)
}

// ---- webhook payloads ----

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: String,
    pub whatsapp_id: Option<String>,
    pub message_type: String,
    /// Text the chatbot can act on; `None` for media and other non-text types.
    pub text: Option<String>,
    /// What gets stored in the message log.
    pub content: String,
}

fn trimmed(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn inbound_text(message: &Value) -> Option<String> {
    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "text" => trimmed(message.get("text").and_then(|v| v.get("body"))),
        "button" => trimmed(message.get("button").and_then(|v| v.get("text"))),
        "interactive" => message.get("interactive").and_then(|v| {
            trimmed(v.get("button_reply").and_then(|r| r.get("title")))
                .or_else(|| trimmed(v.get("list_reply").and_then(|r| r.get("title"))))
        }),
        _ => None,
    }
}

pub fn inbound_messages(value: &Value) -> Vec<InboundMessage> {
    value
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|message| {
                    let from = digits_only(message.get("from").and_then(Value::as_str)?);
                    if from.is_empty() {
                        return None;
                    }
                    let message_type = message
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let text = inbound_text(message);
                    let content = match &text {
                        Some(text) => text.clone(),
                        None => message
                            .get(message_type.as_str())
                            .map(Value::to_string)
                            .unwrap_or_default(),
                    };
                    Some(InboundMessage {
                        from,
                        whatsapp_id: trimmed(message.get("id")),
                        message_type,
                        text,
                        content,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for contact in value.get("contacts").and_then(Value::as_array).into_iter().flatten() {
        let wa_id = digits_only(contact.get("wa_id").and_then(Value::as_str).unwrap_or(""));
        let name = trimmed(contact.get("profile").and_then(|p| p.get("name")));
        if let (false, Some(name)) = (wa_id.is_empty(), name) {
            names.insert(wa_id, name);
        }
    }
    names
}

/// `(whatsapp message id, status)` pairs from a `statuses` array.
pub fn status_updates(value: &Value) -> Vec<(String, String)> {
    value
        .get("statuses")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|status| Some((trimmed(status.get("id"))?, trimmed(status.get("status"))?)))
        .collect()
}

/// `(template name, new status)` from a `message_template_status_update` value.
pub fn template_status(value: &Value) -> Option<(String, String)> {
    let name = trimmed(value.get("message_template_name"))?;
    let event = trimmed(value.get("event"))?;
    Some((name, event.to_ascii_lowercase()))
}

/// Checks `x-hub-signature-256`. An empty app secret disables the check.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_non_digits() {
        assert_eq!(digits_only("+52 (1) 555-000-1"), "5215550001");
        assert_eq!(digits_only("abc"), "");
    }

    #[test]
    fn text_payload_wraps_body() {
        let payload = outbound_payload("+52 1 555", "text", &json!("Hola"));
        assert_eq!(
            payload,
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "521555",
                "type": "text",
                "text": { "body": "Hola" }
            })
        );
    }

    #[test]
    fn non_text_payload_passes_object_through() {
        let image = json!({ "link": "https://cdn.example.com/a.png", "caption": "hi" });
        let payload = outbound_payload("521555", "image", &image);
        assert_eq!(payload["type"], "image");
        assert_eq!(payload["image"], image);
        assert!(payload.get("text").is_none());
    }

    #[test]
    fn message_type_cannot_shadow_the_envelope() {
        for reserved in ["to", "type", "messaging_product", "recipient_type"] {
            let err = check_message_type(reserved).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
        assert!(check_message_type("").is_err());
        assert!(check_message_type("Text").is_err());
        for allowed in ["text", "image", "document", "interactive"] {
            assert!(check_message_type(allowed).is_ok());
        }
    }

    #[tokio::test]
    async fn send_rejects_envelope_message_type_before_any_request() {
        let state = crate::app::test_state();
        let connection = WhatsAppConnection {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            phone_number: "+52 55 5000".to_string(),
            phone_number_id: "pn1".to_string(),
            waba_id: "w1".to_string(),
            business_name: None,
            access_token: Some("token".to_string()),
            status: "connected".to_string(),
            connected_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let err = send_message(&state, &connection, "5215550001", "to", &json!({ "body": "x" }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stored_content_serializes_objects() {
        assert_eq!(message_content(&json!("hola")), "hola");
        assert_eq!(message_content(&json!({ "a": 1 })), r#"{"a":1}"#);
        assert!(message_is_empty(&json!("  ")));
        assert!(message_is_empty(&Value::Null));
        assert!(!message_is_empty(&json!({ "link": "x" })));
    }

    #[test]
    fn upstream_error_text_and_message_id() {
        let err = json!({ "error": { "message": "Invalid OAuth access token", "code": 190 } });
        assert_eq!(upstream_error_message(&err), "Invalid OAuth access token");
        assert_eq!(upstream_error_message(&json!({})), "failed to send message");
        let ok = json!({ "messages": [{ "id": "wamid.ABC" }] });
        assert_eq!(sent_message_id(&ok).as_deref(), Some("wamid.ABC"));
    }

    fn sample_messages_value() -> Value {
        json!({
            "messaging_product": "whatsapp",
            "metadata": { "phone_number_id": "PNID" },
            "contacts": [{ "wa_id": "5215550001", "profile": { "name": " Ana " } }],
            "messages": [
                { "from": "5215550001", "id": "wamid.1", "type": "text", "text": { "body": " hola " } },
                { "from": "5215550001", "id": "wamid.2", "type": "image", "image": { "id": "MEDIA" } },
                { "from": "5215550001", "id": "wamid.3", "type": "interactive",
                  "interactive": { "list_reply": { "title": "Ventas" } } },
                { "id": "wamid.4", "type": "text", "text": { "body": "no sender" } }
            ]
        })
    }

    #[test]
    fn parses_inbound_messages() {
        let messages = inbound_messages(&sample_messages_value());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text.as_deref(), Some("hola"));
        assert_eq!(messages[0].content, "hola");
        assert_eq!(messages[0].whatsapp_id.as_deref(), Some("wamid.1"));
        assert_eq!(messages[1].text, None);
        assert_eq!(messages[1].content, r#"{"id":"MEDIA"}"#);
        assert_eq!(messages[2].text.as_deref(), Some("Ventas"));
    }

    #[test]
    fn profile_names_by_wa_id() {
        let names = contact_profile_names(&sample_messages_value());
        assert_eq!(names.get("5215550001").map(String::as_str), Some("Ana"));
    }

    #[test]
    fn statuses_and_template_events() {
        let value = json!({ "statuses": [
            { "id": "wamid.9", "status": "delivered" },
            { "id": "wamid.10" }
        ]});
        assert_eq!(status_updates(&value), vec![("wamid.9".to_string(), "delivered".to_string())]);

        let template = json!({ "event": "APPROVED", "message_template_name": "bienvenida" });
        assert_eq!(
            template_status(&template),
            Some(("bienvenida".to_string(), "approved".to_string()))
        );
        assert_eq!(template_status(&json!({ "event": "APPROVED" })), None);
    }

    #[test]
    fn webhook_payload_tolerates_missing_fields() {
        let payload: WebhookPayload = serde_json::from_value(json!({ "object": "page" })).unwrap();
        assert!(payload.entry.is_empty());
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{ "id": "WABA", "changes": [{ "field": "messages" }] }]
        }))
        .unwrap();
        assert_eq!(payload.entry[0].changes[0].field, "messages");
        assert!(payload.entry[0].changes[0].value.is_null());
    }

    #[test]
    fn signature_verification() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature("secret", Some(&sig), body));
        assert!(!verify_signature("secret", Some("sha256=00ff"), body));
        assert!(!verify_signature("secret", None, body));
        assert!(verify_signature("", None, body));
    }
}
