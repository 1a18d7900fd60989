//! Background dispatcher for scheduled messages.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    app::{create_notification, now_iso, AppState},
    types::{ScheduledMessage, WhatsAppConnection, CONNECTION_COLUMNS, SCHEDULED_COLUMNS},
    whatsapp,
};

const BATCH_SIZE: i64 = 50;

/// Normalizes an RFC 3339 timestamp to the UTC millisecond form used for
/// stored timestamps so that text comparison orders correctly.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Message type and body for the Cloud API. Media types without a URL
/// degrade to plain text.
pub fn scheduled_payload(message: &ScheduledMessage) -> (String, Value) {
    let media_url = message
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty());
    match (message.message_type.as_str(), media_url) {
        ("image" | "video" | "document", Some(link)) => (
            message.message_type.clone(),
            json!({ "link": link, "caption": message.content }),
        ),
        ("audio", Some(link)) => ("audio".to_string(), json!({ "link": link })),
        _ => ("text".to_string(), Value::String(message.content.clone())),
    }
}

pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.scheduler_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match dispatch_due(&state).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "scheduled messages dispatched"),
                Err(err) => tracing::warn!(error = %err, "scheduled dispatch failed"),
            }
        }
    })
}

/// Claims left in `sending` longer than this are treated as abandoned.
pub const STALE_CLAIM_SECS: i64 = 600;

/// Claims due `pending` rows and `sending` rows whose claim went stale.
const CLAIMABLE: &str = "scheduled_at <= $1 AND \
     (status = 'pending' OR (status = 'sending' AND updated_at < $3))";

/// Cutoff below which a `sending` claim counts as abandoned.
pub fn stale_claim_cutoff(now: DateTime<Utc>) -> String {
    (now - chrono::Duration::seconds(STALE_CLAIM_SECS)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn claim_due(state: &Arc<AppState>) -> Result<Vec<ScheduledMessage>, sqlx::Error> {
    let now = Utc::now();
    let rows = sqlx::query(&format!(
        "UPDATE scheduled_messages SET status = 'sending', updated_at = $1 \
         WHERE id IN ( \
           SELECT id FROM scheduled_messages WHERE {CLAIMABLE} \
           ORDER BY scheduled_at ASC LIMIT $2 \
           FOR UPDATE SKIP LOCKED) \
         RETURNING {SCHEDULED_COLUMNS}"
    ))
    .bind(now.to_rfc3339_opts(SecondsFormat::Millis, true))
    .bind(BATCH_SIZE)
    .bind(stale_claim_cutoff(now))
    .fetch_all(&state.db)
    .await?;
    Ok(rows.iter().map(ScheduledMessage::from_row).collect())
}

/// Claims and sends every due message. Returns how many were claimed.
pub async fn dispatch_due(state: &Arc<AppState>) -> Result<usize, sqlx::Error> {
    let due = claim_due(state).await?;
    for message in &due {
        if let Err(err) = complete(state, message).await {
            tracing::warn!(scheduled_id = %message.id, error = %err, "scheduled message left claimed");
        }
    }
    Ok(due.len())
}

/// Sends one claimed message and records the outcome. Rows no longer in
/// `sending` (cancelled meanwhile) keep their status.
async fn complete(state: &Arc<AppState>, message: &ScheduledMessage) -> Result<(), sqlx::Error> {
    match deliver(state, message).await {
        Ok(()) => {
            sqlx::query(
                "UPDATE scheduled_messages SET status = 'sent', sent_at = $1, error = NULL, updated_at = $1 \
                 WHERE id = $2 AND status = 'sending'",
            )
            .bind(now_iso())
            .bind(&message.id)
            .execute(&state.db)
            .await?;
        }
        Err(reason) => {
            tracing::warn!(scheduled_id = %message.id, %reason, "scheduled message failed");
            let updated = sqlx::query(
                "UPDATE scheduled_messages SET status = 'failed', error = $1, updated_at = $2 \
                 WHERE id = $3 AND status = 'sending'",
            )
            .bind(&reason)
            .bind(now_iso())
            .bind(&message.id)
            .execute(&state.db)
            .await?
            .rows_affected();
            if updated > 0 {
                create_notification(
                    &state.db,
                    &message.user_id,
                    "scheduled_failed",
                    "Mensaje programado fallido",
                    &format!("No se pudo enviar el mensaje a {}: {reason}", message.recipient_phone),
                    Some("/dashboard/scheduled"),
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn deliver(state: &Arc<AppState>, message: &ScheduledMessage) -> Result<(), String> {
    let row = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections WHERE id = $1 AND user_id = $2"
    ))
    .bind(&message.connection_id)
    .bind(&message.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|err| err.to_string())?;
    let Some(row) = row else {
        return Err("connection not found".to_string());
    };
    let connection = WhatsAppConnection::from_row(&row);

    let (message_type, body) = scheduled_payload(message);
    whatsapp::send_and_record(state, &connection, &message.recipient_phone, &message_type, &body)
        .await
        .map(|_| ())
        .map_err(|err| err.to_string())
}
