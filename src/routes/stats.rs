//! Per-user dashboard figures and the conversation export.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Row};

use crate::{
    app::{auth_user_from_headers, now_iso, AppState},
    error::{ApiError, ApiResult},
    export::{self, ExportFormat},
    routes::non_blank,
    scheduler::normalize_timestamp,
    types::{ExportQuery, Message, MESSAGE_COLUMNS},
};

const OWNED_MESSAGES: &str =
    "connection_id IN (SELECT id FROM whatsapp_connections WHERE user_id = $1)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayBucket {
    /// `dd/MM`.
    pub date: String,
    /// Short weekday name.
    pub name: String,
    pub inbound: i64,
    pub outbound: i64,
    pub total: i64,
}

/// The `days` calendar days ending at `today`, oldest first.
pub fn recent_days(today: NaiveDate, days: i64) -> Vec<NaiveDate> {
    (0..days)
        .rev()
        .map(|offset| today - Duration::days(offset))
        .collect()
}

/// `YYYY-MM-DD`, the prefix of every stored timestamp.
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Start of `day` in the stored timestamp form.
pub fn day_start(day: NaiveDate) -> String {
    format!("{}T00:00:00.000Z", day_key(day))
}

/// One bucket per day; days without traffic are zero.
pub fn fill_buckets(today: NaiveDate, days: i64, counts: &HashMap<String, (i64, i64)>) -> Vec<DayBucket> {
    recent_days(today, days)
        .into_iter()
        .map(|day| {
            let (inbound, outbound) = counts.get(&day_key(day)).copied().unwrap_or((0, 0));
            DayBucket {
                date: day.format("%d/%m").to_string(),
                name: day.format("%a").to_string(),
                inbound,
                outbound,
                total: inbound + outbound,
            }
        })
        .collect()
}

/// Inclusive export bound from an RFC 3339 timestamp or a bare `YYYY-MM-DD`.
pub fn export_bound(raw: &str, end_of_day: bool) -> Option<String> {
    if let Some(ts) = normalize_timestamp(raw) {
        return Some(ts);
    }
    let day = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()?;
    Some(if end_of_day {
        format!("{}T23:59:59.999Z", day_key(day))
    } else {
        day_start(day)
    })
}

async fn count(db: &PgPool, sql: &str, user_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(sql).bind(user_id).fetch_one(db).await
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let db = &state.db;

    let connections = count(db, "SELECT COUNT(*) FROM whatsapp_connections WHERE user_id = $1", &user.id).await?;
    let total_contacts = count(db, "SELECT COUNT(*) FROM contacts WHERE user_id = $1", &user.id).await?;
    let pending_scheduled = count(
        db,
        "SELECT COUNT(*) FROM scheduled_messages WHERE user_id = $1 AND status = 'pending'",
        &user.id,
    )
    .await?;
    let totals = sqlx::query(&format!(
        "SELECT COUNT(*) AS total, \
         COUNT(*) FILTER (WHERE direction = 'inbound') AS inbound, \
         COUNT(*) FILTER (WHERE direction = 'outbound') AS outbound \
         FROM messages WHERE {OWNED_MESSAGES}"
    ))
    .bind(&user.id)
    .fetch_one(db)
    .await?;

    let today = Utc::now().date_naive();
    let since = recent_days(today, 7).first().map(|d| day_start(*d)).unwrap_or_else(now_iso);
    let mut per_day: HashMap<String, (i64, i64)> = HashMap::new();
    for row in sqlx::query(&format!(
        "SELECT substr(created_at, 1, 10) AS day, direction, COUNT(*) AS n FROM messages \
         WHERE {OWNED_MESSAGES} AND created_at >= $2 GROUP BY day, direction"
    ))
    .bind(&user.id)
    .bind(&since)
    .fetch_all(db)
    .await?
    {
        let entry = per_day.entry(row.get("day")).or_default();
        match row.get::<String, _>("direction").as_str() {
            "inbound" => entry.0 += row.get::<i64, _>("n"),
            "outbound" => entry.1 += row.get::<i64, _>("n"),
            _ => {}
        }
    }

    let status_data = sqlx::query(&format!(
        "SELECT status, COUNT(*) AS n FROM messages WHERE {OWNED_MESSAGES} GROUP BY status ORDER BY n DESC"
    ))
    .bind(&user.id)
    .fetch_all(db)
    .await?
    .iter()
    .map(|row| json!({ "name": row.get::<String, _>("status"), "value": row.get::<i64, _>("n") }))
    .collect::<Vec<_>>();

    let top_contacts = sqlx::query(&format!(
        "SELECT from_number, COUNT(*) AS n FROM messages WHERE {OWNED_MESSAGES} AND direction = 'inbound' \
         GROUP BY from_number ORDER BY n DESC, from_number ASC LIMIT 5"
    ))
    .bind(&user.id)
    .fetch_all(db)
    .await?
    .iter()
    .map(|row| json!({ "phone": row.get::<String, _>("from_number"), "messages": row.get::<i64, _>("n") }))
    .collect::<Vec<_>>();

    let recent = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {OWNED_MESSAGES} ORDER BY created_at DESC LIMIT 10"
    ))
    .bind(&user.id)
    .fetch_all(db)
    .await?
    .iter()
    .map(Message::from_row)
    .collect::<Vec<_>>();

    Ok(Json(json!({
        "summary": {
            "totalContacts": total_contacts,
            "totalMessages": totals.get::<i64, _>("total"),
            "messagesIn": totals.get::<i64, _>("inbound"),
            "messagesOut": totals.get::<i64, _>("outbound"),
            "pendingScheduled": pending_scheduled,
            "connections": connections,
        },
        "charts": {
            "last7Days": fill_buckets(today, 7, &per_day),
            "statusData": status_data,
            "topContacts": top_contacts,
        },
        "recentActivity": recent,
    })))
}

pub async fn export_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let format = ExportFormat::parse(query.format.as_deref(), ExportFormat::Csv)
        .ok_or_else(|| ApiError::bad_request("format must be csv, json or xlsx"))?;
    let start = match non_blank(query.start_date.as_deref()) {
        Some(raw) => Some(export_bound(&raw, false).ok_or_else(|| ApiError::bad_request("invalid startDate"))?),
        None => None,
    };
    let end = match non_blank(query.end_date.as_deref()) {
        Some(raw) => Some(export_bound(&raw, true).ok_or_else(|| ApiError::bad_request("invalid endDate"))?),
        None => None,
    };

    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {OWNED_MESSAGES} \
         AND ($2::TEXT IS NULL OR connection_id = $2) \
         AND ($3::TEXT IS NULL OR created_at >= $3) \
         AND ($4::TEXT IS NULL OR created_at <= $4) \
         ORDER BY created_at ASC"
    ))
    .bind(&user.id)
    .bind(non_blank(query.connection_id.as_deref()))
    .bind(&start)
    .bind(&end)
    .fetch_all(&state.db)
    .await?;
    let messages = rows.iter().map(Message::from_row).collect::<Vec<_>>();
    tracing::info!(user_id = %user.id, count = messages.len(), ?format, "conversation export");

    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    match format {
        ExportFormat::Csv => {
            let body = export::to_csv(&export::conversation_table(&messages))?;
            Ok(export::attachment(
                export::CSV_CONTENT_TYPE,
                &export::filename("conversaciones", &stamp, "csv"),
                body,
            ))
        }
        ExportFormat::Xlsx => {
            let body = export::to_xlsx(&export::conversation_table(&messages))?;
            Ok(export::attachment(
                export::XLSX_CONTENT_TYPE,
                &export::filename("conversaciones", &stamp, "xlsx"),
                body,
            ))
        }
        ExportFormat::Json => {
            let entries = messages
                .iter()
                .map(|msg| {
                    let (date, time) = export::split_timestamp(&msg.created_at);
                    json!({
                        "date": format!("{date} {time}").trim_end().to_string(),
                        "from": msg.from_number,
                        "to": msg.to_number,
                        "type": msg.message_type,
                        "content": msg.content,
                        "status": msg.status,
                    })
                })
                .collect::<Vec<_>>();
            Ok(Json(json!({
                "exportedAt": now_iso(),
                "totalMessages": entries.len(),
                "messages": entries,
            }))
            .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn buckets_cover_seven_days_oldest_first() {
        let mut counts = HashMap::new();
        counts.insert("2024-03-05".to_string(), (3, 2));
        counts.insert("2024-02-29".to_string(), (1, 0));
        counts.insert("2024-01-01".to_string(), (9, 9));

        let buckets = fill_buckets(day("2024-03-05"), 7, &counts);
        assert_eq!(buckets.len(), 7);
        assert_eq!(buckets[0].date, "28/02");
        assert_eq!(buckets[1].date, "29/02");
        assert_eq!(buckets[1].inbound, 1);
        assert_eq!(buckets[6].date, "05/03");
        assert_eq!(buckets[6].name, "Tue");
        assert_eq!(buckets[6].total, 5);
        assert_eq!(buckets.iter().map(|b| b.total).sum::<i64>(), 6);
    }

    #[test]
    fn bounds_accept_dates_and_timestamps() {
        assert_eq!(export_bound("2024-03-05", false).as_deref(), Some("2024-03-05T00:00:00.000Z"));
        assert_eq!(export_bound("2024-03-05", true).as_deref(), Some("2024-03-05T23:59:59.999Z"));
        assert_eq!(
            export_bound("2024-03-05T10:00:00+02:00", false).as_deref(),
            Some("2024-03-05T08:00:00.000Z")
        );
        assert_eq!(export_bound("ayer", false), None);
    }

    #[test]
    fn recent_days_end_today() {
        let days = recent_days(day("2024-01-02"), 3);
        assert_eq!(days, vec![day("2023-12-31"), day("2024-01-01"), day("2024-01-02")]);
    }
}
