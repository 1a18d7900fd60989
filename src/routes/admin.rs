//! Platform-wide views for the `admin` role.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::{
    app::{clamp_limit, require_admin, AppState},
    error::{ApiError, ApiResult},
    export::{self, ExportFormat, Table},
    routes::stats::{day_key, day_start, recent_days},
    types::{AdminExportQuery, PageQuery, WebhookLog, WhatsAppConnection, CONNECTION_COLUMNS},
};

const EXPORT_ROW_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Users,
    Connections,
    Messages,
    Webhooks,
}

impl ExportKind {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("users") {
            "users" => Some(Self::Users),
            "connections" => Some(Self::Connections),
            "messages" => Some(Self::Messages),
            "webhooks" => Some(Self::Webhooks),
            _ => None,
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Users => "usuarios",
            Self::Connections => "conexiones",
            Self::Messages => "mensajes",
            Self::Webhooks => "webhooks",
        }
    }

    pub fn headers(self) -> Vec<&'static str> {
        match self {
            Self::Users => vec!["ID", "Email", "Nombre", "Rol", "Conexiones", "Webhooks", "Fecha Registro"],
            Self::Connections => vec![
                "ID",
                "Usuario",
                "Nombre Usuario",
                "Teléfono",
                "ID Teléfono",
                "WABA ID",
                "Negocio",
                "Estado",
                "Fecha Conexión",
                "Fecha Creación",
            ],
            Self::Messages => vec![
                "ID",
                "Dirección",
                "De",
                "Para",
                "Tipo",
                "Contenido",
                "Estado",
                "ID WhatsApp",
                "Fecha",
            ],
            Self::Webhooks => vec!["ID", "Evento", "Usuario", "Teléfono", "Procesado", "Payload", "Fecha"],
        }
    }
}

fn text(row: &sqlx::postgres::PgRow, column: &str) -> String {
    row.get::<Option<String>, _>(column).unwrap_or_default()
}

async fn export_table(db: &PgPool, kind: ExportKind) -> Result<Table, sqlx::Error> {
    let mut table = Table::new(kind.headers());
    match kind {
        ExportKind::Users => {
            let rows = sqlx::query(
                "SELECT u.id, u.email, u.name, u.role, u.created_at, \
                 (SELECT COUNT(*) FROM whatsapp_connections c WHERE c.user_id = u.id) AS connections, \
                 (SELECT COUNT(*) FROM webhook_logs w WHERE w.user_id = u.id) AS webhooks \
                 FROM users u ORDER BY u.created_at DESC",
            )
            .fetch_all(db)
            .await?;
            for row in rows {
                table.push(vec![
                    text(&row, "id"),
                    text(&row, "email"),
                    text(&row, "name"),
                    text(&row, "role"),
                    row.get::<i64, _>("connections").to_string(),
                    row.get::<i64, _>("webhooks").to_string(),
                    text(&row, "created_at"),
                ]);
            }
        }
        ExportKind::Connections => {
            let rows = sqlx::query(
                "SELECT c.id, u.email, u.name AS user_name, c.phone_number, c.phone_number_id, c.waba_id, \
                 c.business_name, c.status, c.connected_at, c.created_at \
                 FROM whatsapp_connections c JOIN users u ON u.id = c.user_id ORDER BY c.created_at DESC",
            )
            .fetch_all(db)
            .await?;
            for row in rows {
                table.push(
                    [
                        "id",
                        "email",
                        "user_name",
                        "phone_number",
                        "phone_number_id",
                        "waba_id",
                        "business_name",
                        "status",
                        "connected_at",
                        "created_at",
                    ]
                    .iter()
                    .map(|column| text(&row, column))
                    .collect(),
                );
            }
        }
        ExportKind::Messages => {
            let rows = sqlx::query(
                "SELECT id, direction, from_number, to_number, message_type, content, status, \
                 whatsapp_message_id, created_at FROM messages ORDER BY created_at DESC LIMIT $1",
            )
            .bind(EXPORT_ROW_LIMIT)
            .fetch_all(db)
            .await?;
            for row in rows {
                table.push(vec![
                    text(&row, "id"),
                    text(&row, "direction"),
                    text(&row, "from_number"),
                    text(&row, "to_number"),
                    text(&row, "message_type"),
                    export::truncate_cell(&text(&row, "content")),
                    text(&row, "status"),
                    text(&row, "whatsapp_message_id"),
                    text(&row, "created_at"),
                ]);
            }
        }
        ExportKind::Webhooks => {
            let rows = sqlx::query(
                "SELECT w.id, w.event_type, u.email, c.phone_number, w.processed, w.payload, w.created_at \
                 FROM webhook_logs w \
                 LEFT JOIN users u ON u.id = w.user_id \
                 LEFT JOIN whatsapp_connections c ON c.id = w.connection_id \
                 ORDER BY w.created_at DESC LIMIT $1",
            )
            .bind(EXPORT_ROW_LIMIT)
            .fetch_all(db)
            .await?;
            for row in rows {
                let processed = if row.get::<bool, _>("processed") { "Sí" } else { "No" };
                table.push(vec![
                    text(&row, "id"),
                    text(&row, "event_type"),
                    text(&row, "email"),
                    text(&row, "phone_number"),
                    processed.to_string(),
                    export::truncate_cell(&text(&row, "payload")),
                    text(&row, "created_at"),
                ]);
            }
        }
    }
    Ok(table)
}

pub async fn users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    let mut connections: HashMap<String, Vec<WhatsAppConnection>> = HashMap::new();
    for row in sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections ORDER BY created_at ASC"
    ))
    .fetch_all(&state.db)
    .await?
    {
        let connection = WhatsAppConnection::from_row(&row);
        connections.entry(connection.user_id.clone()).or_default().push(connection);
    }

    let rows = sqlx::query(
        "SELECT u.id, u.email, u.name, u.role, u.created_at, u.updated_at, \
         (SELECT COUNT(*) FROM webhook_logs w WHERE w.user_id = u.id) AS webhook_count \
         FROM users u ORDER BY u.created_at DESC",
    )
    .fetch_all(&state.db)
    .await?;
    let users = rows
        .iter()
        .map(|row| {
            let id: String = row.get("id");
            json!({
                "id": id,
                "email": row.get::<String, _>("email"),
                "name": row.get::<String, _>("name"),
                "role": row.get::<String, _>("role"),
                "createdAt": row.get::<String, _>("created_at"),
                "updatedAt": row.get::<String, _>("updated_at"),
                "webhookCount": row.get::<i64, _>("webhook_count"),
                "whatsappConnections": connections.remove(&id).unwrap_or_default(),
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "users": users })))
}

async fn counts_by_day(db: &PgPool, table: &str, since: &str) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT substr(created_at, 1, 10) AS day, COUNT(*) AS n FROM {table} \
         WHERE created_at >= $1 GROUP BY day"
    ))
    .bind(since)
    .fetch_all(db)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>("day"), row.get::<i64, _>("n")))
        .collect())
}

async fn scalar(db: &PgPool, sql: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(sql).fetch_one(db).await
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    let db = &state.db;

    let week_ago = (Utc::now() - Duration::days(7)).to_rfc3339_opts(SecondsFormat::Millis, true);
    let new_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE created_at >= $1")
        .bind(&week_ago)
        .fetch_one(db)
        .await?;
    let overview = json!({
        "totalUsers": scalar(db, "SELECT COUNT(*) FROM users").await?,
        "newUsersLast7Days": new_users,
        "totalConnections": scalar(db, "SELECT COUNT(*) FROM whatsapp_connections").await?,
        "activeConnections": scalar(db, "SELECT COUNT(*) FROM whatsapp_connections WHERE status = 'connected'").await?,
        "totalMessages": scalar(db, "SELECT COUNT(*) FROM messages").await?,
        "inboundMessages": scalar(db, "SELECT COUNT(*) FROM messages WHERE direction = 'inbound'").await?,
        "outboundMessages": scalar(db, "SELECT COUNT(*) FROM messages WHERE direction = 'outbound'").await?,
        "totalWebhooks": scalar(db, "SELECT COUNT(*) FROM webhook_logs").await?,
    });

    let days = recent_days(Utc::now().date_naive(), 30);
    let since = days.first().map(|d| day_start(*d)).unwrap_or_default();
    let users = counts_by_day(db, "users", &since).await?;
    let messages = counts_by_day(db, "messages", &since).await?;
    let webhooks = counts_by_day(db, "webhook_logs", &since).await?;
    let daily_data = days
        .iter()
        .map(|day| {
            let key = day_key(*day);
            json!({
                "date": day.format("%m/%d").to_string(),
                "users": users.get(&key).copied().unwrap_or(0),
                "messages": messages.get(&key).copied().unwrap_or(0),
                "webhooks": webhooks.get(&key).copied().unwrap_or(0),
            })
        })
        .collect::<Vec<_>>();

    let recent_users = sqlx::query("SELECT id, email, name, created_at FROM users ORDER BY created_at DESC LIMIT 5")
        .fetch_all(db)
        .await?
        .iter()
        .map(|row| {
            json!({
                "id": row.get::<String, _>("id"),
                "email": row.get::<String, _>("email"),
                "name": row.get::<String, _>("name"),
                "createdAt": row.get::<String, _>("created_at"),
            })
        })
        .collect::<Vec<_>>();

    let recent_connections = sqlx::query(
        "SELECT c.id, c.phone_number, c.business_name, c.status, c.created_at, u.email, u.name \
         FROM whatsapp_connections c JOIN users u ON u.id = c.user_id \
         ORDER BY c.created_at DESC LIMIT 5",
    )
    .fetch_all(db)
    .await?
    .iter()
    .map(|row| {
        json!({
            "id": row.get::<String, _>("id"),
            "phoneNumber": row.get::<String, _>("phone_number"),
            "businessName": row.get::<Option<String>, _>("business_name"),
            "status": row.get::<String, _>("status"),
            "createdAt": row.get::<String, _>("created_at"),
            "user": { "email": row.get::<String, _>("email"), "name": row.get::<String, _>("name") },
        })
    })
    .collect::<Vec<_>>();

    Ok(Json(json!({
        "overview": overview,
        "dailyData": daily_data,
        "recentUsers": recent_users,
        "recentConnections": recent_connections,
    })))
}

/// Total pages for `total` rows, at least zero.
pub fn page_count(total: i64, limit: i64) -> i64 {
    if limit <= 0 {
        0
    } else {
        (total + limit - 1) / limit
    }
}

pub async fn webhooks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    let limit = clamp_limit(query.limit, 50, 500);
    let page = query.page.filter(|p| *p > 0).unwrap_or(1);

    let rows = sqlx::query(
        "SELECT w.id, w.connection_id, w.user_id, w.event_type, w.payload, w.processed, w.created_at, \
         u.email, u.name, c.phone_number, c.business_name \
         FROM webhook_logs w \
         LEFT JOIN users u ON u.id = w.user_id \
         LEFT JOIN whatsapp_connections c ON c.id = w.connection_id \
         ORDER BY w.created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind((page - 1) * limit)
    .fetch_all(&state.db)
    .await?;
    let total = scalar(&state.db, "SELECT COUNT(*) FROM webhook_logs").await?;

    let logs = rows
        .iter()
        .map(|row| {
            let log = WebhookLog {
                id: row.get("id"),
                connection_id: row.get("connection_id"),
                user_id: row.get("user_id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                processed: row.get("processed"),
                created_at: row.get("created_at"),
            };
            let mut value = serde_json::to_value(&log).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut value {
                map.insert(
                    "user".to_string(),
                    row.get::<Option<String>, _>("email")
                        .map(|email| json!({ "email": email, "name": row.get::<Option<String>, _>("name") }))
                        .unwrap_or(Value::Null),
                );
                map.insert(
                    "connection".to_string(),
                    row.get::<Option<String>, _>("phone_number")
                        .map(|phone| {
                            json!({
                                "phoneNumber": phone,
                                "businessName": row.get::<Option<String>, _>("business_name"),
                            })
                        })
                        .unwrap_or(Value::Null),
                );
            }
            value
        })
        .collect::<Vec<_>>();

    Ok(Json(json!({
        "webhookLogs": logs,
        "pagination": {
            "total": total,
            "page": page,
            "limit": limit,
            "pages": page_count(total, limit),
        },
    })))
}

pub async fn export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminExportQuery>,
) -> ApiResult<Response> {
    let admin = require_admin(&state, &headers).await?;
    let kind = ExportKind::parse(query.kind.as_deref())
        .ok_or_else(|| ApiError::bad_request("invalid export type"))?;
    let format = match ExportFormat::parse(query.format.as_deref(), ExportFormat::Xlsx) {
        Some(ExportFormat::Csv) => ExportFormat::Csv,
        Some(ExportFormat::Xlsx) => ExportFormat::Xlsx,
        _ => return Err(ApiError::bad_request("format must be xlsx or csv")),
    };

    let table = export_table(&state.db, kind).await?;
    tracing::info!(admin_id = %admin.id, ?kind, rows = table.rows.len(), "admin export");
    let stamp = Utc::now().format("%Y-%m-%d").to_string();
    let response = if format == ExportFormat::Csv {
        export::attachment(
            export::CSV_CONTENT_TYPE,
            &export::filename(kind.file_prefix(), &stamp, "csv"),
            export::to_csv(&table)?,
        )
    } else {
        export::attachment(
            export::XLSX_CONTENT_TYPE,
            &export::filename(kind.file_prefix(), &stamp, "xlsx"),
            export::to_xlsx(&table)?,
        )
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    #[test]
    fn export_kinds_default_to_users() {
        assert_eq!(ExportKind::parse(None), Some(ExportKind::Users));
        assert_eq!(ExportKind::parse(Some("webhooks")), Some(ExportKind::Webhooks));
        assert_eq!(ExportKind::parse(Some("contacts")), None);
    }

    #[test]
    fn export_headers_are_spanish() {
        assert_eq!(ExportKind::Users.headers()[6], "Fecha Registro");
        assert_eq!(ExportKind::Connections.headers().len(), 10);
        assert_eq!(ExportKind::Messages.headers()[1], "Dirección");
        assert_eq!(ExportKind::Webhooks.file_prefix(), "webhooks");
    }

    #[test]
    fn pages_round_up() {
        assert_eq!(page_count(0, 50), 0);
        assert_eq!(page_count(50, 50), 1);
        assert_eq!(page_count(51, 50), 2);
        assert_eq!(page_count(10, 0), 0);
    }

    #[tokio::test]
    async fn admin_routes_require_a_session() {
        let app = crate::app::router(crate::app::test_state());
        for uri in ["/api/admin/users", "/api/admin/stats", "/api/admin/webhooks", "/api/admin/export"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }
}
