//! HTTP handlers, one module per resource.

pub mod admin;
pub mod api_keys;
pub mod auth;
pub mod connections;
pub mod contacts;
pub mod flows;
pub mod notifications;
pub mod public_api;
pub mod quick_replies;
pub mod scheduled;
pub mod stats;
pub mod templates;
pub mod webhooks;

use std::sync::Arc;

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    types::{WhatsAppConnection, CONNECTION_COLUMNS},
};

/// Trimmed value, `None` when absent or blank.
pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn required(value: &str, field: &str) -> ApiResult<String> {
    non_blank(Some(value)).ok_or_else(|| ApiError::bad_request(format!("{field} is required")))
}

pub(crate) fn required_id(id: Option<&str>) -> ApiResult<String> {
    non_blank(id).ok_or_else(|| ApiError::bad_request("id is required"))
}

pub(crate) async fn owned_connection(
    state: &Arc<AppState>,
    user_id: &str,
    connection_id: &str,
) -> ApiResult<WhatsAppConnection> {
    let row = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM whatsapp_connections WHERE id = $1 AND user_id = $2"
    ))
    .bind(connection_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("connection not found"))?;
    Ok(WhatsAppConnection::from_row(&row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_missing() {
        assert_eq!(non_blank(Some("  x ")).as_deref(), Some("x"));
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(None), None);
    }

    #[test]
    fn required_names_the_field() {
        let err = required(" ", "phoneNumber").unwrap_err();
        assert_eq!(err.to_string(), "phoneNumber is required");
        assert_eq!(required(" 52 ", "phoneNumber").unwrap(), "52");
    }
}
