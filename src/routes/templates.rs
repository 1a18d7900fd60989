use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use regex::Regex;
use serde_json::{json, Value};

use crate::{
    app::{auth_user_from_headers, json_text, new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, required_id},
    types::{CreateTemplateBody, IdQuery, MessageTemplate},
};

const COLUMNS: &str = "id, user_id, name, content, category, variables, status, created_at, updated_at";

/// Distinct `{{n}}` placeholder numbers in `content`, ascending.
pub fn placeholder_indexes(content: &str) -> Vec<usize> {
    let Ok(re) = Regex::new(r"\{\{(\d+)\}\}") else {
        return Vec::new();
    };
    let mut indexes = re
        .captures_iter(content)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<usize>().ok())
        .collect::<Vec<_>>();
    indexes.sort_unstable();
    indexes.dedup();
    indexes
}

/// Explicit variables win; otherwise placeholders found in the body are listed.
fn template_variables(explicit: Option<Value>, content: &str) -> Option<Value> {
    match explicit {
        Some(Value::Null) | None => {
            let found = placeholder_indexes(content);
            (!found.is_empty()).then(|| json!(found.iter().map(|i| format!("{{{{{i}}}}}")).collect::<Vec<_>>()))
        }
        Some(value) => Some(value),
    }
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM message_templates WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let templates = rows.iter().map(MessageTemplate::from_row).collect::<Vec<_>>();
    Ok(Json(json!({ "templates": templates })))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(name), Some(content)) = (non_blank(Some(body.name.as_str())), non_blank(Some(body.content.as_str())))
    else {
        return Err(ApiError::bad_request("name and content are required"));
    };

    let now = now_iso();
    let template = MessageTemplate {
        id: new_id(),
        user_id: user.id.clone(),
        variables: template_variables(body.variables, &content),
        name,
        content,
        category: non_blank(body.category.as_deref()).unwrap_or_else(|| "general".to_string()),
        status: "pending".to_string(),
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(&format!(
        "INSERT INTO message_templates ({COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
    ))
    .bind(&template.id)
    .bind(&template.user_id)
    .bind(&template.name)
    .bind(&template.content)
    .bind(&template.category)
    .bind(template.variables.as_ref().map(json_text))
    .bind(&template.status)
    .bind(&template.created_at)
    .bind(&template.updated_at)
    .execute(&state.db)
    .await?;
    tracing::info!(template_id = %template.id, name = %template.name, "template created");
    Ok((StatusCode::CREATED, Json(json!({ "template": template }))))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query("DELETE FROM message_templates WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("template not found"));
    }
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_sorted_and_unique() {
        assert_eq!(placeholder_indexes("Hola {{2}}, tu pedido {{1}} ({{2}})"), vec![1, 2]);
        assert!(placeholder_indexes("sin variables {{x}}").is_empty());
    }

    #[test]
    fn explicit_variables_are_kept() {
        let explicit = json!(["nombre"]);
        assert_eq!(template_variables(Some(explicit.clone()), "{{1}}"), Some(explicit));
    }

    #[test]
    fn variables_fall_back_to_placeholders() {
        assert_eq!(
            template_variables(None, "Hola {{1}}, total {{2}}"),
            Some(json!(["{{1}}", "{{2}}"]))
        );
        assert_eq!(template_variables(Some(Value::Null), "Hola"), None);
    }
}
