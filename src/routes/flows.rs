use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use sqlx::{Postgres, Transaction};

use crate::{
    app::{auth_user_from_headers, new_id, now_iso, AppState},
    chatbot::attach_nodes,
    error::{ApiError, ApiResult},
    llm::{self, ChatTurn, LlmError},
    prompting::playground_system_prompt,
    routes::{non_blank, required, required_id},
    types::{
        AiPlaygroundBody, ChatbotFlow, ChatbotNode, CreateFlowBody, FlowNodeInput, IdBody,
        UpdateFlowBody,
    },
};

const FLOW_COLUMNS: &str =
    "id, user_id, name, description, trigger_type, trigger_value, is_active, created_at, updated_at";
const AI_FALLBACK_REPLY: &str = "Lo siento, no pude generar una respuesta.";

/// Assigns fresh ids and positions. `next_node_id` values that name another
/// input node's client id are rewritten to that node's new id.
pub fn build_nodes(flow_id: &str, inputs: &[FlowNodeInput]) -> Vec<ChatbotNode> {
    let ids = inputs.iter().map(|_| new_id()).collect::<Vec<_>>();
    let client_ids = inputs
        .iter()
        .zip(&ids)
        .filter_map(|(input, id)| Some((input.id.clone()?, id.clone())))
        .collect::<HashMap<_, _>>();

    inputs
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(index, (input, id))| ChatbotNode {
            id,
            flow_id: flow_id.to_string(),
            node_type: input.node_type.trim().to_string(),
            content: input.content.clone(),
            options: input.options.clone(),
            next_node_id: non_blank(input.next_node_id.as_deref())
                .map(|next| client_ids.get(&next).cloned().unwrap_or(next)),
            position: input
                .position
                .filter(|p| *p != 0)
                .unwrap_or(index as i32),
        })
        .collect()
}

async fn insert_nodes(
    tx: &mut Transaction<'_, Postgres>,
    nodes: &[ChatbotNode],
) -> Result<(), sqlx::Error> {
    for node in nodes {
        sqlx::query(
            "INSERT INTO chatbot_nodes (id, flow_id, node_type, content, options, next_node_id, position) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&node.id)
        .bind(&node.flow_id)
        .bind(&node.node_type)
        .bind(&node.content)
        .bind(&node.options)
        .bind(&node.next_node_id)
        .bind(node.position)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn sorted(mut nodes: Vec<ChatbotNode>) -> Vec<ChatbotNode> {
    nodes.sort_by_key(|n| n.position);
    nodes
}

pub async fn list_flows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(&format!(
        "SELECT {FLOW_COLUMNS} FROM chatbot_flows WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let mut flows = rows.iter().map(ChatbotFlow::from_row).collect::<Vec<_>>();
    attach_nodes(&state.db, &mut flows).await?;
    Ok(Json(json!({ "flows": flows })))
}

pub async fn create_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFlowBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let name = required(&body.name, "name")?;
    let now = now_iso();
    let id = new_id();
    let nodes = build_nodes(&id, &body.nodes);
    let flow = ChatbotFlow {
        id,
        user_id: user.id.clone(),
        name,
        description: non_blank(body.description.as_deref()),
        trigger_type: non_blank(body.trigger_type.as_deref()).unwrap_or_else(|| "keyword".to_string()),
        trigger_value: non_blank(body.trigger_value.as_deref()),
        is_active: true,
        created_at: now.clone(),
        updated_at: now,
        nodes: sorted(nodes),
    };

    let mut tx = state.db.begin().await?;
    sqlx::query(
        "INSERT INTO chatbot_flows (id, user_id, name, description, trigger_type, trigger_value, is_active, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(&flow.id)
    .bind(&flow.user_id)
    .bind(&flow.name)
    .bind(&flow.description)
    .bind(&flow.trigger_type)
    .bind(&flow.trigger_value)
    .bind(flow.is_active)
    .bind(&flow.created_at)
    .bind(&flow.updated_at)
    .execute(&mut *tx)
    .await?;
    insert_nodes(&mut tx, &flow.nodes).await?;
    tx.commit().await?;
    tracing::info!(flow_id = %flow.id, nodes = flow.nodes.len(), "chatbot flow created");

    Ok((StatusCode::CREATED, Json(json!({ "flow": flow }))))
}

pub async fn update_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateFlowBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;
    let nodes = sorted(build_nodes(&id, &body.nodes));

    let mut tx = state.db.begin().await?;
    let row = sqlx::query(&format!(
        "UPDATE chatbot_flows SET \
         name = COALESCE($1, name), description = COALESCE($2, description), \
         trigger_type = COALESCE($3, trigger_type), trigger_value = COALESCE($4, trigger_value), \
         is_active = COALESCE($5, is_active), updated_at = $6 \
         WHERE id = $7 AND user_id = $8 RETURNING {FLOW_COLUMNS}"
    ))
    .bind(non_blank(body.name.as_deref()))
    .bind(&body.description)
    .bind(non_blank(body.trigger_type.as_deref()))
    .bind(&body.trigger_value)
    .bind(body.is_active)
    .bind(now_iso())
    .bind(&id)
    .bind(&user.id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::not_found("flow not found"))?;

    sqlx::query("DELETE FROM chatbot_nodes WHERE flow_id = $1")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    insert_nodes(&mut tx, &nodes).await?;
    tx.commit().await?;

    let mut flow = ChatbotFlow::from_row(&row);
    flow.nodes = nodes;
    Ok(Json(json!({ "flow": flow })))
}

pub async fn delete_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;
    sqlx::query("DELETE FROM chatbot_flows WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "success": true })))
}

fn playground_turns(body: &AiPlaygroundBody) -> Vec<ChatTurn> {
    let mut turns = vec![ChatTurn::system(playground_system_prompt(
        body.custom_prompt.as_deref(),
    ))];
    turns.extend(
        body.conversation_history
            .iter()
            .filter(|turn| matches!(turn.role.as_str(), "user" | "assistant"))
            .map(|turn| ChatTurn::new(&turn.role, turn.content.clone())),
    );
    turns.push(ChatTurn::user(body.message.trim()));
    turns
}

pub async fn ai_playground(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AiPlaygroundBody>,
) -> ApiResult<impl IntoResponse> {
    auth_user_from_headers(&state, &headers).await?;
    required(&body.message, "message")?;
    if !state.config.ai_enabled() {
        return Err(ApiError::Upstream {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "OpenAI API key not configured".to_string(),
        });
    }

    match llm::chat_completion(&state, &playground_turns(&body)).await {
        Ok(completion) => Ok(Json(json!({
            "response": completion.text,
            "usage": completion.usage,
        }))),
        Err(LlmError::EmptyContent) => Ok(Json(json!({
            "response": AI_FALLBACK_REPLY,
            "usage": Value::Null,
        }))),
        Err(err) => {
            tracing::warn!(error = %err, "ai playground failed");
            Err(ApiError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "failed to generate AI response".to_string(),
            })
        }
    }
}
