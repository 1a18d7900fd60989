//! Rule-based and AI-assisted chatbot flows.
//!
//! A flow is an ordered list of nodes. Each (connection, phone number) pair has
//! at most one conversation pointer into a flow; every inbound message either
//! advances that pointer by one node, starts a new flow whose trigger matches,
//! or falls back to an AI reply.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError},
};

use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};
use tokio::{
    sync::{
        oneshot::{self, error::TryRecvError},
        Mutex, OwnedMutexGuard,
    },
    task::JoinHandle,
};

use crate::{
    app::{json_text, now_iso, AppState},
    llm::{self, ChatTurn},
    prompting::DEFAULT_ASSISTANT_PROMPT,
    types::{ChatbotConversation, ChatbotFlow, ChatbotNode},
};

pub const NODE_AI_RESPONSE: &str = "ai_response";

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: String,
    pub text: String,
    pub connection_id: String,
    pub waba_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotResponse {
    pub should_respond: bool,
    pub response: Option<String>,
    pub flow_id: Option<String>,
    pub node_id: Option<String>,
}

impl ChatbotResponse {
    pub fn silent() -> Self {
        Self::default()
    }

    fn node(flow: &ChatbotFlow, node: &ChatbotNode) -> Self {
        Self {
            should_respond: true,
            response: Some(node.content.clone()),
            flow_id: Some(flow.id.clone()),
            node_id: Some(node.id.clone()),
        }
    }
}

/// Serializes message handling per conversation key. Entries nobody holds are
/// pruned on the next acquire.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Background work chained per key: a task starts only after the task
/// submitted before it for the same key has finished. Submission never waits.
#[derive(Default)]
pub struct ReplyQueue {
    tails: std::sync::Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl ReplyQueue {
    pub fn submit<F>(&self, key: &str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, tail) = oneshot::channel();
        let previous = {
            let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
            tails.retain(|_, pending| matches!(pending.try_recv(), Err(TryRecvError::Empty)));
            tails.insert(key.to_string(), tail)
        };
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // A panicked predecessor drops its sender; go on regardless.
                let _ = previous.await;
            }
            task.await;
            let _ = done.send(());
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub fn conversation_id(connection_id: &str, phone_number: &str) -> String {
    format!("{connection_id}-{phone_number}")
}

/// Keyword triggers are comma separated and match as case-insensitive
/// substrings. Blank entries are skipped on purpose: a trailing comma in
/// `"precio,"` must not turn the flow into a catch-all.
pub fn should_trigger_flow(flow: &ChatbotFlow, text: &str, is_first_message: bool) -> bool {
    match flow.trigger_type.as_str() {
        "keyword" => {
            let Some(trigger_value) = flow.trigger_value.as_deref() else {
                return false;
            };
            let text = text.to_lowercase();
            trigger_value
                .to_lowercase()
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .any(|keyword| text.contains(keyword))
        }
        "all" => true,
        "first_message" => is_first_message,
        _ => false,
    }
}

#[derive(Debug, PartialEq)]
pub enum Advance<'a> {
    /// The pointer references a node the flow no longer has.
    UnknownNode,
    EndOfFlow,
    Next(&'a ChatbotNode),
}

/// Explicit `next_node_id` wins; otherwise the following node by position.
pub fn advance<'a>(flow: &'a ChatbotFlow, current_node_id: Option<&str>) -> Advance<'a> {
    let Some(index) = current_node_id
        .and_then(|id| flow.nodes.iter().position(|node| node.id == id))
    else {
        return Advance::UnknownNode;
    };
    let current = &flow.nodes[index];
    let next = match current.next_node_id.as_deref() {
        Some(next_id) => flow.nodes.iter().find(|node| node.id == next_id),
        None => flow.nodes.get(index + 1),
    };
    match next {
        Some(node) => Advance::Next(node),
        None => Advance::EndOfFlow,
    }
}

#[derive(Debug, PartialEq)]
pub enum Step<'a> {
    Ignore,
    /// Conversation pointer moves to `node`.
    Continue {
        flow: &'a ChatbotFlow,
        node: &'a ChatbotNode,
    },
    /// The current flow ran out of nodes; the conversation is closed.
    Finish,
    /// A trigger matched; the conversation is (re)started at `node`.
    Start {
        flow: &'a ChatbotFlow,
        node: &'a ChatbotNode,
    },
    /// No flow claimed the message but an AI flow exists.
    Ai { flow: &'a ChatbotFlow },
}

pub fn plan_step<'a>(
    flows: &'a [ChatbotFlow],
    conversation: Option<&ChatbotConversation>,
    text: &str,
) -> Step<'a> {
    if flows.is_empty() {
        return Step::Ignore;
    }

    let current_flow = conversation
        .and_then(|c| c.current_flow_id.as_deref())
        .and_then(|flow_id| flows.iter().find(|f| f.id == flow_id));
    if let (Some(conversation), Some(flow)) = (conversation, current_flow) {
        return match advance(flow, conversation.current_node_id.as_deref()) {
            Advance::UnknownNode => Step::Ignore,
            Advance::EndOfFlow => Step::Finish,
            Advance::Next(node) => Step::Continue { flow, node },
        };
    }

    let is_first_message = conversation.is_none();
    if let Some(flow) = flows
        .iter()
        .find(|flow| should_trigger_flow(flow, text, is_first_message))
    {
        return match flow.nodes.first() {
            Some(node) => Step::Start { flow, node },
            None => Step::Ignore,
        };
    }

    if let Some(flow) = flows
        .iter()
        .find(|flow| flow.nodes.iter().any(|n| n.node_type == NODE_AI_RESPONSE))
    {
        return Step::Ai { flow };
    }

    Step::Ignore
}

pub fn merge_context(existing: Option<&str>, last_response: &str) -> Value {
    let mut map = existing
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_else(Map::new);
    map.insert("lastResponse".to_string(), json!(last_response));
    Value::Object(map)
}

fn ai_system_prompt(flow: &ChatbotFlow) -> String {
    flow.nodes
        .iter()
        .find(|n| n.node_type == NODE_AI_RESPONSE)
        .map(|n| n.content.trim())
        .filter(|content| !content.is_empty())
        .unwrap_or(DEFAULT_ASSISTANT_PROMPT)
        .to_string()
}

async fn process_ai_response(
    state: &Arc<AppState>,
    flow: &ChatbotFlow,
    user_message: &str,
) -> ChatbotResponse {
    if !state.config.ai_enabled() {
        return ChatbotResponse::silent();
    }
    let turns = [
        ChatTurn::system(ai_system_prompt(flow)),
        ChatTurn::user(user_message),
    ];
    match llm::chat_completion(state, &turns).await {
        Ok(completion) => ChatbotResponse {
            should_respond: true,
            response: Some(completion.text),
            flow_id: Some(flow.id.clone()),
            node_id: None,
        },
        Err(err) => {
            tracing::warn!(flow_id = %flow.id, error = %err, "ai response failed");
            ChatbotResponse::silent()
        }
    }
}

pub async fn load_active_flows(db: &PgPool, user_id: &str) -> Result<Vec<ChatbotFlow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, name, description, trigger_type, trigger_value, is_active, created_at, updated_at \
         FROM chatbot_flows WHERE user_id = $1 AND is_active = true ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await?;
    let mut flows = rows.iter().map(ChatbotFlow::from_row).collect::<Vec<_>>();
    attach_nodes(db, &mut flows).await?;
    Ok(flows)
}

pub async fn attach_nodes(db: &PgPool, flows: &mut [ChatbotFlow]) -> Result<(), sqlx::Error> {
    if flows.is_empty() {
        return Ok(());
    }
    let flow_ids = flows.iter().map(|f| f.id.clone()).collect::<Vec<_>>();
    let rows = sqlx::query(
        "SELECT id, flow_id, node_type, content, options, next_node_id, position \
         FROM chatbot_nodes WHERE flow_id = ANY($1) ORDER BY position ASC, id ASC",
    )
    .bind(&flow_ids)
    .fetch_all(db)
    .await?;
    let mut by_flow: HashMap<String, Vec<ChatbotNode>> = HashMap::new();
    for row in &rows {
        let node = ChatbotNode::from_row(row);
        by_flow.entry(node.flow_id.clone()).or_default().push(node);
    }
    for flow in flows.iter_mut() {
        flow.nodes = by_flow.remove(&flow.id).unwrap_or_default();
    }
    Ok(())
}

async fn active_conversation(
    db: &PgPool,
    connection_id: &str,
    phone_number: &str,
) -> Result<Option<ChatbotConversation>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, connection_id, phone_number, current_flow_id, current_node_id, context, is_active \
         FROM chatbot_conversations \
         WHERE connection_id = $1 AND phone_number = $2 AND is_active = true",
    )
    .bind(connection_id)
    .bind(phone_number)
    .fetch_optional(db)
    .await?;
    Ok(row.as_ref().map(ChatbotConversation::from_row))
}

async fn upsert_conversation(
    db: &PgPool,
    connection_id: &str,
    phone_number: &str,
    flow_id: &str,
    node_id: &str,
    context: &Value,
) -> Result<(), sqlx::Error> {
    let now = now_iso();
    sqlx::query(
        "INSERT INTO chatbot_conversations \
         (id, connection_id, phone_number, current_flow_id, current_node_id, context, is_active, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,true,$7,$7) \
         ON CONFLICT (connection_id, phone_number) DO UPDATE SET \
         current_flow_id = EXCLUDED.current_flow_id, current_node_id = EXCLUDED.current_node_id, \
         context = EXCLUDED.context, is_active = true, updated_at = EXCLUDED.updated_at",
    )
    .bind(conversation_id(connection_id, phone_number))
    .bind(connection_id)
    .bind(phone_number)
    .bind(flow_id)
    .bind(node_id)
    .bind(json_text(context))
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

/// Runs one inbound message through the owner's flows.
pub async fn process_chatbot_message(
    state: &Arc<AppState>,
    message: &IncomingMessage,
) -> Result<ChatbotResponse, sqlx::Error> {
    let connection = sqlx::query("SELECT id, user_id FROM whatsapp_connections WHERE waba_id = $1 ORDER BY created_at ASC LIMIT 1")
        .bind(&message.waba_id)
        .fetch_optional(&state.db)
        .await?;
    let Some(connection) = connection else {
        return Ok(ChatbotResponse::silent());
    };
    let connection_id: String = connection.get("id");
    let user_id: String = connection.get("user_id");
    if !message.connection_id.is_empty() && message.connection_id != connection_id {
        tracing::debug!(
            requested = %message.connection_id,
            resolved = %connection_id,
            "waba id resolved to a different connection"
        );
    }

    let _guard = state
        .conversation_locks
        .acquire(&conversation_id(&connection_id, &message.from))
        .await;

    let conversation = active_conversation(&state.db, &connection_id, &message.from).await?;
    let flows = load_active_flows(&state.db, &user_id).await?;

    match plan_step(&flows, conversation.as_ref(), &message.text) {
        Step::Ignore => Ok(ChatbotResponse::silent()),
        Step::Finish => {
            if let Some(conversation) = &conversation {
                sqlx::query(
                    "UPDATE chatbot_conversations SET is_active = false, updated_at = $1 WHERE id = $2",
                )
                .bind(now_iso())
                .bind(&conversation.id)
                .execute(&state.db)
                .await?;
            }
            Ok(ChatbotResponse::silent())
        }
        Step::Continue { flow, node } => {
            let existing = conversation.as_ref().and_then(|c| c.context.as_deref());
            let context = merge_context(existing, &message.text);
            if let Some(conversation) = &conversation {
                sqlx::query(
                    "UPDATE chatbot_conversations SET current_node_id = $1, context = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(&node.id)
                .bind(json_text(&context))
                .bind(now_iso())
                .bind(&conversation.id)
                .execute(&state.db)
                .await?;
            }
            if node.node_type == NODE_AI_RESPONSE {
                return Ok(process_ai_response(state, flow, &message.text).await);
            }
            Ok(ChatbotResponse::node(flow, node))
        }
        Step::Start { flow, node } => {
            upsert_conversation(
                &state.db,
                &connection_id,
                &message.from,
                &flow.id,
                &node.id,
                &json!({ "userMessage": message.text }),
            )
            .await?;
            tracing::info!(flow_id = %flow.id, connection_id = %connection_id, "chatbot flow started");
            if node.node_type == NODE_AI_RESPONSE {
                return Ok(process_ai_response(state, flow, &message.text).await);
            }
            Ok(ChatbotResponse::node(flow, node))
        }
        Step::Ai { flow } => Ok(process_ai_response(state, flow, &message.text).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: &str, content: &str, next: Option<&str>, position: i32) -> ChatbotNode {
        ChatbotNode {
            id: id.to_string(),
            flow_id: "f".to_string(),
            node_type: node_type.to_string(),
            content: content.to_string(),
            options: None,
            next_node_id: next.map(str::to_string),
            position,
        }
    }

    fn flow(id: &str, trigger_type: &str, trigger_value: Option<&str>, nodes: Vec<ChatbotNode>) -> ChatbotFlow {
        ChatbotFlow {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: id.to_string(),
            description: None,
            trigger_type: trigger_type.to_string(),
            trigger_value: trigger_value.map(str::to_string),
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
            nodes,
        }
    }

    fn conversation(flow_id: Option<&str>, node_id: Option<&str>) -> ChatbotConversation {
        ChatbotConversation {
            id: "c1-5215550001".to_string(),
            connection_id: "c1".to_string(),
            phone_number: "5215550001".to_string(),
            current_flow_id: flow_id.map(str::to_string),
            current_node_id: node_id.map(str::to_string),
            context: Some(r#"{"userMessage":"hola"}"#.to_string()),
            is_active: true,
        }
    }

    mod triggers {
        use super::*;

        #[test]
        fn keyword_matches_case_insensitive_substring() {
            let f = flow("f1", "keyword", Some("Precio, horario "), vec![]);
            assert!(should_trigger_flow(&f, "¿Cuál es el PRECIO?", false));
            assert!(should_trigger_flow(&f, "horarios de atención", false));
            assert!(!should_trigger_flow(&f, "hola", false));
        }

        #[test]
        fn keyword_without_value_never_matches() {
            let f = flow("f1", "keyword", None, vec![]);
            assert!(!should_trigger_flow(&f, "anything", true));
        }

        #[test]
        fn blank_keywords_are_ignored() {
            let f = flow("f1", "keyword", Some("precio, ,"), vec![]);
            assert!(!should_trigger_flow(&f, "hola", false));
            let only_commas = flow("f2", "keyword", Some(" , "), vec![]);
            assert!(!should_trigger_flow(&only_commas, "hola", false));
        }

        #[test]
        fn all_and_first_message() {
            let all = flow("f1", "all", None, vec![]);
            assert!(should_trigger_flow(&all, "x", false));
            let first = flow("f2", "first_message", None, vec![]);
            assert!(should_trigger_flow(&first, "x", true));
            assert!(!should_trigger_flow(&first, "x", false));
        }

        #[test]
        fn unknown_trigger_type_never_matches() {
            let f = flow("f1", "regex", Some(".*"), vec![]);
            assert!(!should_trigger_flow(&f, "x", true));
        }
    }

    mod advancing {
        use super::*;

        #[test]
        fn follows_position_order_without_explicit_next() {
            let f = flow(
                "f1",
                "all",
                None,
                vec![node("n1", "message", "a", None, 0), node("n2", "message", "b", None, 1)],
            );
            assert_eq!(advance(&f, Some("n1")), Advance::Next(&f.nodes[1]));
            assert_eq!(advance(&f, Some("n2")), Advance::EndOfFlow);
        }

        #[test]
        fn explicit_next_node_wins() {
            let f = flow(
                "f1",
                "all",
                None,
                vec![
                    node("n1", "message", "a", Some("n3"), 0),
                    node("n2", "message", "b", None, 1),
                    node("n3", "message", "c", None, 2),
                ],
            );
            assert_eq!(advance(&f, Some("n1")), Advance::Next(&f.nodes[2]));
        }

        #[test]
        fn dangling_next_node_ends_flow() {
            let f = flow("f1", "all", None, vec![node("n1", "message", "a", Some("gone"), 0)]);
            assert_eq!(advance(&f, Some("n1")), Advance::EndOfFlow);
        }

        #[test]
        fn unknown_current_node() {
            let f = flow("f1", "all", None, vec![node("n1", "message", "a", None, 0)]);
            assert_eq!(advance(&f, Some("zzz")), Advance::UnknownNode);
            assert_eq!(advance(&f, None), Advance::UnknownNode);
        }
    }

    mod planning {
        use super::*;

        fn greeting_flows() -> Vec<ChatbotFlow> {
            vec![
                flow(
                    "greet",
                    "keyword",
                    Some("hola"),
                    vec![node("g1", "message", "¡Hola!", None, 0), node("g2", "question", "¿Nombre?", None, 1)],
                ),
                flow(
                    "ai",
                    "keyword",
                    Some("agente"),
                    vec![node("a1", NODE_AI_RESPONSE, "Eres un vendedor.", None, 0)],
                ),
            ]
        }

        #[test]
        fn no_flows_means_no_response() {
            assert_eq!(plan_step(&[], None, "hola"), Step::Ignore);
        }

        #[test]
        fn starts_first_matching_flow_at_first_node() {
            let flows = greeting_flows();
            match plan_step(&flows, None, "Hola!") {
                Step::Start { flow, node } => {
                    assert_eq!(flow.id, "greet");
                    assert_eq!(node.id, "g1");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn continues_active_conversation() {
            let flows = greeting_flows();
            let conv = conversation(Some("greet"), Some("g1"));
            match plan_step(&flows, Some(&conv), "Ana") {
                Step::Continue { flow, node } => {
                    assert_eq!(flow.id, "greet");
                    assert_eq!(node.id, "g2");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn finishing_a_flow_does_not_fall_through_to_triggers() {
            let flows = greeting_flows();
            let conv = conversation(Some("greet"), Some("g2"));
            assert_eq!(plan_step(&flows, Some(&conv), "hola otra vez"), Step::Finish);
        }

        #[test]
        fn missing_node_in_current_flow_is_ignored() {
            let flows = greeting_flows();
            let conv = conversation(Some("greet"), Some("deleted"));
            assert_eq!(plan_step(&flows, Some(&conv), "hola"), Step::Ignore);
        }

        #[test]
        fn inactive_current_flow_falls_back_to_triggers() {
            let flows = greeting_flows();
            let conv = conversation(Some("disabled-flow"), Some("x"));
            match plan_step(&flows, Some(&conv), "hola") {
                Step::Start { flow, .. } => assert_eq!(flow.id, "greet"),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn first_message_trigger_only_without_conversation() {
            let flows = vec![flow("welcome", "first_message", None, vec![node("w1", "message", "Bienvenido", None, 0)])];
            assert!(matches!(plan_step(&flows, None, "x"), Step::Start { .. }));
            let conv = conversation(None, None);
            assert_eq!(plan_step(&flows, Some(&conv), "x"), Step::Ignore);
        }

        #[test]
        fn matching_flow_without_nodes_is_silent() {
            let flows = vec![flow("empty", "all", None, vec![])];
            assert_eq!(plan_step(&flows, None, "x"), Step::Ignore);
        }

        #[test]
        fn unmatched_text_falls_back_to_ai_flow() {
            let flows = greeting_flows();
            match plan_step(&flows, None, "necesito ayuda") {
                Step::Ai { flow } => assert_eq!(flow.id, "ai"),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn unmatched_text_without_ai_flow_is_ignored() {
            let flows = vec![greeting_flows().remove(0)];
            assert_eq!(plan_step(&flows, None, "necesito ayuda"), Step::Ignore);
        }
    }

    #[test]
    fn context_merge_keeps_existing_keys() {
        let merged = merge_context(Some(r#"{"userMessage":"hola"}"#), "Ana");
        assert_eq!(merged, json!({ "userMessage": "hola", "lastResponse": "Ana" }));
    }

    #[test]
    fn context_merge_tolerates_garbage() {
        assert_eq!(merge_context(Some("not json"), "x"), json!({ "lastResponse": "x" }));
        assert_eq!(merge_context(Some("[1,2]"), "x"), json!({ "lastResponse": "x" }));
        assert_eq!(merge_context(None, "x"), json!({ "lastResponse": "x" }));
    }

    #[test]
    fn ai_prompt_defaults_when_node_is_blank() {
        let f = flow("f", "all", None, vec![node("a", NODE_AI_RESPONSE, "   ", None, 0)]);
        assert_eq!(ai_system_prompt(&f), DEFAULT_ASSISTANT_PROMPT);
        let custom = flow("f", "all", None, vec![node("a", NODE_AI_RESPONSE, "Be brief.", None, 0)]);
        assert_eq!(ai_system_prompt(&custom), "Be brief.");
    }

    #[test]
    fn conversation_ids_are_stable() {
        assert_eq!(conversation_id("conn", "521"), "conn-521");
    }

    #[tokio::test]
    async fn locks_serialize_same_key_and_are_pruned() {
        let locks = Arc::new(ConversationLocks::default());
        let guard = locks.acquire("c1-1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("c1-1").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // other keys are independent
        let _other = locks.acquire("c1-2").await;

        drop(guard);
        contender.await.unwrap();
        drop(_other);

        let _fresh = locks.acquire("c9-9").await;
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn ai_is_silent_without_api_key() {
        let state = crate::app::test_state();
        let f = flow("f", "all", None, vec![node("a", NODE_AI_RESPONSE, "x", None, 0)]);
        assert_eq!(process_ai_response(&state, &f, "hola").await, ChatbotResponse::silent());
    }

    #[tokio::test]
    async fn reply_queue_keeps_submission_order_per_key() {
        let queue = ReplyQueue::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            queue.submit("w1-521", async move {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                order.lock().unwrap().push("first");
            })
        };
        let second = {
            let order = order.clone();
            queue.submit("w1-521", async move {
                order.lock().unwrap().push("second");
            })
        };
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn reply_queue_keys_are_independent_and_pruned() {
        let queue = ReplyQueue::default();
        let (release, blocked) = oneshot::channel::<()>();
        let slow = queue.submit("w1-521", async move {
            let _ = blocked.await;
        });
        let fast = queue.submit("w1-522", async {});
        tokio::time::timeout(std::time::Duration::from_secs(1), fast)
            .await
            .expect("other sender is not blocked")
            .unwrap();
        assert!(!slow.is_finished());

        release.send(()).unwrap();
        slow.await.unwrap();
        let _ = queue.submit("w1-523", async {});
        assert_eq!(queue.len(), 1);
    }

    mod with_database {
        use super::*;
        use crate::{app::new_id, testing, types::WhatsAppConnection};

        const PHONE: &str = "5215550001";

        /// Keyword flow `hola` with two message nodes; returns the node ids.
        async fn greeting_flow(db: &PgPool, user_id: &str) -> Vec<String> {
            let flow_id = new_id();
            let now = now_iso();
            sqlx::query(
                "INSERT INTO chatbot_flows (id, user_id, name, trigger_type, trigger_value, is_active, created_at, updated_at) \
                 VALUES ($1,$2,'Bienvenida','keyword','hola',true,$3,$3)",
            )
            .bind(&flow_id)
            .bind(user_id)
            .bind(&now)
            .execute(db)
            .await
            .unwrap();
            let nodes = vec![new_id(), new_id()];
            for (position, (id, content)) in nodes.iter().zip(["Bienvenido", "¿En qué te ayudo?"]).enumerate() {
                sqlx::query(
                    "INSERT INTO chatbot_nodes (id, flow_id, node_type, content, position) \
                     VALUES ($1,$2,'message',$3,$4)",
                )
                .bind(id)
                .bind(&flow_id)
                .bind(content)
                .bind(position as i32)
                .execute(db)
                .await
                .unwrap();
            }
            nodes
        }

        fn incoming(connection: &WhatsAppConnection, text: &str) -> IncomingMessage {
            IncomingMessage {
                from: PHONE.to_string(),
                text: text.to_string(),
                connection_id: connection.id.clone(),
                waba_id: connection.waba_id.clone(),
            }
        }

        #[tokio::test]
        async fn flow_runs_to_the_end_and_restarts_on_the_same_row() {
            let Some(test) = testing::test_db(None).await else {
                return;
            };
            let (state, db) = (&test.state, &test.state.db);
            let user = testing::user(db).await;
            let connection = testing::connection(db, &user).await;
            let nodes = greeting_flow(db, &user).await;

            let started = process_chatbot_message(state, &incoming(&connection, "Hola!")).await.unwrap();
            assert_eq!(started.response.as_deref(), Some("Bienvenido"));
            assert_eq!(started.node_id.as_deref(), Some(nodes[0].as_str()));

            let next = process_chatbot_message(state, &incoming(&connection, "quiero info")).await.unwrap();
            assert_eq!(next.response.as_deref(), Some("¿En qué te ayudo?"));
            let conversation = active_conversation(db, &connection.id, PHONE).await.unwrap().unwrap();
            assert_eq!(conversation.current_node_id.as_deref(), Some(nodes[1].as_str()));
            let context: Value = serde_json::from_str(conversation.context.as_deref().unwrap()).unwrap();
            assert_eq!(context["userMessage"], "Hola!");
            assert_eq!(context["lastResponse"], "quiero info");

            let finished = process_chatbot_message(state, &incoming(&connection, "gracias")).await.unwrap();
            assert_eq!(finished, ChatbotResponse::silent());
            assert!(active_conversation(db, &connection.id, PHONE).await.unwrap().is_none());

            let restarted = process_chatbot_message(state, &incoming(&connection, "hola otra vez")).await.unwrap();
            assert_eq!(restarted.node_id.as_deref(), Some(nodes[0].as_str()));
            let rows: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM chatbot_conversations WHERE connection_id = $1 AND is_active = true",
            )
            .bind(&connection.id)
            .fetch_one(db)
            .await
            .unwrap();
            assert_eq!(rows, 1);
            testing::cleanup(db, &user).await;
        }

        #[tokio::test]
        async fn queued_messages_apply_in_arrival_order() {
            let Some(test) = testing::test_db(None).await else {
                return;
            };
            let db = &test.state.db;
            let user = testing::user(db).await;
            let connection = testing::connection(db, &user).await;
            let nodes = greeting_flow(db, &user).await;

            let mut handles = Vec::new();
            for text in ["hola", "segundo"] {
                let message = incoming(&connection, text);
                let state = test.state.clone();
                handles.push(test.state.reply_queue.submit(
                    &conversation_id(&message.waba_id, &message.from),
                    async move {
                        process_chatbot_message(&state, &message).await.unwrap();
                    },
                ));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let conversation = active_conversation(db, &connection.id, PHONE).await.unwrap().unwrap();
            assert_eq!(conversation.current_node_id.as_deref(), Some(nodes[1].as_str()));
            let context: Value = serde_json::from_str(conversation.context.as_deref().unwrap()).unwrap();
            assert_eq!(context["lastResponse"], "segundo");
            testing::cleanup(db, &user).await;
        }
    }
}
