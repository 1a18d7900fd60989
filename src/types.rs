use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
    pub created_at: String,
}

impl UserProfile {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            email: row.get("email"),
            name: row.get("name"),
            role: row.get("role"),
            created_at: row.get("created_at"),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConnection {
    pub id: String,
    pub user_id: String,
    pub phone_number: String,
    pub phone_number_id: String,
    pub waba_id: String,
    pub business_name: Option<String>,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    pub status: String,
    pub connected_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const CONNECTION_COLUMNS: &str = "id, user_id, phone_number, phone_number_id, waba_id, business_name, access_token, status, connected_at, created_at, updated_at";

impl WhatsAppConnection {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            phone_number: row.get("phone_number"),
            phone_number_id: row.get("phone_number_id"),
            waba_id: row.get("waba_id"),
            business_name: row.get("business_name"),
            access_token: row.get("access_token"),
            status: row.get("status"),
            connected_at: row.get("connected_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub fn usable_access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub connection_id: String,
    pub direction: String,
    #[serde(rename = "from")]
    pub from_number: String,
    #[serde(rename = "to")]
    pub to_number: String,
    pub message_type: String,
    pub content: String,
    pub status: String,
    pub whatsapp_message_id: Option<String>,
    pub created_at: String,
}

pub const MESSAGE_COLUMNS: &str = "id, connection_id, direction, from_number, to_number, message_type, content, status, whatsapp_message_id, created_at";

impl Message {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            direction: row.get("direction"),
            from_number: row.get("from_number"),
            to_number: row.get("to_number"),
            message_type: row.get("message_type"),
            content: row.get("content"),
            status: row.get("status"),
            whatsapp_message_id: row.get("whatsapp_message_id"),
            created_at: row.get("created_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotNode {
    pub id: String,
    pub flow_id: String,
    pub node_type: String,
    pub content: String,
    pub options: Option<String>,
    pub next_node_id: Option<String>,
    pub position: i32,
}

impl ChatbotNode {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            node_type: row.get("node_type"),
            content: row.get("content"),
            options: row.get("options"),
            next_node_id: row.get("next_node_id"),
            position: row.get("position"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotFlow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: String,
    pub trigger_value: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    /// Ordered by `position`.
    pub nodes: Vec<ChatbotNode>,
}

impl ChatbotFlow {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            description: row.get("description"),
            trigger_type: row.get("trigger_type"),
            trigger_value: row.get("trigger_value"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotConversation {
    pub id: String,
    pub connection_id: String,
    pub phone_number: String,
    pub current_flow_id: Option<String>,
    pub current_node_id: Option<String>,
    pub context: Option<String>,
    pub is_active: bool,
}

impl ChatbotConversation {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            phone_number: row.get("phone_number"),
            current_flow_id: row.get("current_flow_id"),
            current_node_id: row.get("current_node_id"),
            context: row.get("context"),
            is_active: row.get("is_active"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactNote {
    pub id: String,
    pub contact_id: String,
    pub content: String,
    pub is_pinned: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ContactNote {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            contact_id: row.get("contact_id"),
            content: row.get("content"),
            is_pinned: row.get("is_pinned"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub phone_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub is_blocked: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub groups: Vec<GroupRef>,
    #[serde(default)]
    pub notes: Vec<ContactNote>,
}

pub const CONTACT_COLUMNS: &str =
    "id, user_id, phone_number, name, email, company, is_blocked, created_at, updated_at";

impl Contact {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            phone_number: row.get("phone_number"),
            name: row.get("name"),
            email: row.get("email"),
            company: row.get("company"),
            is_blocked: row.get("is_blocked"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            tags: Vec::new(),
            groups: Vec::new(),
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickReply {
    pub id: String,
    pub user_id: String,
    pub shortcut: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub created_at: String,
    pub updated_at: String,
}

impl QuickReply {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            shortcut: row.get("shortcut"),
            title: row.get("title"),
            content: row.get("content"),
            category: row.get("category"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub content: String,
    pub category: String,
    pub variables: Option<Value>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl MessageTemplate {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            content: row.get("content"),
            category: row.get("category"),
            variables: row
                .get::<Option<String>, _>("variables")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            status: row.get("status"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: String,
    pub user_id: String,
    pub connection_id: String,
    pub recipient_phone: String,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub scheduled_at: String,
    pub status: String,
    pub sent_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const SCHEDULED_COLUMNS: &str = "id, user_id, connection_id, recipient_phone, content, message_type, media_url, scheduled_at, status, sent_at, error, created_at, updated_at";

impl ScheduledMessage {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            connection_id: row.get("connection_id"),
            recipient_phone: row.get("recipient_phone"),
            content: row.get("content"),
            message_type: row.get("message_type"),
            media_url: row.get("media_url"),
            scheduled_at: row.get("scheduled_at"),
            status: row.get("status"),
            sent_at: row.get("sent_at"),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

impl Notification {
    pub fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            kind: row.get("kind"),
            title: row.get("title"),
            content: row.get("content"),
            link: row.get("link"),
            is_read: row.get("is_read"),
            created_at: row.get("created_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    /// Masked for listing; the full key is only returned at creation.
    pub key: String,
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub permissions: Vec<String>,
    pub is_active: bool,
}

impl ApiKeyRecord {
    pub fn allows(&self, permission: &str) -> bool {
        self.is_active && self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLog {
    pub id: String,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: String,
    pub payload: String,
    pub processed: bool,
    pub created_at: String,
}

// ---- request bodies ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgotPasswordBody {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordBody {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBody {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub waba_id: String,
    pub business_name: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConnectionBody {
    #[serde(default)]
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: Value,
    pub message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSendMessageBody {
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: Value,
    pub message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdBody {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdQuery {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeInput {
    /// Client-side id, only used to resolve `next_node_id` references.
    pub id: Option<String>,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub content: String,
    pub options: Option<String>,
    pub next_node_id: Option<String>,
    pub position: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowBody {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_value: Option<String>,
    #[serde(default)]
    pub nodes: Vec<FlowNodeInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlowBody {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_value: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default)]
    pub nodes: Vec<FlowNodeInput>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPlaygroundBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryTurn>,
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsQuery {
    pub search: Option<String>,
    pub tag_id: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactBody {
    #[serde(default)]
    pub phone_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContactBody {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub is_blocked: Option<bool>,
    pub tag_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagBody {
    #[serde(default)]
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupBody {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    #[serde(default)]
    pub contact_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupBody {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub contact_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteBody {
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_pinned: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNoteBody {
    #[serde(default)]
    pub id: String,
    pub content: Option<String>,
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuickReplyBody {
    #[serde(default)]
    pub shortcut: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuickReplyBody {
    #[serde(default)]
    pub id: String,
    pub shortcut: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    pub category: Option<String>,
    pub variables: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledBody {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub recipient_phone: String,
    #[serde(default)]
    pub content: String,
    pub message_type: Option<String>,
    pub media_url: Option<String>,
    #[serde(default)]
    pub scheduled_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationBody {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkNotificationBody {
    pub id: Option<String>,
    #[serde(default)]
    pub mark_all_read: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNotificationQuery {
    pub id: Option<String>,
    pub all: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyBody {
    #[serde(default)]
    pub name: String,
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub connection_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub format: Option<String>,
    pub connection_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminExportQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub page: Option<i64>,
}
