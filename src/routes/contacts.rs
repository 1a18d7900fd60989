//! Contact book: contacts plus their tags, groups and notes.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::{
    app::{auth_user_from_headers, new_id, now_iso, AppState},
    error::{ApiError, ApiResult},
    routes::{non_blank, required, required_id},
    types::{
        Contact, ContactNote, ContactsQuery, CreateContactBody, CreateGroupBody, CreateNoteBody,
        CreateTagBody, GroupRef, IdQuery, Tag, UpdateContactBody, UpdateGroupBody, UpdateNoteBody,
        CONTACT_COLUMNS,
    },
};

const DEFAULT_TAG_COLOR: &str = "#6b7280";
const DEFAULT_GROUP_COLOR: &str = "#3b82f6";
const GROUP_PREVIEW_SIZE: usize = 5;
const NOTE_COLUMNS: &str = "id, contact_id, content, is_pinned, created_at, updated_at";

/// `ILIKE` pattern matching `term` anywhere, with wildcards in the term escaped.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

async fn attach_relations(db: &PgPool, contacts: &mut [Contact]) -> Result<(), sqlx::Error> {
    if contacts.is_empty() {
        return Ok(());
    }
    let ids = contacts.iter().map(|c| c.id.clone()).collect::<Vec<_>>();

    let mut tags: HashMap<String, Vec<Tag>> = HashMap::new();
    for row in sqlx::query(
        "SELECT r.contact_id, t.id, t.name, t.color FROM contact_tag_relations r \
         JOIN contact_tags t ON t.id = r.tag_id WHERE r.contact_id = ANY($1) ORDER BY t.name ASC",
    )
    .bind(&ids)
    .fetch_all(db)
    .await?
    {
        tags.entry(row.get("contact_id")).or_default().push(Tag {
            id: row.get("id"),
            name: row.get("name"),
            color: row.get("color"),
        });
    }

    let mut groups: HashMap<String, Vec<GroupRef>> = HashMap::new();
    for row in sqlx::query(
        "SELECT r.contact_id, g.id, g.name, g.color FROM contact_group_relations r \
         JOIN contact_groups g ON g.id = r.group_id WHERE r.contact_id = ANY($1) ORDER BY g.name ASC",
    )
    .bind(&ids)
    .fetch_all(db)
    .await?
    {
        groups.entry(row.get("contact_id")).or_default().push(GroupRef {
            id: row.get("id"),
            name: row.get("name"),
            color: row.get("color"),
        });
    }

    let mut notes: HashMap<String, Vec<ContactNote>> = HashMap::new();
    for row in sqlx::query(&format!(
        "SELECT {NOTE_COLUMNS} FROM contact_notes WHERE contact_id = ANY($1) \
         ORDER BY is_pinned DESC, created_at DESC"
    ))
    .bind(&ids)
    .fetch_all(db)
    .await?
    {
        let note = ContactNote::from_row(&row);
        notes.entry(note.contact_id.clone()).or_default().push(note);
    }

    for contact in contacts.iter_mut() {
        contact.tags = tags.remove(&contact.id).unwrap_or_default();
        contact.groups = groups.remove(&contact.id).unwrap_or_default();
        contact.notes = notes.remove(&contact.id).unwrap_or_default();
    }
    Ok(())
}

async fn load_contact(state: &Arc<AppState>, user_id: &str, id: &str) -> ApiResult<Contact> {
    let row = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("contact not found"))?;
    let mut contacts = [Contact::from_row(&row)];
    attach_relations(&state.db, &mut contacts).await?;
    let [contact] = contacts;
    Ok(contact)
}

/// Links tags to a contact, ignoring tag ids the user does not own.
async fn link_tags(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    contact_id: &str,
    tag_ids: &[String],
) -> Result<(), sqlx::Error> {
    if tag_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO contact_tag_relations (contact_id, tag_id) \
         SELECT $1, id FROM contact_tags WHERE user_id = $2 AND id = ANY($3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(contact_id)
    .bind(user_id)
    .bind(tag_ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Adds members to a group, ignoring contact ids the user does not own.
async fn link_members(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    group_id: &str,
    contact_ids: &[String],
) -> Result<(), sqlx::Error> {
    if contact_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO contact_group_relations (contact_id, group_id) \
         SELECT id, $1 FROM contacts WHERE user_id = $2 AND id = ANY($3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(contact_ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ContactsQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let search = non_blank(query.search.as_deref()).map(|s| like_pattern(&s));
    let rows = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts c WHERE c.user_id = $1 \
         AND ($2::TEXT IS NULL OR c.name ILIKE $2 OR c.phone_number ILIKE $2 OR c.email ILIKE $2) \
         AND ($3::TEXT IS NULL OR EXISTS (SELECT 1 FROM contact_tag_relations r WHERE r.contact_id = c.id AND r.tag_id = $3)) \
         AND ($4::TEXT IS NULL OR EXISTS (SELECT 1 FROM contact_group_relations r WHERE r.contact_id = c.id AND r.group_id = $4)) \
         ORDER BY c.updated_at DESC"
    ))
    .bind(&user.id)
    .bind(&search)
    .bind(non_blank(query.tag_id.as_deref()))
    .bind(non_blank(query.group_id.as_deref()))
    .fetch_all(&state.db)
    .await?;

    let mut contacts = rows.iter().map(Contact::from_row).collect::<Vec<_>>();
    attach_relations(&state.db, &mut contacts).await?;
    Ok(Json(json!({ "contacts": contacts })))
}

pub async fn create_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateContactBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let phone_number = required(&body.phone_number, "phoneNumber")?;
    let id = new_id();
    let now = now_iso();

    let mut tx = state.db.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO contacts (id, user_id, phone_number, name, email, company, is_blocked, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,false,$7,$7) ON CONFLICT (user_id, phone_number) DO NOTHING",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&phone_number)
    .bind(non_blank(body.name.as_deref()))
    .bind(non_blank(body.email.as_deref()))
    .bind(non_blank(body.company.as_deref()))
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Err(ApiError::Conflict("contact already exists".to_string()));
    }
    link_tags(&mut tx, &user.id, &id, &body.tag_ids).await?;
    tx.commit().await?;

    let contact = load_contact(&state, &user.id, &id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "contact": contact }))))
}

pub async fn update_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateContactBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;

    let mut tx = state.db.begin().await?;
    let updated = sqlx::query(
        "UPDATE contacts SET name = COALESCE($1, name), email = COALESCE($2, email), \
         company = COALESCE($3, company), is_blocked = COALESCE($4, is_blocked), updated_at = $5 \
         WHERE id = $6 AND user_id = $7",
    )
    .bind(&body.name)
    .bind(&body.email)
    .bind(&body.company)
    .bind(body.is_blocked)
    .bind(now_iso())
    .bind(&id)
    .bind(&user.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(ApiError::not_found("contact not found"));
    }

    if let Some(tag_ids) = &body.tag_ids {
        sqlx::query("DELETE FROM contact_tag_relations WHERE contact_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        link_tags(&mut tx, &user.id, &id, tag_ids).await?;
    }
    tx.commit().await?;

    let contact = load_contact(&state, &user.id, &id).await?;
    Ok(Json(json!({ "contact": contact })))
}

pub async fn delete_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query("DELETE FROM contacts WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("contact not found"));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn list_tags(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(
        "SELECT t.id, t.name, t.color, t.created_at, COUNT(r.contact_id) AS contact_count \
         FROM contact_tags t LEFT JOIN contact_tag_relations r ON r.tag_id = t.id \
         WHERE t.user_id = $1 GROUP BY t.id ORDER BY t.name ASC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    let tags = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.get::<String, _>("id"),
                "name": row.get::<String, _>("name"),
                "color": row.get::<String, _>("color"),
                "createdAt": row.get::<String, _>("created_at"),
                "contactCount": row.get::<i64, _>("contact_count"),
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "tags": tags })))
}

pub async fn create_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTagBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let name = required(&body.name, "name")?;
    let tag = Tag {
        id: new_id(),
        name,
        color: non_blank(body.color.as_deref()).unwrap_or_else(|| DEFAULT_TAG_COLOR.to_string()),
    };
    let inserted = sqlx::query(
        "INSERT INTO contact_tags (id, user_id, name, color, created_at) VALUES ($1,$2,$3,$4,$5) \
         ON CONFLICT (user_id, name) DO NOTHING",
    )
    .bind(&tag.id)
    .bind(&user.id)
    .bind(&tag.name)
    .bind(&tag.color)
    .bind(now_iso())
    .execute(&state.db)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Err(ApiError::Conflict("tag already exists".to_string()));
    }
    Ok((StatusCode::CREATED, Json(json!({ "tag": tag }))))
}

pub async fn delete_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query("DELETE FROM contact_tags WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("tag not found"));
    }
    Ok(Json(json!({ "success": true })))
}

async fn group_summary(db: &PgPool, user_id: &str, group_id: &str) -> ApiResult<serde_json::Value> {
    let row = sqlx::query(
        "SELECT g.id, g.name, g.description, g.color, g.created_at, g.updated_at, \
         (SELECT COUNT(*) FROM contact_group_relations r WHERE r.group_id = g.id) AS contact_count \
         FROM contact_groups g WHERE g.id = $1 AND g.user_id = $2",
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found("group not found"))?;
    Ok(group_json(&row, Vec::new()))
}

fn group_json(row: &sqlx::postgres::PgRow, members: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "id": row.get::<String, _>("id"),
        "name": row.get::<String, _>("name"),
        "description": row.get::<Option<String>, _>("description"),
        "color": row.get::<String, _>("color"),
        "createdAt": row.get::<String, _>("created_at"),
        "updatedAt": row.get::<String, _>("updated_at"),
        "contactCount": row.get::<i64, _>("contact_count"),
        "contacts": members,
    })
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let rows = sqlx::query(
        "SELECT g.id, g.name, g.description, g.color, g.created_at, g.updated_at, \
         COUNT(r.contact_id) AS contact_count \
         FROM contact_groups g LEFT JOIN contact_group_relations r ON r.group_id = g.id \
         WHERE g.user_id = $1 GROUP BY g.id ORDER BY g.name ASC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    let ids = rows.iter().map(|r| r.get::<String, _>("id")).collect::<Vec<_>>();
    let mut previews: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    if !ids.is_empty() {
        for row in sqlx::query(
            "SELECT r.group_id, c.id, c.name, c.phone_number FROM contact_group_relations r \
             JOIN contacts c ON c.id = r.contact_id WHERE r.group_id = ANY($1) \
             ORDER BY c.name ASC NULLS LAST, c.phone_number ASC",
        )
        .bind(&ids)
        .fetch_all(&state.db)
        .await?
        {
            let members = previews.entry(row.get("group_id")).or_default();
            if members.len() < GROUP_PREVIEW_SIZE {
                members.push(json!({
                    "id": row.get::<String, _>("id"),
                    "name": row.get::<Option<String>, _>("name"),
                    "phoneNumber": row.get::<String, _>("phone_number"),
                }));
            }
        }
    }

    let groups = rows
        .iter()
        .map(|row| {
            let members = previews.remove(&row.get::<String, _>("id")).unwrap_or_default();
            group_json(row, members)
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "groups": groups })))
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateGroupBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let name = required(&body.name, "name")?;
    let id = new_id();
    let now = now_iso();

    let mut tx = state.db.begin().await?;
    sqlx::query(
        "INSERT INTO contact_groups (id, user_id, name, description, color, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$6)",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&name)
    .bind(non_blank(body.description.as_deref()))
    .bind(non_blank(body.color.as_deref()).unwrap_or_else(|| DEFAULT_GROUP_COLOR.to_string()))
    .bind(&now)
    .execute(&mut *tx)
    .await?;
    link_members(&mut tx, &user.id, &id, &body.contact_ids).await?;
    tx.commit().await?;

    let group = group_summary(&state.db, &user.id, &id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "group": group }))))
}

pub async fn update_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateGroupBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;

    let mut tx = state.db.begin().await?;
    let updated = sqlx::query(
        "UPDATE contact_groups SET name = COALESCE($1, name), description = COALESCE($2, description), \
         color = COALESCE($3, color), updated_at = $4 WHERE id = $5 AND user_id = $6",
    )
    .bind(non_blank(body.name.as_deref()))
    .bind(&body.description)
    .bind(non_blank(body.color.as_deref()))
    .bind(now_iso())
    .bind(&id)
    .bind(&user.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(ApiError::not_found("group not found"));
    }
    if let Some(contact_ids) = &body.contact_ids {
        sqlx::query("DELETE FROM contact_group_relations WHERE group_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        link_members(&mut tx, &user.id, &id, contact_ids).await?;
    }
    tx.commit().await?;

    let group = group_summary(&state.db, &user.id, &id).await?;
    Ok(Json(json!({ "group": group })))
}

pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query("DELETE FROM contact_groups WHERE id = $1 AND user_id = $2")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("group not found"));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn create_note(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNoteBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let (Some(contact_id), Some(content)) = (
        non_blank(Some(body.contact_id.as_str())),
        non_blank(Some(body.content.as_str())),
    ) else {
        return Err(ApiError::bad_request("contactId and content are required"));
    };

    let owned: Option<String> =
        sqlx::query_scalar("SELECT id FROM contacts WHERE id = $1 AND user_id = $2")
            .bind(&contact_id)
            .bind(&user.id)
            .fetch_optional(&state.db)
            .await?;
    if owned.is_none() {
        return Err(ApiError::not_found("contact not found"));
    }

    let now = now_iso();
    let note = ContactNote {
        id: new_id(),
        contact_id,
        content,
        is_pinned: body.is_pinned,
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(&format!(
        "INSERT INTO contact_notes ({NOTE_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6)"
    ))
    .bind(&note.id)
    .bind(&note.contact_id)
    .bind(&note.content)
    .bind(note.is_pinned)
    .bind(&note.created_at)
    .bind(&note.updated_at)
    .execute(&state.db)
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "note": note }))))
}

pub async fn update_note(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateNoteBody>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(Some(body.id.as_str()))?;
    let row = sqlx::query(&format!(
        "UPDATE contact_notes SET content = COALESCE($1, content), is_pinned = COALESCE($2, is_pinned), \
         updated_at = $3 \
         WHERE id = $4 AND contact_id IN (SELECT id FROM contacts WHERE user_id = $5) \
         RETURNING {NOTE_COLUMNS}"
    ))
    .bind(non_blank(body.content.as_deref()))
    .bind(body.is_pinned)
    .bind(now_iso())
    .bind(&id)
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("note not found"))?;
    Ok(Json(json!({ "note": ContactNote::from_row(&row) })))
}

pub async fn delete_note(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let id = required_id(query.id.as_deref())?;
    let deleted = sqlx::query(
        "DELETE FROM contact_notes WHERE id = $1 \
         AND contact_id IN (SELECT id FROM contacts WHERE user_id = $2)",
    )
    .bind(&id)
    .bind(&user.id)
    .execute(&state.db)
    .await?
    .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("note not found"));
    }
    Ok(Json(json!({ "success": true })))
}
