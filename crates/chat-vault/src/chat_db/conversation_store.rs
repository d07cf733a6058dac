use crate::chat_db::error::{StoreError, StoreResult};
use crate::chat_db::merge;
use crate::chat_db::schema::*;
use crate::utils::TextUtils;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;
use tracing::{info, debug, warn};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const SELECT_CONVERSATION: &str = "SELECT id, title, model, messages, master_rules, character_sheet,
        local_history, current_plot, relations, aventura, lastCompressionTime, created_at, updated_at
 FROM chats";

/// CRUD over the chats table. Every call checks a connection out of the
/// pool and returns it when done, including on error paths.
pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    default_model: String,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, default_model: impl Into<String>) -> Self {
        Self { pool, default_model: default_model.into() }
    }

    fn get_conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn get(&self, id: &str) -> StoreResult<Conversation> {
        let conn = self.get_conn()?;
        load_conversation(&conn, id, &self.default_model)?.ok_or_else(|| not_found(id))
    }

    /// The most recently updated conversation
    pub fn get_most_recent(&self) -> StoreResult<Conversation> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!("{} ORDER BY updated_at DESC, rowid DESC LIMIT 1", SELECT_CONVERSATION),
            [],
            |row| row_to_conversation(row, &self.default_model),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound("no conversations stored".to_string()))
    }

    /// All conversations, most recently updated first
    pub fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, model, messages, created_at, updated_at
             FROM chats ORDER BY updated_at DESC, rowid DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let title: Option<String> = row.get(1)?;
            let model: Option<String> = row.get(2)?;
            let messages = parse_messages(&id, row.get(3)?);

            summaries.push(ConversationSummary {
                title: title
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| UNTITLED.to_string()),
                model: model_or(model, &self.default_model),
                preview: TextUtils::conversation_preview(&messages),
                message_count: messages.len(),
                created_at: parse_timestamp(row.get(4)?, "created_at"),
                updated_at: parse_timestamp(row.get(5)?, "updated_at"),
                id,
            });
        }

        debug!("Listed {} conversations", summaries.len());
        Ok(summaries)
    }

    /// Insert a new conversation, or merge `save.messages` into an existing one.
    ///
    /// The read and the write share one IMMEDIATE transaction, so two saves of
    /// the same id cannot interleave their read-merge-write cycles.
    pub fn create_or_update(&self, save: SaveConversation) -> StoreResult<(Conversation, Outcome)> {
        let id = save
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let title = save.title.filter(|t| !t.trim().is_empty());
        let model = save.model.filter(|m| !m.trim().is_empty());
        let received = save.messages.len();

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();

        let current = tx
            .query_row(
                "SELECT title, model, messages FROM chats WHERE id = ?1",
                [&id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let (outcome, existing_count) = match current {
            Some((current_title, current_model, raw)) => {
                // An unreadable blob aborts the save; merging into an empty
                // substitute would overwrite the stored history.
                let existing = decode_messages(&id, raw)?;
                let existing_count = existing.len();
                let messages = merge::merge(existing, save.messages);
                tx.execute(
                    "UPDATE chats SET title = ?1, model = ?2, messages = ?3, updated_at = ?4 WHERE id = ?5",
                    params![
                        title.or(current_title).unwrap_or_default(),
                        model.unwrap_or_else(|| model_or(current_model, &self.default_model)),
                        serde_json::to_string(&messages)?,
                        now,
                        id,
                    ],
                )?;
                (Outcome::Updated, existing_count)
            }
            None => {
                tx.execute(
                    "INSERT INTO chats (id, title, model, messages, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        id,
                        title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                        model.unwrap_or_else(|| self.default_model.clone()),
                        serde_json::to_string(&save.messages)?,
                        now,
                    ],
                )?;
                (Outcome::Created, 0)
            }
        };

        let conversation = load_conversation(&tx, &id, &self.default_model)?.ok_or_else(|| not_found(&id))?;
        tx.commit()?;

        info!(
            "Chat '{}' ({}) {:?}. Received: {}, existing: {}, final: {} messages",
            conversation.title, id, outcome, received, existing_count, conversation.messages.len()
        );
        Ok((conversation, outcome))
    }

    /// Overwrite the recognized context slots in `patch`, leaving all others alone.
    pub fn update_context_fields(&self, id: &str, patch: &ContextPatch) -> StoreResult<Outcome> {
        if patch.is_empty() {
            return Err(StoreError::InvalidInput("no context fields supplied".to_string()));
        }
        let fields = recognized_fields(patch);
        if fields.is_empty() {
            let keys: Vec<&str> = patch.keys().map(String::as_str).collect();
            return Err(StoreError::InvalidInput(format!(
                "no recognized context field among: {}",
                keys.join(", ")
            )));
        }

        let set_clause = fields
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", field.key(), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE chats SET {}, updated_at = ?{} WHERE id = ?{}",
            set_clause,
            fields.len() + 1,
            fields.len() + 2
        );

        let now = now_timestamp();
        let mut values: Vec<&dyn ToSql> = fields.iter().map(|(_, value)| value as &dyn ToSql).collect();
        values.push(&now);
        values.push(&id);

        let conn = self.get_conn()?;
        let updated = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        if updated == 0 {
            return Err(not_found(id));
        }

        let names: Vec<&str> = fields.iter().map(|(field, _)| field.key()).collect();
        info!("Context of chat {} updated: {}", id, names.join(", "));
        Ok(Outcome::ContextUpdated)
    }

    pub fn rename(&self, id: &str, title: &str) -> StoreResult<Outcome> {
        if title.trim().is_empty() {
            return Err(StoreError::InvalidInput("title is required".to_string()));
        }

        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now_timestamp(), id],
        )?;
        if updated == 0 {
            return Err(not_found(id));
        }

        info!("Chat {} renamed to: {}", id, title);
        Ok(Outcome::Renamed)
    }

    /// Remove one message. A message that is already gone is reported as
    /// [`Outcome::AlreadyAbsent`]; only a missing conversation is an error.
    pub fn delete_message(&self, id: &str, message_id: &str) -> StoreResult<Outcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw: Option<String> = tx
            .query_row("SELECT messages FROM chats WHERE id = ?1", [id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| not_found(id))?;
        let messages = decode_messages(id, raw)?;

        let Some(remaining) = merge::remove(&messages, message_id) else {
            info!("Message {} not found in chat {}, it may already be deleted", message_id, id);
            return Ok(Outcome::AlreadyAbsent);
        };

        tx.execute(
            "UPDATE chats SET messages = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&remaining)?, now_timestamp(), id],
        )?;
        tx.commit()?;

        info!("Message {} deleted from chat {}", message_id, id);
        Ok(Outcome::Deleted)
    }

    pub fn delete_conversation(&self, id: &str) -> StoreResult<Outcome> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM chats WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(not_found(id));
        }
        info!("Deleted chat {}", id);
        Ok(Outcome::Deleted)
    }

    pub fn stats(&self) -> StoreResult<ChatStats> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, messages FROM chats")?;
        let mut rows = stmt.query([])?;
        let mut stats = ChatStats { total_chats: 0, total_messages: 0 };

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            stats.total_chats += 1;
            stats.total_messages += parse_messages(&id, row.get(1)?).len();
        }
        Ok(stats)
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound(format!("conversation {}", id))
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn load_conversation(
    conn: &Connection,
    id: &str,
    fallback_model: &str,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_CONVERSATION),
        [id],
        |row| row_to_conversation(row, fallback_model),
    )
    .optional()
}

fn model_or(model: Option<String>, fallback: &str) -> String {
    model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn row_to_conversation(row: &Row, fallback_model: &str) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let text = |idx: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };

    Ok(Conversation {
        title: text(1)?,
        model: model_or(row.get(2)?, fallback_model),
        messages: parse_messages(&id, row.get(3)?),
        context: ContextFields {
            master_rules: text(4)?,
            character_sheet: text(5)?,
            local_history: text(6)?,
            current_plot: text(7)?,
            relations: text(8)?,
            compressed_summary: text(9)?,
            last_compression_time: row.get(10)?,
        },
        created_at: parse_timestamp(row.get(11)?, "created_at"),
        updated_at: parse_timestamp(row.get(12)?, "updated_at"),
        id,
    })
}

/// Read-side decoding of a stored message blob. A blob that is not a JSON
/// array reads as empty, and elements that are not messages are skipped;
/// both are logged. Never used on a path that writes the blob back.
fn parse_messages(chat_id: &str, raw: Option<String>) -> Vec<Message> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Vec::new();
    };
    let elements: Vec<Value> = match serde_json::from_str(&raw) {
        Ok(elements) => elements,
        Err(e) => {
            warn!(
                "Stored messages of chat {} are unreadable ({}), substituting an empty list",
                chat_id, e
            );
            return Vec::new();
        }
    };

    elements
        .into_iter()
        .enumerate()
        .filter_map(|(idx, element)| match serde_json::from_value(element) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Skipping unreadable message #{} of chat {}: {}", idx, chat_id, e);
                None
            }
        })
        .collect()
}

/// Write-side decoding: the whole blob must decode, otherwise the caller's
/// transaction is abandoned with [`StoreError::Serialization`].
fn decode_messages(chat_id: &str, raw: Option<String>) -> StoreResult<Vec<Message>> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    serde_json::from_str(&raw).map_err(|e| {
        warn!("Refusing to rewrite unreadable messages of chat {}: {}", chat_id, e);
        StoreError::Serialization(e)
    })
}

fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

fn parse_timestamp(raw: Option<String>, column: &str) -> DateTime<Utc> {
    raw.as_deref()
        .and_then(parse_datetime_safe)
        .unwrap_or_else(|| {
            warn!("Failed to parse {}: {:?}", column, raw);
            DateTime::<Utc>::default()
        })
}
