//! Database schema definitions for the chat store
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Name of the single denormalized conversation table.
pub const CHATS_TABLE: &str = "chats";

/// Model identifier written when a save does not name one.
pub const CANONICAL_MODEL: &str = "gemini-2.5-pro";

/// Model identifiers from older clients that are rewritten to [`CANONICAL_MODEL`].
pub const LEGACY_MODELS: &[&str] = &[
    "gemini-pro",
    "gemini-1.5-pro-latest",
    "gemini-1.5-flash-latest",
];

/// Title given to conversations saved without one.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Title shown in listings for rows whose stored title is blank.
pub const UNTITLED: &str = "Untitled conversation";

/// Who produced a message. Values written by other clients are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "user" => Role::User,
            "assistant" | "model" => Role::Assistant,
            _ => Role::Other(raw),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::Other(raw) => raw,
        }
    }
}

/// Delivery state of a message as tracked by the client
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeliveryStatus {
    Pending,
    #[default]
    Sent,
    Failed,
    Other(String),
}

impl From<String> for DeliveryStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "pending" => DeliveryStatus::Pending,
            "sent" | "saved" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Other(raw),
        }
    }
}

impl From<DeliveryStatus> for String {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Pending => "pending".to_string(),
            DeliveryStatus::Sent => "sent".to_string(),
            DeliveryStatus::Failed => "failed".to_string(),
            DeliveryStatus::Other(raw) => raw,
        }
    }
}

/// `null` reads as the type's default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One turn of a conversation, stored inside the conversation's `messages` blob.
///
/// Decoding is tolerant of what older clients wrote: `null` fields take
/// their defaults, a missing or unfamiliar `sender` is carried as is, and
/// keys the store does not model are kept in `extra`, so a load/save cycle
/// never drops client data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Role>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: DeliveryStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub retry_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(id: Option<&str>, sender: Role, content: &str) -> Self {
        Self {
            id: id.map(str::to_string),
            sender: Some(sender),
            content: content.to_string(),
            files: Vec::new(),
            status: DeliveryStatus::Sent,
            retry_count: 0,
            error_message: None,
            timestamp: Some(Utc::now().timestamp_millis()),
            extra: Map::new(),
        }
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == Some(Role::User)
    }
}

/// Free-text slots attached to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextFields {
    pub master_rules: String,
    pub character_sheet: String,
    pub local_history: String,
    pub current_plot: String,
    pub relations: String,
    /// Long-form compressed summary of the adventure so far
    #[serde(rename = "aventura")]
    pub compressed_summary: String,
    #[serde(rename = "lastCompressionTime")]
    pub last_compression_time: Option<String>,
}

/// Names of the context slots. The key doubles as the column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextField {
    MasterRules,
    CharacterSheet,
    LocalHistory,
    CurrentPlot,
    Relations,
    CompressedSummary,
    LastCompressionTime,
}

impl ContextField {
    pub const ALL: [ContextField; 7] = [
        ContextField::MasterRules,
        ContextField::CharacterSheet,
        ContextField::LocalHistory,
        ContextField::CurrentPlot,
        ContextField::Relations,
        ContextField::CompressedSummary,
        ContextField::LastCompressionTime,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ContextField::MasterRules => "master_rules",
            ContextField::CharacterSheet => "character_sheet",
            ContextField::LocalHistory => "local_history",
            ContextField::CurrentPlot => "current_plot",
            ContextField::Relations => "relations",
            ContextField::CompressedSummary => "aventura",
            ContextField::LastCompressionTime => "lastCompressionTime",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }
}

/// Partial context update as received from a client: key -> new value.
/// `None` clears a slot. Unknown keys are ignored by the store.
pub type ContextPatch = BTreeMap<String, Option<String>>;

/// Keeps only the recognized entries of a patch, in column order.
pub fn recognized_fields(patch: &ContextPatch) -> Vec<(ContextField, Option<&str>)> {
    ContextField::ALL
        .into_iter()
        .filter_map(|field| {
            patch
                .get(field.key())
                .map(|value| (field, value.as_deref()))
        })
        .collect()
}

/// A stored conversation with its messages and context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub context: ContextFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub preview: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input of a create-or-update save
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveConversation {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Result of a store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    ContextUpdated,
    Renamed,
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChatStats {
    pub total_chats: usize,
    pub total_messages: usize,
}

/// One column of the chats table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    /// Declaration used by CREATE TABLE
    pub definition: &'static str,
    /// Declaration used by ALTER TABLE ADD COLUMN. SQLite refuses non-constant
    /// defaults there, so timestamp columns are added bare and backfilled.
    pub add_definition: &'static str,
    pub primary_key: bool,
    /// SQL expression written into rows left NULL after the column is added
    pub backfill: Option<&'static str>,
}

const fn column(name: &'static str, definition: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        definition,
        add_definition: definition,
        primary_key: false,
        backfill: None,
    }
}

const fn timestamp_column(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        definition: "DATETIME DEFAULT CURRENT_TIMESTAMP",
        add_definition: "DATETIME",
        primary_key: false,
        backfill: Some("CURRENT_TIMESTAMP"),
    }
}

/// The schema descriptor: every column the chats table must carry, in order.
pub const CHAT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "id",
        definition: "TEXT PRIMARY KEY",
        add_definition: "TEXT",
        primary_key: true,
        backfill: None,
    },
    ColumnSpec {
        name: "title",
        definition: "TEXT NOT NULL",
        add_definition: "TEXT NOT NULL DEFAULT ''",
        primary_key: false,
        backfill: None,
    },
    column("model", "TEXT NOT NULL DEFAULT 'gemini-2.5-pro'"),
    column("messages", "TEXT DEFAULT '[]'"),
    column("master_rules", "TEXT DEFAULT ''"),
    column("character_sheet", "TEXT DEFAULT ''"),
    column("local_history", "TEXT DEFAULT ''"),
    column("current_plot", "TEXT DEFAULT ''"),
    column("relations", "TEXT DEFAULT ''"),
    column("aventura", "TEXT DEFAULT ''"),
    column("lastCompressionTime", "TEXT DEFAULT NULL"),
    timestamp_column("created_at"),
    timestamp_column("updated_at"),
];

/// CREATE TABLE statement built from [`CHAT_COLUMNS`].
pub fn create_table_sql() -> String {
    let columns = CHAT_COLUMNS
        .iter()
        .map(|col| format!("    {} {}", col.name, col.definition))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE IF NOT EXISTS {CHATS_TABLE} (\n{columns}\n)")
}

pub const INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_chats_updated_at ON chats (updated_at);
";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_keeps_unknown_keys() {
        let raw = json!({
            "id": "m1",
            "sender": "user",
            "content": "hi",
            "files": [],
            "status": "failed",
            "retryCount": 2,
            "errorMessage": "timeout",
            "errorType": "network",
            "timestamp": 1_700_000_000_000_i64
        });
        let msg: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert_eq!(msg.retry_count, 2);
        assert_eq!(msg.extra.get("errorType"), Some(&json!("network")));
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn message_defaults_missing_keys() {
        let msg: Message = serde_json::from_value(json!({"sender": "model"})).unwrap();
        assert_eq!(msg.id, None);
        assert_eq!(msg.sender, Some(Role::Assistant));
        assert_eq!(msg.content, "");
        assert_eq!(msg.status, DeliveryStatus::Sent);
    }

    #[test]
    fn message_tolerates_nulls_and_foreign_values() {
        let raw = json!({
            "id": "b",
            "content": null,
            "files": null,
            "status": "queued",
            "retryCount": -1
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.sender, None);
        assert_eq!(msg.content, "");
        assert!(msg.files.is_empty());
        assert_eq!(msg.status, DeliveryStatus::Other("queued".into()));
        assert_eq!(msg.retry_count, -1);

        let written = serde_json::to_value(&msg).unwrap();
        assert!(written.get("sender").is_none());
        assert_eq!(written["status"], "queued");

        let system: Message = serde_json::from_value(json!({"sender": "system", "content": "x"})).unwrap();
        assert_eq!(system.sender, Some(Role::Other("system".into())));
        assert_eq!(serde_json::to_value(&system).unwrap()["sender"], "system");
    }

    #[test]
    fn context_field_keys_round_trip() {
        for field in ContextField::ALL {
            assert_eq!(ContextField::from_key(field.key()), Some(field));
        }
        assert_eq!(ContextField::from_key("title"), None);
    }

    #[test]
    fn recognized_fields_drops_unknown_keys() {
        let mut patch = ContextPatch::new();
        patch.insert("relations".into(), Some("allies".into()));
        patch.insert("bogus".into(), Some("x".into()));
        patch.insert("lastCompressionTime".into(), None);

        let fields = recognized_fields(&patch);
        assert_eq!(
            fields,
            vec![
                (ContextField::Relations, Some("allies")),
                (ContextField::LastCompressionTime, None),
            ]
        );
    }

    #[test]
    fn descriptor_matches_context_fields() {
        for field in ContextField::ALL {
            assert!(CHAT_COLUMNS.iter().any(|c| c.name == field.key()));
        }
        assert_eq!(CHAT_COLUMNS.iter().filter(|c| c.primary_key).count(), 1);
        assert!(create_table_sql().contains("lastCompressionTime TEXT DEFAULT NULL"));
    }
}
