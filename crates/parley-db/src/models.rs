/// Database row types that map directly to SQLite rows.
/// Converted to `parley_types::Message` at the query boundary.

pub struct MessageRow {
    pub id: String,
    pub sender: String,
    pub target: String,
    pub target_kind: String,
    pub body_kind: String,
    pub content: Option<String>,
    pub duration_secs: Option<u32>,
    pub size: Option<i64>,
    pub created_at: i64,
}

pub const BODY_TEXT: &str = "text";
pub const BODY_AUDIO: &str = "audio";
