use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec;

/// Whether a message or call targets a single user or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Direct,
    Group,
}

impl TargetKind {
    pub fn from_is_group(is_group: bool) -> Self {
        if is_group { Self::Group } else { Self::Direct }
    }

    pub fn is_group(self) -> bool {
        self == Self::Group
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Key of one conversation log in the history store.
///
/// Direct conversations are keyed by the unordered pair of participants so
/// both sides read the same log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct(String, String),
    Group(String),
}

impl ConversationKey {
    pub fn direct(a: &str, b: &str) -> Self {
        if a <= b {
            Self::Direct(a.to_string(), b.to_string())
        } else {
            Self::Direct(b.to_string(), a.to_string())
        }
    }

    pub fn group(name: &str) -> Self {
        Self::Group(name.to_string())
    }

    /// Stable, unambiguous string form used as the storage index.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Direct(a, b) => {
                format!("direct/{}", codec::encode_pairs(&[(a.clone(), b.clone())]))
            }
            Self::Group(name) => format!("group/{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Voice note metadata; the payload is stored separately.
    Audio { duration_secs: u32, size: u64 },
}

impl MessageBody {
    /// Text shown for this body in history listings.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(content) => content.clone(),
            Self::Audio { duration_secs, size } => {
                format!("[AUDIO {}s, {} bytes]", duration_secs, size)
            }
        }
    }
}

/// An immutable chat message, text or voice note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub target: String,
    pub kind: TargetKind,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn text(sender: &str, target: &str, kind: TargetKind, content: &str) -> Self {
        Self::with_body(sender, target, kind, MessageBody::Text(content.to_string()))
    }

    pub fn audio(sender: &str, target: &str, kind: TargetKind, duration_secs: u32, size: u64) -> Self {
        Self::with_body(sender, target, kind, MessageBody::Audio { duration_secs, size })
    }

    fn with_body(sender: &str, target: &str, kind: TargetKind, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            target: target.to_string(),
            kind,
            body,
            created_at: now_millis(),
        }
    }

    pub fn conversation(&self) -> ConversationKey {
        match self.kind {
            TargetKind::Direct => ConversationKey::direct(&self.sender, &self.target),
            TargetKind::Group => ConversationKey::group(&self.target),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.body, MessageBody::Audio { .. })
    }
}

/// A voice note in transit: metadata plus the raw PCM/WAV payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioNote {
    pub message: Message,
    pub payload: Vec<u8>,
}

impl AudioNote {
    pub fn new(sender: &str, target: &str, kind: TargetKind, duration_secs: u32, payload: Vec<u8>) -> Self {
        let message = Message::audio(sender, target, kind, duration_secs, payload.len() as u64);
        Self { message, payload }
    }
}

/// Current time truncated to millisecond precision, which is what the wire
/// and the store carry.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
