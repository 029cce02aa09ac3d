use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a message inside a single log. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub(crate) u64);

impl LocalId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Identity of one assistant turn. Deltas carry it so late fragments from a
/// superseded turn can never land in a newer placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub(crate) u64);

impl TurnId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub local_id: LocalId,
    pub owner_id: String,
    /// Store-assigned id; `None` until the store acknowledges the write.
    pub remote_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistantReply {
    /// Open placeholder accepting deltas for `turn`.
    Streaming { turn: TurnId, text: String },
    Complete(String),
    /// Terminal notice shown in place of a turn that could not be produced.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    User { meta: MessageMeta, content: String },
    Assistant { meta: MessageMeta, reply: AssistantReply },
}

impl ChatMessage {
    #[must_use]
    pub fn role(&self) -> ChatRole {
        match self {
            Self::User { .. } => ChatRole::User,
            Self::Assistant { .. } => ChatRole::Assistant,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &MessageMeta {
        match self {
            Self::User { meta, .. } | Self::Assistant { meta, .. } => meta,
        }
    }

    pub(crate) fn meta_mut(&mut self) -> &mut MessageMeta {
        match self {
            Self::User { meta, .. } | Self::Assistant { meta, .. } => meta,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::User { content, .. } => content,
            Self::Assistant { reply, .. } => match reply {
                AssistantReply::Streaming { text, .. } => text,
                AssistantReply::Complete(text) | AssistantReply::Failed(text) => text,
            },
        }
    }

    #[must_use]
    pub fn open_turn(&self) -> Option<TurnId> {
        match self {
            Self::Assistant {
                reply: AssistantReply::Streaming { turn, .. },
                ..
            } => Some(*turn),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.open_turn().is_some()
    }

    #[must_use]
    pub fn is_failure_notice(&self) -> bool {
        matches!(
            self,
            Self::Assistant {
                reply: AssistantReply::Failed(_),
                ..
            }
        )
    }

    /// Completed turns that count as conversation context.
    #[must_use]
    pub fn as_turn(&self) -> Option<ConversationTurn> {
        let content = match self {
            Self::User { content, .. } => content,
            Self::Assistant {
                reply: AssistantReply::Complete(text),
                ..
            } => text,
            Self::Assistant { .. } => return None,
        };
        if content.trim().is_empty() {
            return None;
        }
        Some(ConversationTurn {
            role: self.role(),
            content: content.clone(),
        })
    }
}

/// A message row as the store returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation has no turns")]
    Empty,
    #[error("conversation must end with a user turn, found {0}")]
    LastTurnNotUser(ChatRole),
}

/// Body of a streaming completion call: `{"turns":[{"role":..,"content":..}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub turns: Vec<ConversationTurn>,
}

impl CompletionRequest {
    pub fn new(turns: Vec<ConversationTurn>) -> Result<Self, ConversationError> {
        match turns.last() {
            None => Err(ConversationError::Empty),
            Some(turn) if turn.role != ChatRole::User => {
                Err(ConversationError::LastTurnNotUser(turn.role))
            }
            Some(_) => Ok(Self { turns }),
        }
    }
}

pub(crate) fn normalize_text(value: &str) -> String {
    value.trim().to_string()
}
