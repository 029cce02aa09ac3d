//! Ordered chat log for one owner.
//!
//! The log merges three sources of messages: optimistic local user turns,
//! streamed assistant deltas, and rows delivered by the store (history loads
//! and real-time insert notifications). At most one assistant placeholder is
//! open at a time and it is always the last message.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::message::{
    AssistantReply, ChatMessage, ChatRole, ConversationTurn, LocalId, MessageMeta, StoredMessage,
    TurnId, normalize_text,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("message content is empty")]
    EmptyContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// The row was the store echo of a local message that had no id yet.
    Adopted,
    Duplicate,
    ForeignOwner,
}

/// Text of an assistant turn at the moment it was frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTurn {
    pub local_id: LocalId,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    owner_id: String,
    messages: Vec<ChatMessage>,
    next_local_id: u64,
    next_turn: u64,
}

impl MessageLog {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            messages: Vec::new(),
            next_local_id: 1,
            next_turn: 1,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn open_turn(&self) -> Option<TurnId> {
        self.messages.last().and_then(ChatMessage::open_turn)
    }

    pub fn get(&self, local_id: LocalId) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .find(|message| message.meta().local_id == local_id)
    }

    /// Replaces the log with persisted history, oldest first.
    pub fn hydrate(&mut self, mut rows: Vec<StoredMessage>) {
        rows.retain(|row| row.owner_id == self.owner_id);
        rows.sort_by_key(|row| row.created_at);

        let mut seen = HashSet::new();
        self.messages.clear();
        for row in rows {
            if !seen.insert(row.id.clone()) {
                continue;
            }
            let message = self.message_from_row(row);
            self.messages.push(message);
        }
    }

    /// Appends an optimistic user message. Any open placeholder is closed
    /// first so deltas from the previous turn cannot interleave.
    pub fn append_user_turn(&mut self, text: &str) -> Result<LocalId, LogError> {
        let content = normalize_text(text);
        if content.is_empty() {
            return Err(LogError::EmptyContent);
        }

        self.close_open_turn();
        let meta = self.local_meta();
        let local_id = meta.local_id;
        self.messages.push(ChatMessage::User { meta, content });
        Ok(local_id)
    }

    /// Removes an optimistic user message the store refused. Messages that
    /// already carry a store id are left alone.
    pub fn rollback_user_turn(&mut self, local_id: LocalId) -> bool {
        let Some(index) = self.messages.iter().position(|message| {
            matches!(message, ChatMessage::User { meta, .. }
                if meta.local_id == local_id && meta.remote_id.is_none())
        }) else {
            return false;
        };
        self.messages.remove(index);
        true
    }

    /// Records the store id and timestamp of a local message.
    pub fn confirm(&mut self, local_id: LocalId, row: &StoredMessage) -> bool {
        if self
            .messages
            .iter()
            .any(|message| message.meta().remote_id.as_deref() == Some(row.id.as_str())
                && message.meta().local_id != local_id)
        {
            // A real-time echo was appended as a separate message; keep one.
            self.messages.retain(|message| {
                message.meta().local_id == local_id
                    || message.meta().remote_id.as_deref() != Some(row.id.as_str())
            });
        }

        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.meta().local_id == local_id)
        else {
            return false;
        };
        let meta = message.meta_mut();
        meta.remote_id = Some(row.id.clone());
        meta.created_at = Some(row.created_at);
        true
    }

    /// Opens a new assistant placeholder. A placeholder still open from an
    /// earlier turn is force-closed first.
    pub fn begin_assistant_turn(&mut self) -> TurnId {
        self.close_open_turn();
        let turn = TurnId(self.next_turn);
        self.next_turn += 1;
        let meta = self.local_meta();
        self.messages.push(ChatMessage::Assistant {
            meta,
            reply: AssistantReply::Streaming {
                turn,
                text: String::new(),
            },
        });
        turn
    }

    /// Appends a fragment to the open placeholder of `turn`. Fragments for
    /// any other turn, or arriving after the turn closed, are dropped.
    pub fn apply_delta(&mut self, turn: TurnId, fragment: &str) -> bool {
        if fragment.is_empty() {
            return false;
        }
        match self.open_text_mut(turn) {
            Some(text) => {
                text.push_str(fragment);
                true
            }
            None => {
                debug!(%turn, "dropping delta for closed turn");
                false
            }
        }
    }

    /// Clears partial text before the transport retries a turn.
    pub fn reset_turn(&mut self, turn: TurnId) -> bool {
        match self.open_text_mut(turn) {
            Some(text) => {
                text.clear();
                true
            }
            None => false,
        }
    }

    pub fn open_text(&self, turn: TurnId) -> Option<&str> {
        match self.messages.last() {
            Some(ChatMessage::Assistant {
                reply: AssistantReply::Streaming { turn: open, text },
                ..
            }) if *open == turn => Some(text),
            _ => None,
        }
    }

    /// Freezes the placeholder. An empty turn is removed and yields `None`.
    pub fn finalize_turn(&mut self, turn: TurnId) -> Option<FinalizedTurn> {
        let text = self.open_text(turn)?.to_string();
        if text.trim().is_empty() {
            self.messages.pop();
            return None;
        }

        let last = self.messages.last_mut()?;
        let local_id = last.meta().local_id;
        if let ChatMessage::Assistant { reply, .. } = last {
            *reply = AssistantReply::Complete(text.clone());
        }
        Some(FinalizedTurn {
            local_id,
            content: text,
        })
    }

    /// Removes the placeholder without keeping its text.
    pub fn discard_turn(&mut self, turn: TurnId) -> bool {
        if self.open_text(turn).is_none() {
            return false;
        }
        self.messages.pop();
        true
    }

    /// Replaces the placeholder of a failed turn with a terminal notice. If the
    /// placeholder is already gone the notice is appended instead.
    pub fn fail_turn(&mut self, turn: TurnId, notice: &str) -> LocalId {
        if self.open_text(turn).is_some()
            && let Some(ChatMessage::Assistant { meta, reply }) = self.messages.last_mut()
        {
            *reply = AssistantReply::Failed(notice.to_string());
            return meta.local_id;
        }

        let meta = self.local_meta();
        let local_id = meta.local_id;
        self.messages.push(ChatMessage::Assistant {
            meta,
            reply: AssistantReply::Failed(notice.to_string()),
        });
        local_id
    }

    /// Drops a trailing failure notice so the turn can be produced again.
    pub fn drop_failure_notice(&mut self) -> bool {
        if self
            .messages
            .last()
            .is_some_and(ChatMessage::is_failure_notice)
        {
            self.messages.pop();
            return true;
        }
        false
    }

    /// Merges a row announced by the store's insert feed.
    pub fn merge_remote_insert(&mut self, row: StoredMessage) -> MergeOutcome {
        if row.owner_id != self.owner_id {
            return MergeOutcome::ForeignOwner;
        }
        if self
            .messages
            .iter()
            .any(|message| message.meta().remote_id.as_deref() == Some(row.id.as_str()))
        {
            return MergeOutcome::Duplicate;
        }

        let content = normalize_text(&row.content);
        if let Some(message) = self.messages.iter_mut().find(|message| {
            message.meta().remote_id.is_none()
                && !message.is_streaming()
                && !message.is_failure_notice()
                && message.role() == row.role
                && normalize_text(message.content()) == content
        }) {
            let meta = message.meta_mut();
            meta.remote_id = Some(row.id);
            meta.created_at = Some(row.created_at);
            return MergeOutcome::Adopted;
        }

        let message = self.message_from_row(row);
        if self.open_turn().is_some() {
            let index = self.messages.len() - 1;
            self.messages.insert(index, message);
        } else {
            self.messages.push(message);
        }
        MergeOutcome::Appended
    }

    /// Settled turns in order, as sent to the completion endpoint.
    pub fn conversation_turns(&self) -> Vec<ConversationTurn> {
        self.messages
            .iter()
            .filter_map(ChatMessage::as_turn)
            .collect()
    }

    fn close_open_turn(&mut self) {
        if let Some(turn) = self.open_turn()
            && self.finalize_turn(turn).is_some()
        {
            debug!(%turn, "force-closed open assistant turn");
        }
    }

    fn open_text_mut(&mut self, turn: TurnId) -> Option<&mut String> {
        match self.messages.last_mut() {
            Some(ChatMessage::Assistant {
                reply: AssistantReply::Streaming { turn: open, text },
                ..
            }) if *open == turn => Some(text),
            _ => None,
        }
    }

    fn local_meta(&mut self) -> MessageMeta {
        let local_id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        MessageMeta {
            local_id,
            owner_id: self.owner_id.clone(),
            remote_id: None,
            created_at: None,
        }
    }

    fn message_from_row(&mut self, row: StoredMessage) -> ChatMessage {
        let mut meta = self.local_meta();
        meta.remote_id = Some(row.id);
        meta.created_at = Some(row.created_at);
        match row.role {
            ChatRole::User => ChatMessage::User {
                meta,
                content: row.content,
            },
            ChatRole::Assistant => ChatMessage::Assistant {
                meta,
                reply: AssistantReply::Complete(row.content),
            },
        }
    }
}
