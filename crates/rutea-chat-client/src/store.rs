//! Collaborators the session persists through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use rutea_chat_core::{NewMessage, StoredMessage, SummaryPayload};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{IdentityError, StoreError},
    lock,
};

pub const INSERT_FEED_CAPACITY: usize = 64;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of `owner_id`, oldest first.
    async fn list_messages(&self, owner_id: &str) -> Result<Vec<StoredMessage>, StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Insert notifications for `owner_id`, including this client's own
    /// writes. The feed ends when the receiver is dropped.
    async fn subscribe_inserts(
        &self,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<StoredMessage>, StoreError>;
}

/// Persists the structured summary extracted from a reply. Writes are
/// upserts keyed by owner.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn persist_summary(
        &self,
        owner_id: &str,
        summary: &SummaryPayload,
    ) -> Result<(), StoreError>;
}

/// Refreshes the signed-in user after the app returns to the foreground.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh_user(&self) -> Result<(), IdentityError>;
}

#[derive(Default)]
struct StoreState {
    rows: Vec<StoredMessage>,
    feeds: Vec<(String, mpsc::Sender<StoredMessage>)>,
}

/// Process-local message store with store-assigned ids and timestamps.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for InMemoryMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMessageStore")
            .field("rows", &lock(&self.state).rows.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StoredMessage>) -> Self {
        let store = Self::default();
        lock(&store.state).rows = rows;
        store
    }

    /// Stores a row written by another client and announces it to feeds.
    pub fn insert_external(&self, message: NewMessage) -> StoredMessage {
        self.store_and_announce(message)
    }

    pub fn rows(&self) -> Vec<StoredMessage> {
        lock(&self.state).rows.clone()
    }

    fn store_and_announce(&self, message: NewMessage) -> StoredMessage {
        let row = StoredMessage {
            id: Uuid::now_v7().to_string(),
            owner_id: message.owner_id,
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
        };

        let mut state = lock(&self.state);
        state.rows.push(row.clone());
        state.feeds.retain(|(owner_id, feed)| {
            if *owner_id != row.owner_id {
                return !feed.is_closed();
            }
            match feed.try_send(row.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(owner_id = %row.owner_id, "insert feed full, dropping notification");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        row
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn list_messages(&self, owner_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows: Vec<StoredMessage> = lock(&self.state)
            .rows
            .iter()
            .filter(|row| row.owner_id == owner_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        Ok(self.store_and_announce(message))
    }

    async fn subscribe_inserts(
        &self,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<StoredMessage>, StoreError> {
        let (sender, receiver) = mpsc::channel(INSERT_FEED_CAPACITY);
        lock(&self.state).feeds.push((owner_id.to_string(), sender));
        Ok(receiver)
    }
}

/// Keeps the latest summary per owner.
#[derive(Debug, Clone, Default)]
pub struct InMemorySummarySink {
    summaries: Arc<Mutex<HashMap<String, Value>>>,
}

impl InMemorySummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary_for(&self, owner_id: &str) -> Option<Value> {
        lock(&self.summaries).get(owner_id).cloned()
    }
}

#[async_trait]
impl SummarySink for InMemorySummarySink {
    async fn persist_summary(
        &self,
        owner_id: &str,
        summary: &SummaryPayload,
    ) -> Result<(), StoreError> {
        lock(&self.summaries).insert(owner_id.to_string(), summary.clone().into_value());
        Ok(())
    }
}
