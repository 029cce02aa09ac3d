use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("completion_request_invalid:{0}")]
    InvalidRequest(String),
    /// The endpoint answered with a non-success status. Not retried.
    #[error("completion_http_{status}:{body}")]
    Rejected { status: StatusCode, body: String },
    #[error("completion_network_failed:{0}")]
    Network(String),
    #[error("completion_timed_out_after_{}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("completion_cancelled")]
    Cancelled,
    #[error("completion_retries_exhausted_after_{attempts}_attempts:{last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// The failure that ended the stream, looking through `Exhausted`.
    #[must_use]
    pub fn root(&self) -> &TransportError {
        match self {
            Self::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store_request_failed:{0}")]
    Request(String),
    #[error("store_http_{status}:{body}")]
    Rejected { status: StatusCode, body: String },
    #[error("store_decode_failed:{0}")]
    Decode(String),
    #[error("store_request_cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity_refresh_failed:{0}")]
    Refresh(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyInput,
    #[error("a reply is already in progress")]
    Busy,
    /// The store refused the user's message; the optimistic entry was rolled
    /// back and the text is returned for the input box.
    #[error("user message was not saved: {source}")]
    UserTurnNotPersisted {
        restored_input: String,
        #[source]
        source: StoreError,
    },
    #[error("nothing to retry")]
    NothingToRetry,
    #[error("history load failed: {0}")]
    History(#[source] StoreError),
    #[error("realtime subscription failed: {0}")]
    Realtime(#[source] StoreError),
    #[error("reply stream failed: {0}")]
    Stream(#[from] TransportError),
}

/// Renders a non-success response body, `<empty>` when blank.
pub(crate) fn http_error_body(body: &[u8]) -> String {
    let body = String::from_utf8_lossy(body);
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "<empty>".to_string()
    } else {
        trimmed.to_string()
    }
}
