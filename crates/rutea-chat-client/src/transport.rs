//! Streaming completion transport.
//!
//! `StreamClient` posts the conversation to a [`CompletionEndpoint`], decodes
//! the SSE body into deltas and retries transient failures with linear
//! backoff. Every attempt is bounded by the configured timeout.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use rutea_chat_core::{
    CompletionFrame, CompletionRequest, ConversationTurn, SseDecoder, SseEvent,
    parse_completion_frame,
};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::{EndpointConfig, StreamConfig},
    error::{TransportError, http_error_body},
};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Opens one streaming completion response.
#[async_trait]
pub trait CompletionEndpoint: Send + Sync {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpCompletionEndpoint {
    url: String,
    http: reqwest::Client,
}

impl HttpCompletionEndpoint {
    pub fn new(endpoints: &EndpointConfig) -> Self {
        Self::with_client(endpoints.completion_url(), reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CompletionEndpoint for HttpCompletionEndpoint {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        let response = self
            .http
            .post(self.url.as_str())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .json(request)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.bytes().await {
                Ok(bytes) => http_error_body(&bytes),
                Err(error) => format!("<unreadable: {error}>"),
            };
            warn!(url = %self.url, %status, "completion endpoint rejected request");
            return Err(TransportError::Rejected { status, body });
        }

        let chunks = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|error| TransportError::Network(error.to_string()))
        });
        Ok(Box::pin(chunks))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Open,
    Paused,
    Closed,
    Failed,
}

/// Receives the progress of one `open_stream` call.
pub trait StreamObserver: Send {
    fn on_delta(&mut self, fragment: &str);

    fn on_status(&mut self, _status: StreamStatus) {}

    /// Called before retry number `retry`; text delivered by the failed
    /// attempt should be discarded.
    fn on_retry(&mut self, _retry: u32, _delay: Duration, _cause: &TransportError) {}

    /// Called once with the failure that ends the stream. Not called for
    /// cancellation.
    fn on_error(&mut self, _error: &TransportError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub attempts: u32,
    /// Deltas delivered by the successful attempt.
    pub deltas: usize,
    pub saw_sentinel: bool,
}

#[derive(Clone)]
pub struct StreamClient {
    endpoint: Arc<dyn CompletionEndpoint>,
    config: StreamConfig,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct AttemptOutcome {
    deltas: usize,
    saw_sentinel: bool,
}

enum FrameFlow {
    Continue,
    Done,
}

impl StreamClient {
    pub fn new(endpoint: Arc<dyn CompletionEndpoint>, config: StreamConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Streams one assistant reply for `turns`, which must end with a user
    /// turn. Network failures and timeouts are retried up to
    /// `max_retries` times; rejections and cancellation end the call at once.
    pub async fn open_stream<O>(
        &self,
        turns: Vec<ConversationTurn>,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<StreamOutcome, TransportError>
    where
        O: StreamObserver + ?Sized,
    {
        let request = match CompletionRequest::new(turns) {
            Ok(request) => request,
            Err(error) => {
                let error = TransportError::InvalidRequest(error.to_string());
                observer.on_error(&error);
                return Err(error);
            }
        };

        let mut retries = 0u32;
        loop {
            observer.on_status(StreamStatus::Connecting);
            let error = match self.attempt(&request, cancel, observer).await {
                Ok(attempt) => {
                    observer.on_status(StreamStatus::Closed);
                    return Ok(StreamOutcome {
                        attempts: retries + 1,
                        deltas: attempt.deltas,
                        saw_sentinel: attempt.saw_sentinel,
                    });
                }
                Err(error) => error,
            };

            if matches!(error, TransportError::Cancelled) {
                observer.on_status(StreamStatus::Closed);
                return Err(error);
            }
            if !error.is_retryable() {
                observer.on_status(StreamStatus::Failed);
                observer.on_error(&error);
                return Err(error);
            }
            if retries >= self.config.max_retries {
                let attempts = retries + 1;
                warn!(attempts, %error, "completion stream retries exhausted");
                observer.on_status(StreamStatus::Failed);
                observer.on_error(&error);
                return Err(TransportError::Exhausted {
                    attempts,
                    last: Box::new(error),
                });
            }

            retries += 1;
            let delay = self.config.backoff_for(retries);
            warn!(
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying completion stream"
            );
            observer.on_retry(retries, delay, &error);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    observer.on_status(StreamStatus::Closed);
                    return Err(TransportError::Cancelled);
                }
                () = sleep(delay) => {}
            }
        }
    }

    async fn attempt<O>(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<AttemptOutcome, TransportError>
    where
        O: StreamObserver + ?Sized,
    {
        let timeout = self.config.timeout;
        let deadline = Instant::now() + timeout;

        let mut body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            () = sleep_until(deadline) => return Err(TransportError::Timeout(timeout)),
            opened = self.endpoint.open(request) => opened?,
        };
        observer.on_status(StreamStatus::Open);

        let mut decoder = SseDecoder::new();
        let mut deltas = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = sleep_until(deadline) => return Err(TransportError::Timeout(timeout)),
                next = body.next() => next,
            };

            let events = match next {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(error)) => return Err(error),
                None => {
                    let tail: Vec<SseEvent> = decoder.finish().into_iter().collect();
                    let saw_sentinel = tail
                        .iter()
                        .any(|event| matches!(dispatch(event, observer, &mut deltas), FrameFlow::Done));
                    if !saw_sentinel {
                        warn!(deltas, "completion stream closed without sentinel");
                    }
                    return Ok(AttemptOutcome {
                        deltas,
                        saw_sentinel,
                    });
                }
            };

            for event in &events {
                if let FrameFlow::Done = dispatch(event, observer, &mut deltas) {
                    debug!(deltas, "completion stream finished");
                    return Ok(AttemptOutcome {
                        deltas,
                        saw_sentinel: true,
                    });
                }
            }
        }
    }
}

fn dispatch<O>(event: &SseEvent, observer: &mut O, deltas: &mut usize) -> FrameFlow
where
    O: StreamObserver + ?Sized,
{
    match parse_completion_frame(&event.data) {
        Ok(CompletionFrame::Delta(fragment)) => {
            *deltas += 1;
            observer.on_delta(&fragment);
            FrameFlow::Continue
        }
        Ok(CompletionFrame::Done) => FrameFlow::Done,
        Ok(CompletionFrame::Empty) => FrameFlow::Continue,
        Err(error) => {
            warn!(%error, "skipping malformed completion frame");
            FrameFlow::Continue
        }
    }
}
