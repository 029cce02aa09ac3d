//! Streaming chat session client: transport, request registry, lifecycle
//! coordination and the session orchestrator.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod store;
pub mod summary;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use config::{
    ChatClientConfig, ConfigError, EndpointConfig, LifecycleConfig, RegistryConfig, SessionConfig,
    StreamConfig,
};
pub use error::{IdentityError, SessionError, StoreError, TransportError};
pub use lifecycle::{
    CallbackId, LifecycleCoordinator, LifecycleHooks, LifecycleState, LifecycleTransition,
    NoopHooks, Visibility,
};
pub use registry::{
    CancelReason, ReaperGuard, RequestHandle, RequestKind, RequestOptions, RequestRegistry,
};
pub use session::{ChatSession, SessionDeps, SessionSnapshot, StreamSessionView, TurnOutcome};
pub use store::{
    IdentityProvider, InMemoryMessageStore, InMemorySummarySink, MessageStore, SummarySink,
};
pub use summary::HttpSummaryClient;
pub use transport::{
    ByteStream, CompletionEndpoint, HttpCompletionEndpoint, StreamClient, StreamObserver,
    StreamOutcome, StreamStatus,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
