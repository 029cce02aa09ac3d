//! Runtime-free building blocks of a streaming coaching chat session.

pub mod extract;
pub mod message;
pub mod message_log;
pub mod sse;
pub mod ui_state;

pub use extract::{Extraction, SchemaError, SummaryPayload, extract_summary, validate_summary};
pub use message::{
    AssistantReply, ChatMessage, ChatRole, CompletionRequest, ConversationError, ConversationTurn,
    LocalId, MessageMeta, NewMessage, StoredMessage, TurnId,
};
pub use message_log::{FinalizedTurn, LogError, MergeOutcome, MessageLog};
pub use sse::{CompletionFrame, DONE_SENTINEL, FrameError, SseDecoder, SseEvent, parse_completion_frame};
pub use ui_state::{TimeoutTicket, UiState, UiStateContext, UiStateMachine};
