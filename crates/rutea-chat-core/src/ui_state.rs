//! Request-level UI state with a fixed transition table.
//!
//! Requests for transitions that are not in the table are ignored and
//! reported as `false`; the context is left untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const TIMED_OUT_MESSAGE: &str = "Request timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiState {
    Idle,
    Loading,
    Streaming,
    Success,
    Error,
    Paused,
    Retrying,
}

impl UiState {
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [UiState] {
        use UiState::{Error, Idle, Loading, Paused, Retrying, Streaming, Success};
        match self {
            Idle => &[Loading],
            Loading => &[Streaming, Success, Error, Paused],
            Streaming => &[Success, Error, Paused],
            Success => &[Idle, Loading],
            Error => &[Idle, Retrying, Loading],
            Paused => &[Loading, Streaming, Error],
            Retrying => &[Loading, Error],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: UiState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// A request is in flight or suspended.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Streaming | Self::Paused | Self::Retrying
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiStateContext {
    pub state: UiState,
    pub error: Option<String>,
    /// Percent complete, 0..=100.
    pub progress: Option<u8>,
    pub can_retry: bool,
    pub retry_count: u32,
}

impl Default for UiStateContext {
    fn default() -> Self {
        Self {
            state: UiState::Idle,
            error: None,
            progress: None,
            can_retry: false,
            retry_count: 0,
        }
    }
}

/// Proof that a loading timeout was armed. Only the most recently armed
/// ticket can expire; re-entering loading or leaving it invalidates older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTicket {
    generation: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct UiStateMachine {
    context: UiStateContext,
    generation: u64,
    armed: Option<u64>,
}

impl UiStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &UiStateContext {
        &self.context
    }

    pub fn state(&self) -> UiState {
        self.context.state
    }

    pub fn is_busy(&self) -> bool {
        self.context.state.is_busy()
    }

    /// Moves to `next` if the table allows it.
    pub fn request_transition(&mut self, next: UiState) -> bool {
        let current = self.context.state;
        if !current.can_transition_to(next) {
            debug!(from = ?current, to = ?next, "ignoring ui transition");
            return false;
        }
        if current == UiState::Loading {
            self.armed = None;
        }
        self.context.state = next;
        true
    }

    pub fn start_loading(&mut self) -> bool {
        if !self.request_transition(UiState::Loading) {
            return false;
        }
        self.context.error = None;
        self.context.progress = None;
        true
    }

    /// Arms a watchdog for the current loading phase.
    pub fn arm_timeout(&mut self, duration: Duration) -> Option<TimeoutTicket> {
        if self.context.state != UiState::Loading {
            return None;
        }
        self.generation += 1;
        self.armed = Some(self.generation);
        Some(TimeoutTicket {
            generation: self.generation,
            duration,
        })
    }

    /// Fires an armed watchdog. Stale tickets and tickets whose loading phase
    /// already ended are ignored.
    pub fn expire(&mut self, ticket: TimeoutTicket) -> bool {
        if self.armed != Some(ticket.generation) || self.context.state != UiState::Loading {
            return false;
        }
        self.fail(TIMED_OUT_MESSAGE, true)
    }

    pub fn start_streaming(&mut self) -> bool {
        if !self.request_transition(UiState::Streaming) {
            return false;
        }
        self.context.progress = Some(0);
        true
    }

    pub fn update_progress(&mut self, percent: u8) -> bool {
        if !matches!(self.context.state, UiState::Loading | UiState::Streaming) {
            return false;
        }
        self.context.progress = Some(percent.min(100));
        true
    }

    pub fn succeed(&mut self) -> bool {
        if !self.request_transition(UiState::Success) {
            return false;
        }
        self.context.error = None;
        self.context.progress = Some(100);
        self.context.can_retry = false;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, can_retry: bool) -> bool {
        if !self.request_transition(UiState::Error) {
            return false;
        }
        self.context.error = Some(error.into());
        self.context.can_retry = can_retry;
        true
    }

    pub fn pause(&mut self) -> bool {
        self.request_transition(UiState::Paused)
    }

    /// Paused requests resume through `loading`.
    pub fn resume(&mut self) -> bool {
        if self.context.state != UiState::Paused {
            return false;
        }
        self.request_transition(UiState::Loading)
    }

    pub fn retry(&mut self) -> bool {
        if self.context.state != UiState::Error || !self.context.can_retry {
            return false;
        }
        if !self.request_transition(UiState::Retrying) {
            return false;
        }
        self.context.retry_count += 1;
        self.context.error = None;
        true
    }

    pub fn reset(&mut self) -> bool {
        if !self.request_transition(UiState::Idle) {
            return false;
        }
        self.clear();
        true
    }

    /// Returns to `idle` from any state, bypassing the table.
    pub fn force_reset(&mut self) {
        self.clear();
        self.context.state = UiState::Idle;
    }

    fn clear(&mut self) {
        self.armed = None;
        self.context = UiStateContext::default();
    }
}
