use crate::events::{AiFragment, ChatMessage};
use tracing::debug;

/// Text accumulated for the response currently being streamed
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Fragments received so far, concatenated in arrival order
    pending_buffer: String,
    /// True from `begin` until the terminal fragment
    in_flight: bool,
    /// True until the first fragment of a response arrives
    loading: bool,
}

impl StreamState {
    pub fn pending(&self) -> &str {
        &self.pending_buffer
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Clear all state
    pub fn clear(&mut self) {
        self.pending_buffer.clear();
        self.in_flight = false;
        self.loading = false;
    }
}

/// Generation request produced by [`StreamAssembler::begin`]
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Full rolling history including the new user turn
    pub history: Vec<ChatMessage>,
    /// `None` asks the server for its default model
    pub model: Option<String>,
}

/// What a fragment did to the assembler
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    /// Content appended to the pending buffer
    Appended,
    /// Terminal fragment; the finished assistant message
    Completed(ChatMessage),
    /// Fragment arrived with no response in flight
    Ignored,
}

/// Assembles a token-streamed AI response into one assistant message.
///
/// One response at a time: a new `begin` while a response is in flight is
/// rejected rather than queued. Fragments are applied in arrival order with
/// no reordering or deduplication.
#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    state: StreamState,
    history: Vec<ChatMessage>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new round. Returns `None` when a response is still in flight.
    pub fn begin(&mut self, message: &str, model: Option<&str>) -> Option<GenerationRequest> {
        if self.state.in_flight {
            debug!("generation already in flight, rejecting new message");
            return None;
        }

        self.history.push(ChatMessage::user(message));
        self.state.pending_buffer.clear();
        self.state.in_flight = true;
        self.state.loading = true;

        Some(GenerationRequest {
            history: self.history.clone(),
            model: model.filter(|m| !m.is_empty()).map(str::to_string),
        })
    }

    /// Undo `begin` after the generation request could not be sent
    fn abort(&mut self) {
        if !self.state.in_flight {
            return;
        }
        if matches!(self.history.last(), Some(last) if last.role == crate::events::ChatRole::User) {
            self.history.pop();
        }
        self.state.clear();
    }

    /// The generation request came back with an error.
    ///
    /// Before the first fragment the round is undone. Once fragments have
    /// streamed, what arrived so far becomes the assistant message.
    pub fn on_request_failed(&mut self) -> Option<ChatMessage> {
        if !self.state.in_flight {
            return None;
        }
        if self.state.loading {
            self.abort();
            return None;
        }

        debug!(kept = self.state.pending_buffer.len(), "request failed mid-stream, keeping partial answer");
        let finished = ChatMessage::assistant(std::mem::take(&mut self.state.pending_buffer));
        self.history.push(finished.clone());
        self.state.clear();
        Some(finished)
    }

    /// Apply one fragment of the streamed response
    pub fn on_fragment(&mut self, fragment: AiFragment) -> FragmentOutcome {
        if !self.state.in_flight {
            debug!(done = fragment.done, "dropping fragment with no response in flight");
            return FragmentOutcome::Ignored;
        }

        // First token clears the "waiting" indicator, streaming continues
        self.state.loading = false;

        if !fragment.done {
            self.state.pending_buffer.push_str(&fragment.message.content);
            return FragmentOutcome::Appended;
        }

        let finished = ChatMessage::assistant(std::mem::take(&mut self.state.pending_buffer));
        self.history.push(finished.clone());
        self.state.in_flight = false;
        FragmentOutcome::Completed(finished)
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }
}
