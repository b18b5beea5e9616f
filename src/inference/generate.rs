//! Autoregressive generation loop
//!
//! Samples one token at a time after prefill, streams each piece through the
//! session's sink and feeds the token back into the context.
//!
//! Termination checks run in a fixed order every step:
//! 1. budget spent, generation flag cleared or interruption requested: Stopped
//! 2. end-of-generation token or legacy stop sequence: Completed
//!
//! Both emit a trailing terminator. A sink returning `true` stops the loop
//! immediately without one. A failed decode aborts the turn.

use crate::inference::error::ChatError;
use crate::inference::runtime::{ModelRuntime, Token};
use crate::inference::session::ChatSession;
use crate::inference::streaming::{EventKind, Utf8Carry, TURN_TERMINATOR};

/// Where the generation loop is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// End of turn reached normally
    Completed,
    /// Budget exhausted or cancellation requested
    Stopped,
    /// A runtime failure ended the turn
    Aborted,
}

/// Returns true if `generated` ends with the non-empty `stop` sequence.
pub fn ends_with_stop_sequence(generated: &[Token], stop: &[Token]) -> bool {
    !stop.is_empty() && generated.ends_with(stop)
}

impl<R: ModelRuntime> ChatSession<R> {
    /// Generates up to `max_tokens` tokens for the current turn.
    ///
    /// The effective budget is the smaller of `max_tokens` and the session's
    /// per-turn budget. Returns the state the loop ended in; a decode failure
    /// leaves the state at [`LoopState::Aborted`] and returns the error.
    pub fn generate(&mut self, max_tokens: usize) -> Result<LoopState, ChatError> {
        const OP: &str = "generate";

        if max_tokens == 0 {
            return Err(self.report(OP, ChatError::Params("token budget is zero".to_string())));
        }

        let budget = max_tokens.min(self.max_tokens_per_turn);
        self.state = LoopState::Running;
        self.control.set_generating(true);

        let result = self.run_loop(budget);

        self.state = match &result {
            Ok(state) => *state,
            Err(_) => LoopState::Aborted,
        };
        self.control.set_generating(false);
        tracing::debug!("Generation ended: {:?} at position {}", self.state, self.position);

        result
    }

    fn run_loop(&mut self, budget: usize) -> Result<LoopState, ChatError> {
        const OP: &str = "generate";

        let mut generated: Vec<Token> = Vec::new();
        let mut text = Utf8Carry::default();

        let mut step = 0;
        loop {
            if step >= budget || !self.control.is_generating() || self.control.is_interrupted() {
                self.emit(EventKind::Response, TURN_TERMINATOR);
                return Ok(LoopState::Stopped);
            }

            let token = self.runtime.sample();
            generated.push(token);
            self.runtime.accept(token);

            if self.runtime.is_end_of_generation(token)
                || ends_with_stop_sequence(&generated, &self.legacy_stop_tokens)
            {
                if text.pending_len() > 0 {
                    tracing::debug!("Dropping {} incomplete UTF-8 bytes", text.pending_len());
                }
                self.emit(EventKind::Response, TURN_TERMINATOR);
                return Ok(LoopState::Completed);
            }

            let bytes = match self.runtime.token_piece(token) {
                Ok(bytes) => bytes,
                Err(failure) => {
                    return Err(self.report(OP, ChatError::Decode(failure.to_string())));
                }
            };
            let piece = text.push(&bytes);
            if self.emit(EventKind::Response, &piece) {
                tracing::debug!("Sink requested stop after {} tokens", step + 1);
                return Ok(LoopState::Stopped);
            }

            if self.control.is_interrupted() {
                tracing::debug!("Generation stopped by user");
                self.emit(EventKind::Response, TURN_TERMINATOR);
                return Ok(LoopState::Stopped);
            }

            let limit = self.runtime.context_length();
            if self.position >= limit {
                let err = ChatError::ContextFull {
                    needed: self.position + 1,
                    limit,
                };
                return Err(self.report(OP, err));
            }

            if let Err(failure) = self.runtime.decode_token(token, self.position) {
                return Err(self.report(OP, ChatError::Decode(failure.to_string())));
            }
            self.position += 1;
            step += 1;
        }
    }
}
