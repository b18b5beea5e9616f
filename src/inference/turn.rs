//! Turn tokenization and prefill
//!
//! A turn is rendered through the chat template as a single message, packed
//! together with the queued media into multimodal chunks, then evaluated into
//! the running context.

use crate::inference::error::ChatError;
use crate::inference::runtime::{ChunkSequence, ModelRuntime};
use crate::inference::session::ChatSession;
use crate::inference::streaming::{EventKind, TURN_TERMINATOR};
use crate::types::ChatMessage;

impl<R: ModelRuntime> ChatSession<R> {
    /// Renders `message` and tokenizes it with all queued media.
    ///
    /// `add_bos` injects the beginning-of-sequence marker and should only be
    /// set for the first turn of the session. If the turn was already
    /// interrupted, the queued media is dropped, a terminator is emitted and
    /// an empty sequence is returned. Queued media is cleared on success.
    pub fn tokenize_turn(
        &mut self,
        message: &ChatMessage,
        add_bos: bool,
    ) -> Result<ChunkSequence<R::Chunks>, ChatError> {
        const OP: &str = "tokenize_turn";

        let prompt = match self.runtime.render_template(message) {
            Ok(prompt) => prompt,
            Err(failure) => {
                tracing::warn!("Chat template not applied: {}", failure);
                return Err(self.report(OP, ChatError::Tokenize(failure.code)));
            }
        };
        tracing::debug!("Formatted chat prompt: {} bytes", prompt.len());

        if self.control.is_interrupted() {
            self.pending_media.clear();
            self.emit(EventKind::Response, TURN_TERMINATOR);
            return Ok(ChunkSequence::empty());
        }

        let chunks = match self
            .runtime
            .tokenize_multimodal(&prompt, add_bos, &self.pending_media)
        {
            Ok(chunks) => ChunkSequence::new(chunks),
            Err(failure) => {
                tracing::warn!("Multimodal tokenization failed: {}", failure);
                return Err(self.report(OP, ChatError::Tokenize(failure.code)));
            }
        };

        tracing::debug!(
            "Tokenized turn into {} chunks ({} tokens, {} media)",
            chunks.len(),
            chunks.n_tokens(),
            self.pending_media.len()
        );
        self.pending_media.clear();

        Ok(chunks)
    }

    /// Feeds a tokenized turn through the model (prefill).
    ///
    /// Advances the position by the positions the chunks occupy and emits a
    /// terminator once the model is ready to stream. On failure the position
    /// stays where it was and the context should be cleared before reuse.
    pub fn evaluate(&mut self, chunks: &ChunkSequence<R::Chunks>) -> Result<(), ChatError> {
        const OP: &str = "evaluate";

        if let Some(inner) = chunks.chunks() {
            let needed = self.position + chunks.n_positions();
            let limit = self.runtime.context_length();
            if needed > limit {
                return Err(self.report(OP, ChatError::ContextFull { needed, limit }));
            }

            let batch_size = self.runtime.batch_size();
            match self.runtime.evaluate_chunks(inner, self.position, batch_size) {
                Ok(next) => {
                    tracing::debug!("Prefill advanced position {} -> {}", self.position, next);
                    self.position = next;
                }
                Err(failure) => {
                    return Err(self.report(OP, ChatError::Eval(failure.code)));
                }
            }
        }

        self.emit(EventKind::Response, TURN_TERMINATOR);
        Ok(())
    }
}
