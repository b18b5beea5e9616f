//! LLM inference
//!
//! A [`ChatSession`] drives any [`ModelRuntime`] through multimodal turns.
//! [`ChatEngine`] runs a llama.cpp backed session on a worker thread.

pub mod engine;
pub mod error;
pub mod generate;
pub mod llama;
pub mod model;
pub mod runtime;
pub mod session;
pub mod streaming;
mod turn;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types for convenience
pub use engine::ChatEngine;
pub use error::ChatError;
pub use generate::LoopState;
pub use model::{inspect_gguf, is_gguf_file, is_projector_file, GgufError, GgufHeader, GGUF_MAGIC};
pub use runtime::{MediaKind, ModalitySupport, ModelRuntime, RuntimeFailure, Token};
pub use session::{ChatSession, SessionConfig, SessionControl};
pub use streaming::{ChannelSink, ConsoleSink, Event, EventKind, EventSink, SharedSink, TURN_TERMINATOR};
