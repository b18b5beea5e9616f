//! Model runtime abstraction
//!
//! The chat session only talks to the model through [`ModelRuntime`]: template
//! rendering, multimodal tokenization, chunk evaluation, sampling, single-token
//! decode and context trimming. [`crate::inference::llama::LlamaRuntime`] is the
//! llama.cpp implementation.

use std::fmt;
use std::path::Path;

use crate::types::ChatMessage;

/// Token id as used by the runtime vocabulary.
pub type Token = i32;

/// Runtime error code for failures that carry no code of their own.
pub const UNKNOWN_ERROR_CODE: i32 = -1;

/// Failure reported by a runtime primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    /// Numeric result from the runtime, [`UNKNOWN_ERROR_CODE`] if none
    pub code: i32,
    pub message: String,
}

impl RuntimeFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Failure without a runtime result code
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(UNKNOWN_ERROR_CODE, message)
    }
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Which media the loaded projector can encode.
///
/// Advisory only: loading media of an unsupported kind fails in the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModalitySupport {
    pub vision: bool,
    pub audio: bool,
}

impl ModalitySupport {
    /// Returns true if `kind` is supported by the projector
    pub fn supports(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Image => self.vision,
            MediaKind::Audio => self.audio,
        }
    }

    /// Human readable list of accepted file extensions
    pub fn supported_media_types(&self) -> String {
        let mut types = Vec::new();
        if self.vision {
            types.push(format!("Images: {}", IMAGE_EXTENSIONS.join(", ")));
        }
        if self.audio {
            types.push(format!("Audio: {}", AUDIO_EXTENSIONS.join(", ")));
        }
        if types.is_empty() {
            return "None (text only)".to_string();
        }
        types.join("\n")
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tga"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac"];

/// Media classification by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    /// Classifies a file by its extension, case-insensitively.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_string_lossy().to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }
}

/// Sizes of a tokenized multimodal input.
pub trait TokenChunks {
    /// Number of chunks (text runs and media embeddings)
    fn n_chunks(&self) -> usize;
    /// Number of tokens across all chunks
    fn n_tokens(&self) -> usize;
    /// Context positions the chunks occupy once evaluated. Differs from
    /// the token count for projectors with multi-dimensional positions.
    fn n_positions(&self) -> usize;
}

/// Tokenized turn ready for evaluation.
///
/// Empty when tokenization was short-circuited by an interruption.
#[derive(Debug)]
pub struct ChunkSequence<C> {
    chunks: Option<C>,
}

impl<C: TokenChunks> ChunkSequence<C> {
    pub fn new(chunks: C) -> Self {
        Self {
            chunks: Some(chunks),
        }
    }

    pub fn empty() -> Self {
        Self { chunks: None }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.as_ref().map_or(0, TokenChunks::n_chunks)
    }

    /// Number of tokens
    pub fn n_tokens(&self) -> usize {
        self.chunks.as_ref().map_or(0, TokenChunks::n_tokens)
    }

    /// Number of context positions
    pub fn n_positions(&self) -> usize {
        self.chunks.as_ref().map_or(0, TokenChunks::n_positions)
    }

    pub fn chunks(&self) -> Option<&C> {
        self.chunks.as_ref()
    }
}

/// Primitives the chat session drives.
///
/// Implementations own the model, context, sampler and batch resources and
/// release them on drop.
pub trait ModelRuntime {
    /// A decoded media buffer awaiting tokenization
    type Media;
    /// Tokenized multimodal input
    type Chunks: TokenChunks;

    /// Context length in positions
    fn context_length(&self) -> usize;

    /// Batch width used when evaluating chunks
    fn batch_size(&self) -> usize;

    /// Media kinds the projector can encode
    fn modality(&self) -> ModalitySupport;

    /// Marker inserted into the prompt text where a media item belongs
    fn media_marker(&self) -> &str;

    /// Selects the chat template: `name` if given, else the one embedded in the model.
    fn use_chat_template(&mut self, name: Option<&str>) -> Result<(), RuntimeFailure>;

    /// Renders one message through the chat template with the assistant
    /// prompt appended. No template expression engine is involved.
    fn render_template(&self, message: &ChatMessage) -> Result<String, RuntimeFailure>;

    /// Tokenizes plain text without adding special tokens.
    fn tokenize_text(&self, text: &str) -> Result<Vec<Token>, RuntimeFailure>;

    /// Decodes a media file into memory.
    fn load_media(&self, path: &Path) -> Result<Self::Media, RuntimeFailure>;

    /// Tokenizes a prompt interleaved with media, one media item per marker.
    fn tokenize_multimodal(
        &mut self,
        prompt: &str,
        add_bos: bool,
        media: &[Self::Media],
    ) -> Result<Self::Chunks, RuntimeFailure>;

    /// Evaluates chunks starting at `position` in batches of `batch_size`,
    /// requesting logits for the last token only. Returns the next free position.
    fn evaluate_chunks(
        &mut self,
        chunks: &Self::Chunks,
        position: usize,
        batch_size: usize,
    ) -> Result<usize, RuntimeFailure>;

    /// Samples the next token from the last logits.
    fn sample(&mut self) -> Token;

    /// Records `token` as accepted so the sampler state follows the output.
    fn accept(&mut self, token: Token);

    /// Returns true for end-of-generation tokens.
    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Raw bytes of the token's text piece.
    fn token_piece(&self, token: Token) -> Result<Vec<u8>, RuntimeFailure>;

    /// Decodes a single token at `position` with logits enabled.
    fn decode_token(&mut self, token: Token, position: usize) -> Result<(), RuntimeFailure>;

    /// Removes positions `from..` of the default sequence from the context.
    fn remove_context_from(&mut self, from: usize) -> Result<(), RuntimeFailure>;
}
