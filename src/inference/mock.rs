//! Scripted in-memory runtime for tests

use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::inference::runtime::{
    ModalitySupport, ModelRuntime, RuntimeFailure, Token, TokenChunks,
};
use crate::inference::session::SessionControl;
use crate::inference::streaming::{EventKind, EventSink};
use crate::types::ChatMessage;

const MARKER: &str = "<__media__>";
const BYTE_TOKEN_BASE: Token = 1000;
const TOKENS_PER_MEDIA: usize = 16;

/// Chunk sizes produced by [`MockRuntime::tokenize_multimodal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockChunks {
    pub n_chunks: usize,
    pub n_tokens: usize,
    pub n_positions: usize,
}

impl TokenChunks for MockChunks {
    fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    fn n_positions(&self) -> usize {
        self.n_positions
    }
}

/// Runtime with one token per prompt byte and a scripted sampler.
///
/// Byte tokens render back to their byte; any other token renders as `t{id}`.
#[derive(Debug)]
pub struct MockRuntime {
    pub has_template: bool,
    pub fail_tokenize: Option<i32>,
    pub fail_eval: Option<i32>,
    /// Zero-based index of the decode call that fails
    pub fail_decode_at: Option<usize>,
    pub context_length: usize,
    pub modality: ModalitySupport,
    /// Context positions taken by one media item
    pub positions_per_media: usize,
    /// Requests a stop while the turn is being rendered
    pub stop_on_render: Option<SessionControl>,
    /// Every decode waits for a message, or for the sender to go away
    pub decode_gate: Option<Receiver<()>>,

    pub bos_requests: Vec<bool>,
    pub media_per_tokenize: Vec<usize>,
    pub last_prompt: String,
    pub eval_calls: usize,
    pub removed_from: Vec<usize>,
    pub decoded: Vec<(Token, usize)>,
    pub accepted: Vec<Token>,

    template: Option<String>,
    script: VecDeque<Token>,
    decode_calls: usize,
}

impl MockRuntime {
    pub const EOG: Token = 2;
    /// First byte of "é"
    pub const SPLIT_E_ACUTE_HEAD: Token = BYTE_TOKEN_BASE + 0xC3;
    /// Second byte of "é"
    pub const SPLIT_E_ACUTE_TAIL: Token = BYTE_TOKEN_BASE + 0xA9;

    pub fn new() -> Self {
        Self::with_script(&[])
    }

    /// Runtime whose sampler returns `script` in order, then end-of-generation.
    pub fn with_script(script: &[Token]) -> Self {
        Self {
            has_template: true,
            fail_tokenize: None,
            fail_eval: None,
            fail_decode_at: None,
            context_length: 4096,
            modality: ModalitySupport {
                vision: true,
                audio: false,
            },
            positions_per_media: TOKENS_PER_MEDIA,
            stop_on_render: None,
            decode_gate: None,
            bos_requests: Vec::new(),
            media_per_tokenize: Vec::new(),
            last_prompt: String::new(),
            eval_calls: 0,
            removed_from: Vec::new(),
            decoded: Vec::new(),
            accepted: Vec::new(),
            template: None,
            script: script.iter().copied().collect(),
            decode_calls: 0,
        }
    }

    /// Token for a single prompt byte
    pub fn char_token(byte: u8) -> Token {
        BYTE_TOKEN_BASE + Token::from(byte)
    }
}

impl ModelRuntime for MockRuntime {
    type Media = String;
    type Chunks = MockChunks;

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn batch_size(&self) -> usize {
        512
    }

    fn modality(&self) -> ModalitySupport {
        self.modality
    }

    fn media_marker(&self) -> &str {
        MARKER
    }

    fn use_chat_template(&mut self, name: Option<&str>) -> Result<(), RuntimeFailure> {
        match name {
            Some(name) => self.template = Some(name.to_string()),
            None if self.has_template => self.template = Some("embedded".to_string()),
            None => return Err(RuntimeFailure::message("model has no embedded chat template")),
        }
        Ok(())
    }

    fn render_template(&self, message: &ChatMessage) -> Result<String, RuntimeFailure> {
        if self.template.is_none() {
            return Err(RuntimeFailure::message("no chat template selected"));
        }
        if let Some(control) = &self.stop_on_render {
            control.stop_generating();
        }
        Ok(format!("<|{}|>{}<|assistant|>", message.role, message.content))
    }

    fn tokenize_text(&self, text: &str) -> Result<Vec<Token>, RuntimeFailure> {
        Ok(text.bytes().map(Self::char_token).collect())
    }

    fn load_media(&self, path: &Path) -> Result<Self::Media, RuntimeFailure> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with("missing") {
            return Err(RuntimeFailure::message(format!("failed to open {name}")));
        }
        Ok(path.display().to_string())
    }

    fn tokenize_multimodal(
        &mut self,
        prompt: &str,
        add_bos: bool,
        media: &[Self::Media],
    ) -> Result<Self::Chunks, RuntimeFailure> {
        self.bos_requests.push(add_bos);
        self.media_per_tokenize.push(media.len());
        self.last_prompt = prompt.to_string();

        if let Some(code) = self.fail_tokenize {
            return Err(RuntimeFailure::new(code, "tokenization failed"));
        }
        if prompt.matches(MARKER).count() != media.len() {
            return Err(RuntimeFailure::new(1, "number of media does not match markers"));
        }

        let text_bytes = prompt.replace(MARKER, "").len();
        Ok(MockChunks {
            n_chunks: 2 * media.len() + 1,
            n_tokens: text_bytes + TOKENS_PER_MEDIA * media.len(),
            n_positions: text_bytes + self.positions_per_media * media.len(),
        })
    }

    fn evaluate_chunks(
        &mut self,
        chunks: &Self::Chunks,
        position: usize,
        _batch_size: usize,
    ) -> Result<usize, RuntimeFailure> {
        self.eval_calls += 1;
        if let Some(code) = self.fail_eval {
            return Err(RuntimeFailure::new(code, "evaluation failed"));
        }
        Ok(position + chunks.n_positions)
    }

    fn sample(&mut self) -> Token {
        self.script.pop_front().unwrap_or(Self::EOG)
    }

    fn accept(&mut self, token: Token) {
        self.accepted.push(token);
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == Self::EOG
    }

    fn token_piece(&self, token: Token) -> Result<Vec<u8>, RuntimeFailure> {
        match u8::try_from(token - BYTE_TOKEN_BASE) {
            Ok(byte) => Ok(vec![byte]),
            _ => Ok(format!("t{token}").into_bytes()),
        }
    }

    fn decode_token(&mut self, token: Token, position: usize) -> Result<(), RuntimeFailure> {
        if let Some(gate) = &self.decode_gate {
            let _ = gate.recv();
        }
        let call = self.decode_calls;
        self.decode_calls += 1;
        if self.fail_decode_at == Some(call) {
            return Err(RuntimeFailure::message("decode failed"));
        }
        self.decoded.push((token, position));
        Ok(())
    }

    fn remove_context_from(&mut self, from: usize) -> Result<(), RuntimeFailure> {
        self.removed_from.push(from);
        Ok(())
    }
}

/// Events captured by a recording sink.
#[derive(Debug, Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<(EventKind, String)>>>);

impl Recorded {
    pub fn all(&self) -> Vec<(EventKind, String)> {
        self.0.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn push(&self, kind: EventKind, text: &str) {
        self.0.lock().unwrap().push((kind, text.to_string()));
    }
}

/// Sink recording every event and never asking to stop.
pub fn recording_sink() -> (Box<dyn EventSink>, Recorded) {
    recording_sink_with(|_, _| false)
}

/// Sink recording every event, then deferring the stop decision to `decide`.
pub fn recording_sink_with<F>(mut decide: F) -> (Box<dyn EventSink>, Recorded)
where
    F: FnMut(EventKind, &str) -> bool + Send + 'static,
{
    let recorded = Recorded::default();
    let log = recorded.clone();
    let sink = move |kind: EventKind, text: &str| {
        log.push(kind, text);
        decide(kind, text)
    };
    (Box::new(sink), recorded)
}
