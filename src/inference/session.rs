//! Chat session state
//!
//! A [`ChatSession`] is the running conversation of one loaded model: the
//! context position, media queued for the next turn, the text of the turn in
//! progress and the flags steering generation. Turn tokenization and prefill
//! live in `turn.rs`, the decode loop in `generate.rs`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::inference::error::ChatError;
use crate::inference::generate::LoopState;
use crate::inference::runtime::{ModalitySupport, ModelRuntime, Token};
use crate::inference::streaming::{EventKind, EventSink, SharedSink};
use crate::truncate_str;
use crate::types::ChatMessage;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.6;

/// Default context length in tokens
pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

/// Seed value asking the runtime to pick a random seed
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Token budget meaning "no limit"
pub const UNBOUNDED_TOKENS: usize = i32::MAX as usize;

/// Most media items that can be queued for a single turn
pub const MAX_PENDING_MEDIA: usize = 15;

/// Longest accepted prompt, in bytes
pub const MAX_PROMPT_LENGTH: usize = 20_000;

const PROMPT_LOG_PREVIEW: usize = 100;

/// Chat templates predating a dedicated end-of-turn token, with the text
/// that marks the end of an assistant turn.
const LEGACY_STOP_SEQUENCES: &[(&str, &str)] = &[("vicuna", "ASSISTANT:"), ("deepseek", "###")];

/// Returns the legacy stop text for a chat template name, if it has one.
pub fn legacy_stop_text(template: &str) -> Option<&'static str> {
    LEGACY_STOP_SEQUENCES
        .iter()
        .find(|(name, _)| *name == template)
        .map(|(_, text)| *text)
}

/// Configuration for loading a model and projector
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Path to the GGUF language model
    pub model_path: PathBuf,
    /// Path to the GGUF multimodal projector
    pub projector_path: PathBuf,
    /// Context length in tokens
    pub context_length: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Sampling seed, [`DEFAULT_SEED`] for a random one
    pub seed: u32,
    /// Chat template override, for models that do not embed one
    pub chat_template: Option<String>,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Logical batch size used for prompt evaluation
    pub batch_size: u32,
    /// Number of CPU threads, runtime default if unset
    pub threads: Option<i32>,
    /// Token budget per turn, unbounded if unset
    pub max_tokens: Option<u32>,
}

impl SessionConfig {
    pub fn new(model_path: impl Into<PathBuf>, projector_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            projector_path: projector_path.into(),
            context_length: DEFAULT_CONTEXT_LENGTH,
            temperature: DEFAULT_TEMPERATURE,
            seed: DEFAULT_SEED,
            chat_template: None,
            gpu_layers: 99,
            batch_size: 2048,
            threads: None,
            max_tokens: None,
        }
    }

    /// Checks that the configuration can be handed to the runtime
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(ChatError::Params("model path is empty".to_string()));
        }
        if self.projector_path.as_os_str().is_empty() {
            return Err(ChatError::Params("projector path is empty".to_string()));
        }
        if self.context_length == 0 || self.context_length > i32::MAX as u32 {
            return Err(ChatError::Params(format!(
                "context length {} is out of range",
                self.context_length
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ChatError::Params(format!(
                "temperature {} is invalid",
                self.temperature
            )));
        }
        if self.batch_size == 0 {
            return Err(ChatError::Params("batch size is zero".to_string()));
        }
        if matches!(self.chat_template.as_deref(), Some("")) {
            return Err(ChatError::Params("chat template name is empty".to_string()));
        }
        Ok(())
    }

    /// Per-turn token budget, with the unbounded sentinel applied
    pub fn token_budget(&self) -> usize {
        match self.max_tokens {
            Some(n) if n > 0 => (n as usize).min(UNBOUNDED_TOKENS),
            _ => UNBOUNDED_TOKENS,
        }
    }
}

/// Thread-safe handle on a session's generation flags.
///
/// `is_generating` is advisory: it is written only by the generation loop and
/// may lag behind the loop by one step when polled from another thread.
/// A turn is active from the moment it is claimed until its reply arrives,
/// covering tokenization and prefill as well as generation.
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    generating: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
    turn_active: Arc<AtomicBool>,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the running turn.
    ///
    /// Takes effect at the next checkpoint of the generation loop.
    pub fn stop_generating(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Returns true while the generation loop is running
    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Relaxed)
    }

    /// Returns true once cancellation was requested for the current turn
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Returns true while a claimed turn is running
    pub fn is_turn_active(&self) -> bool {
        self.turn_active.load(Ordering::SeqCst)
    }

    /// Claims the session for one turn. Fails if a turn is already running.
    pub(crate) fn try_begin_turn(&self) -> bool {
        self.turn_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_turn(&self) {
        self.turn_active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_generating(&self, generating: bool) {
        self.generating.store(generating, Ordering::Relaxed);
    }

    pub(crate) fn reset_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}

/// Reports an error through `sink` as a Status event and hands it back.
pub(crate) fn report(sink: &mut dyn EventSink, operation: &str, err: ChatError) -> ChatError {
    let message = err.status_message(operation);
    tracing::error!("{}", message);
    sink.on_event(EventKind::Status, &message);
    err
}

/// The conversation of one loaded model.
pub struct ChatSession<R: ModelRuntime> {
    pub(crate) runtime: R,
    pub(crate) sink: SharedSink,
    pub(crate) control: SessionControl,
    /// Next free slot in the running context
    pub(crate) position: usize,
    pub(crate) pending_media: Vec<R::Media>,
    pub(crate) turn_buffer: String,
    pub(crate) legacy_stop_tokens: Vec<Token>,
    pub(crate) is_first_turn: bool,
    pub(crate) max_tokens_per_turn: usize,
    pub(crate) modality: ModalitySupport,
    pub(crate) state: LoopState,
}

impl<R: ModelRuntime> ChatSession<R> {
    /// Builds a session around a freshly loaded runtime.
    ///
    /// Resolves the chat template (the configured one, else the model's own)
    /// and prepares the legacy stop sequence for templates that need one.
    /// Fails with [`ChatError::Template`] when no template is available.
    pub fn initialize(
        runtime: R,
        config: &SessionConfig,
        sink: Box<dyn EventSink>,
    ) -> Result<Self, ChatError> {
        Self::initialize_with_control(runtime, config, sink, SessionControl::new())
    }

    /// Like [`ChatSession::initialize`], sharing flags with an existing
    /// control handle so callers can hold it before the session exists.
    pub fn initialize_with_control(
        mut runtime: R,
        config: &SessionConfig,
        mut sink: Box<dyn EventSink>,
        control: SessionControl,
    ) -> Result<Self, ChatError> {
        const OP: &str = "initialize";

        let template = config.chat_template.as_deref();
        if let Err(failure) = runtime.use_chat_template(template) {
            let err = ChatError::Template(format!(
                "{}. Models without an embedded template need one configured \
                 (e.g. 'vicuna' for old llava models, 'deepseek' for MobileVLM)",
                failure.message
            ));
            return Err(report(sink.as_mut(), OP, err));
        }

        let legacy_stop_tokens = match template.and_then(legacy_stop_text) {
            Some(text) => match runtime.tokenize_text(text) {
                Ok(tokens) => tokens,
                Err(failure) => {
                    let err = ChatError::Template(format!(
                        "unable to tokenize stop sequence '{text}': {failure}"
                    ));
                    return Err(report(sink.as_mut(), OP, err));
                }
            },
            None => Vec::new(),
        };

        let modality = runtime.modality();
        tracing::info!(
            "Session initialized: ctx={} vision={} audio={} legacy_stop_tokens={}",
            runtime.context_length(),
            modality.vision,
            modality.audio,
            legacy_stop_tokens.len()
        );

        Ok(Self {
            runtime,
            sink: SharedSink::new(sink),
            control,
            position: 0,
            pending_media: Vec::new(),
            turn_buffer: String::new(),
            legacy_stop_tokens,
            is_first_turn: true,
            max_tokens_per_turn: config.token_budget(),
            modality,
            state: LoopState::Completed,
        })
    }

    /// Typed access to the underlying runtime
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Handle for stopping or polling generation from other threads
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Handle on the sink this session reports to
    pub fn sink(&self) -> SharedSink {
        self.sink.clone()
    }

    /// Requests cancellation of the running turn
    pub fn stop_generating(&self) {
        self.control.stop_generating();
    }

    pub fn is_generating(&self) -> bool {
        self.control.is_generating()
    }

    pub fn is_interrupted(&self) -> bool {
        self.control.is_interrupted()
    }

    /// Next free position in the running context
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of media items queued for the next turn
    pub fn pending_media_len(&self) -> usize {
        self.pending_media.len()
    }

    /// Text accumulated for the turn in progress
    pub fn turn_buffer(&self) -> &str {
        &self.turn_buffer
    }

    pub fn legacy_stop_tokens(&self) -> &[Token] {
        &self.legacy_stop_tokens
    }

    pub fn is_first_turn(&self) -> bool {
        self.is_first_turn
    }

    pub fn max_tokens_per_turn(&self) -> usize {
        self.max_tokens_per_turn
    }

    pub fn modality(&self) -> ModalitySupport {
        self.modality
    }

    /// State the generation loop ended in last
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Decodes a media file and queues it for the next turn.
    ///
    /// The runtime's media marker is appended to the turn text so the
    /// tokenizer knows where the media goes.
    pub fn load_media<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ChatError> {
        const OP: &str = "load_media";
        let path = path.as_ref();

        if path.as_os_str().is_empty() {
            return Err(self.report(OP, ChatError::Params("media path is empty".to_string())));
        }

        if self.pending_media.len() >= MAX_PENDING_MEDIA {
            let err = ChatError::MediaLoad {
                path: path.to_path_buf(),
                reason: format!("at most {MAX_PENDING_MEDIA} media items per turn"),
            };
            return Err(self.report(OP, err));
        }

        match self.runtime.load_media(path) {
            Ok(media) => {
                self.pending_media.push(media);
                let marker = self.runtime.media_marker().to_string();
                self.turn_buffer.push_str(&marker);
                tracing::debug!(
                    "Queued media {} ({} pending)",
                    path.display(),
                    self.pending_media.len()
                );
                Ok(())
            }
            Err(failure) => {
                let err = ChatError::MediaLoad {
                    path: path.to_path_buf(),
                    reason: failure.message,
                };
                Err(self.report(OP, err))
            }
        }
    }

    /// Runs one full user turn: tokenize, prefill, then stream the response.
    ///
    /// The turn text and first-turn flag are only reset when the turn completes
    /// without error. A turn interrupted before tokenization skips prefill.
    /// Concurrent turns are rejected by [`crate::inference::ChatEngine`];
    /// the session itself is exclusive through `&mut self`.
    pub fn respond(&mut self, prompt: &str) -> Result<LoopState, ChatError> {
        const OP: &str = "respond";

        if prompt.is_empty() {
            return Err(self.report(OP, ChatError::Params("prompt is empty".to_string())));
        }
        if prompt.len() > MAX_PROMPT_LENGTH {
            let err = ChatError::Params(format!(
                "prompt is {} bytes, limit is {MAX_PROMPT_LENGTH}",
                prompt.len()
            ));
            return Err(self.report(OP, err));
        }
        tracing::debug!("New turn: {}", truncate_str(prompt, PROMPT_LOG_PREVIEW));

        self.turn_buffer.push_str(prompt);
        self.control.reset_interrupt();

        let message = ChatMessage::user(self.turn_buffer.clone());
        let chunks = self.tokenize_turn(&message, self.is_first_turn)?;
        if !chunks.is_empty() {
            self.evaluate(&chunks)?;
        }
        let state = self.generate(self.max_tokens_per_turn)?;

        self.turn_buffer.clear();
        self.is_first_turn = false;
        Ok(state)
    }

    /// Starts a new conversation without reloading the model.
    ///
    /// Drops queued media and the pending turn text, rewinds the position and
    /// removes everything after the beginning-of-sequence token from the
    /// context. The first-turn flag is left as is.
    pub fn clear_history(&mut self) -> Result<(), ChatError> {
        self.position = 0;
        if let Err(failure) = self.runtime.remove_context_from(1) {
            tracing::warn!("Context range removal reported failure: {}", failure);
        }
        self.pending_media.clear();
        self.turn_buffer.clear();
        tracing::debug!("Successfully cleared history");
        Ok(())
    }

    pub(crate) fn emit(&mut self, kind: EventKind, text: &str) -> bool {
        self.sink.on_event(kind, text)
    }

    pub(crate) fn report(&mut self, operation: &str, err: ChatError) -> ChatError {
        report(&mut self.sink, operation, err)
    }
}

impl<R: ModelRuntime> Drop for ChatSession<R> {
    fn drop(&mut self) {
        tracing::info!("Chat session released at position {}", self.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{recording_sink, MockRuntime, Recorded};
    use crate::inference::streaming::EventKind;

    fn session_with(runtime: MockRuntime, config: &SessionConfig) -> (ChatSession<MockRuntime>, Recorded) {
        let (sink, events) = recording_sink();
        let session = ChatSession::initialize(runtime, config, sink).unwrap();
        (session, events)
    }

    fn config() -> SessionConfig {
        SessionConfig::new("model.gguf", "mmproj-model.gguf")
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.context_length, 2048);
        assert!((config.temperature - 0.6).abs() < 0.001);
        assert_eq!(config.seed, 0xFFFF_FFFF);
        assert_eq!(config.token_budget(), UNBOUNDED_TOKENS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();
        config.model_path = PathBuf::new();
        assert!(matches!(config.validate(), Err(ChatError::Params(_))));

        let mut config = self::config();
        config.projector_path = PathBuf::new();
        assert!(matches!(config.validate(), Err(ChatError::Params(_))));

        let mut config = self::config();
        config.context_length = 0;
        assert!(matches!(config.validate(), Err(ChatError::Params(_))));

        let mut config = self::config();
        config.temperature = f32::NAN;
        assert!(matches!(config.validate(), Err(ChatError::Params(_))));
    }

    #[test]
    fn test_token_budget() {
        let mut config = config();
        config.max_tokens = Some(64);
        assert_eq!(config.token_budget(), 64);
        config.max_tokens = Some(0);
        assert_eq!(config.token_budget(), UNBOUNDED_TOKENS);
    }

    #[test]
    fn test_legacy_stop_text() {
        assert_eq!(legacy_stop_text("vicuna"), Some("ASSISTANT:"));
        assert_eq!(legacy_stop_text("deepseek"), Some("###"));
        assert_eq!(legacy_stop_text("chatml"), None);
    }

    #[test]
    fn test_initialize_modern_template() {
        let (session, events) = session_with(MockRuntime::new(), &config());
        assert!(session.legacy_stop_tokens().is_empty());
        assert!(session.is_first_turn());
        assert_eq!(session.position(), 0);
        assert_eq!(session.modality(), ModalitySupport { vision: true, audio: false });
        assert!(events.all().is_empty());
    }

    #[test]
    fn test_initialize_legacy_template() {
        let mut config = config();
        config.chat_template = Some("vicuna".to_string());
        let (session, _) = session_with(MockRuntime::new(), &config);
        let expected = MockRuntime::new().tokenize_text("ASSISTANT:").unwrap();
        assert_eq!(session.legacy_stop_tokens(), expected.as_slice());
        assert!(!session.legacy_stop_tokens().is_empty());
    }

    #[test]
    fn test_initialize_without_template_fails() {
        let mut runtime = MockRuntime::new();
        runtime.has_template = false;
        let (sink, events) = recording_sink();

        let result = ChatSession::initialize(runtime, &config(), sink);
        assert!(matches!(result, Err(ChatError::Template(_))));

        let statuses = events.of_kind(EventKind::Status);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].starts_with("initialize | ERROR:"));
    }

    #[test]
    fn test_load_media_appends_marker() {
        let (mut session, _) = session_with(MockRuntime::new(), &config());
        session.load_media("cat.png").unwrap();
        session.load_media("dog.png").unwrap();

        assert_eq!(session.pending_media_len(), 2);
        assert_eq!(session.turn_buffer(), "<__media__><__media__>");
    }

    #[test]
    fn test_load_media_failure_reported() {
        let (mut session, events) = session_with(MockRuntime::new(), &config());
        let result = session.load_media("missing.png");

        assert!(matches!(result, Err(ChatError::MediaLoad { .. })));
        assert_eq!(session.pending_media_len(), 0);
        assert_eq!(session.turn_buffer(), "");
        assert_eq!(events.of_kind(EventKind::Status).len(), 1);
    }

    #[test]
    fn test_load_media_limit() {
        let (mut session, _) = session_with(MockRuntime::new(), &config());
        for i in 0..MAX_PENDING_MEDIA {
            session.load_media(format!("img{i}.png")).unwrap();
        }
        let result = session.load_media("one_more.png");
        assert!(matches!(result, Err(ChatError::MediaLoad { .. })));
        assert_eq!(session.pending_media_len(), MAX_PENDING_MEDIA);
    }

    #[test]
    fn test_load_media_empty_path() {
        let (mut session, _) = session_with(MockRuntime::new(), &config());
        assert!(matches!(session.load_media(""), Err(ChatError::Params(_))));
    }

    #[test]
    fn test_clear_history_resets_state() {
        let (mut session, _) = session_with(MockRuntime::with_script(&[7, 8]), &config());
        session.respond("hello").unwrap();
        session.load_media("cat.png").unwrap();
        assert!(session.position() > 0);

        session.clear_history().unwrap();

        assert_eq!(session.position(), 0);
        assert_eq!(session.pending_media_len(), 0);
        assert_eq!(session.turn_buffer(), "");
        assert_eq!(session.runtime().removed_from, vec![1]);
        assert!(!session.is_first_turn());
    }

    #[test]
    fn test_clear_history_on_fresh_session() {
        let (mut session, _) = session_with(MockRuntime::new(), &config());
        session.clear_history().unwrap();
        assert_eq!(session.position(), 0);
    }

    #[test]
    fn test_respond_full_turn() {
        let runtime = MockRuntime::with_script(&[10, 11, MockRuntime::EOG]);
        let (mut session, events) = session_with(runtime, &config());

        let state = session.respond("hello").unwrap();

        assert_eq!(state, LoopState::Completed);
        assert_eq!(session.turn_buffer(), "");
        assert!(!session.is_first_turn());
        assert!(!session.is_generating());
        assert_eq!(session.runtime().bos_requests, vec![true]);
        // prefill terminator, two pieces, end-of-turn terminator
        assert_eq!(
            events.of_kind(EventKind::Response),
            vec!["\n", "t10", "t11", "\n"]
        );
    }

    #[test]
    fn test_second_turn_skips_bos() {
        let runtime = MockRuntime::with_script(&[10, MockRuntime::EOG, 12, MockRuntime::EOG]);
        let (mut session, _) = session_with(runtime, &config());

        session.respond("hello").unwrap();
        session.respond("again").unwrap();

        assert_eq!(session.runtime().bos_requests, vec![true, false]);
    }

    #[test]
    fn test_respond_rejects_bad_prompts() {
        let (mut session, events) = session_with(MockRuntime::new(), &config());
        assert!(matches!(session.respond(""), Err(ChatError::Params(_))));

        let long = "a".repeat(MAX_PROMPT_LENGTH + 1);
        assert!(matches!(session.respond(&long), Err(ChatError::Params(_))));
        assert_eq!(events.of_kind(EventKind::Status).len(), 2);
    }

    #[test]
    fn test_respond_keeps_turn_text_on_failure() {
        let mut runtime = MockRuntime::new();
        runtime.fail_tokenize = Some(1);
        let (mut session, _) = session_with(runtime, &config());

        let result = session.respond("hello");

        assert_eq!(result, Err(ChatError::Tokenize(1)));
        assert_eq!(session.turn_buffer(), "hello");
        assert!(session.is_first_turn());
        assert!(!session.is_generating());
    }

    #[test]
    fn test_media_consumed_by_turn() {
        let runtime = MockRuntime::with_script(&[MockRuntime::EOG]);
        let (mut session, _) = session_with(runtime, &config());
        session.load_media("cat.png").unwrap();

        session.respond("describe this").unwrap();

        assert_eq!(session.pending_media_len(), 0);
        assert_eq!(session.runtime().media_per_tokenize, vec![1]);
        assert!(session.runtime().last_prompt.contains("<__media__>describe this"));
    }

    #[test]
    fn test_turn_interrupted_before_tokenize_skips_prefill() {
        let control = SessionControl::new();
        let mut runtime = MockRuntime::with_script(&[10, MockRuntime::EOG]);
        runtime.stop_on_render = Some(control.clone());
        let (sink, events) = recording_sink();
        let mut session =
            ChatSession::initialize_with_control(runtime, &config(), sink, control).unwrap();
        session.load_media("cat.png").unwrap();

        let state = session.respond("hello").unwrap();

        assert_eq!(state, LoopState::Stopped);
        // tokenizer terminator, then the loop's
        assert_eq!(events.of_kind(EventKind::Response), vec!["\n", "\n"]);
        assert_eq!(session.runtime().eval_calls, 0);
        assert_eq!(session.pending_media_len(), 0);
        assert_eq!(session.position(), 0);
    }

    #[test]
    fn test_turn_claim_is_exclusive() {
        let control = SessionControl::new();
        assert!(!control.is_turn_active());
        assert!(control.try_begin_turn());
        assert!(control.is_turn_active());
        assert!(!control.clone().try_begin_turn());
        control.end_turn();
        assert!(control.try_begin_turn());
    }

    #[test]
    fn test_control_handle_shared() {
        let (session, _) = session_with(MockRuntime::new(), &config());
        let control = session.control();
        control.stop_generating();
        assert!(session.is_interrupted());
    }
}
