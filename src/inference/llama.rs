//! llama.cpp runtime
//!
//! [`ModelBundle`] owns the backend and the loaded language model.
//! [`LlamaRuntime`] borrows the model and owns everything created from it: the
//! context, the projector, the sampler chain and the decode batch.
//!
//! llama-cpp-2 types hold raw pointers and are not `Send`, so both live on the
//! engine's worker thread for their whole lifetime.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdEvalError,
    MtmdInputChunks, MtmdInputText, MtmdTokenizeError,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::error::ChatError;
use crate::inference::model::{inspect_gguf, is_projector_file};
use crate::inference::runtime::{
    ModalitySupport, ModelRuntime, RuntimeFailure, Token, TokenChunks, UNKNOWN_ERROR_CODE,
};
use crate::inference::session::SessionConfig;
use crate::types::ChatMessage;

/// Temperatures below this use greedy sampling
const GREEDY_THRESHOLD: f32 = 0.01;
const TOP_K: i32 = 40;
const TOP_P: f32 = 0.95;

/// Sequence holding the conversation
const SEQ_ID: i32 = 0;

/// Backend and language model, loaded once per session.
pub struct ModelBundle {
    // declared before the backend so the model is freed first
    model: LlamaModel,
    backend: LlamaBackend,
}

impl ModelBundle {
    /// Checks both GGUF files and loads the language model.
    pub fn load(config: &SessionConfig) -> Result<Self, ChatError> {
        check_gguf(&config.model_path, "model")?;
        check_gguf(&config.projector_path, "projector")?;
        if is_projector_file(&config.model_path) {
            tracing::warn!(
                "Model file {} looks like a projector",
                config.model_path.display()
            );
        }

        let backend =
            LlamaBackend::init().map_err(|e| ChatError::ModelLoad(format!("backend: {e}")))?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &model_params)
            .map_err(|e| ChatError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} ctx trained)",
            config.model_path.display(),
            model.n_params(),
            model.n_ctx_train()
        );

        Ok(Self { model, backend })
    }

    /// Creates the context, projector and sampler for a session.
    pub fn runtime(&self, config: &SessionConfig) -> Result<LlamaRuntime<'_>, ChatError> {
        let n_ctx = NonZeroU32::new(config.context_length)
            .ok_or_else(|| ChatError::Params("context length is zero".to_string()))?;
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.batch_size);
        if let Some(threads) = config.threads {
            ctx_params = ctx_params
                .with_n_threads(threads)
                .with_n_threads_batch(threads);
        }

        let context = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| ChatError::ModelLoad(format!("context: {e}")))?;

        let projector_path = config
            .projector_path
            .to_str()
            .ok_or_else(|| ChatError::Params("projector path is not valid UTF-8".to_string()))?;
        let mut mtmd_params = MtmdContextParams {
            use_gpu: config.gpu_layers > 0,
            ..MtmdContextParams::default()
        };
        if let Some(threads) = config.threads {
            mtmd_params.n_threads = threads;
        }
        let projector = MtmdContext::init_from_file(projector_path, &self.model, &mtmd_params)
            .map_err(|e| ChatError::ModelLoad(format!("projector: {e}")))?;

        let sampler = if config.temperature < GREEDY_THRESHOLD {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(TOP_K),
                LlamaSampler::top_p(TOP_P, 1),
                LlamaSampler::temp(config.temperature),
                LlamaSampler::dist(config.seed),
            ])
        };

        let modality = ModalitySupport {
            vision: projector.support_vision(),
            audio: projector.support_audio(),
        };
        tracing::info!(
            "Projector loaded: {} (vision={}, audio={})",
            config.projector_path.display(),
            modality.vision,
            modality.audio
        );

        Ok(LlamaRuntime {
            batch: LlamaBatch::new(1, 1),
            sampler,
            projector,
            context,
            model: &self.model,
            template: None,
            marker: mtmd_default_marker().to_string(),
            modality,
        })
    }
}

fn check_gguf(path: &Path, what: &str) -> Result<(), ChatError> {
    let header = inspect_gguf(path)
        .map_err(|e| ChatError::ModelLoad(format!("{what} {}: {e}", path.display())))?;
    tracing::debug!(
        "GGUF {} v{}: {} tensors, {} metadata entries",
        path.display(),
        header.version,
        header.tensor_count,
        header.metadata_kv_count
    );
    Ok(())
}

/// Session resources created from a loaded model.
pub struct LlamaRuntime<'m> {
    batch: LlamaBatch,
    sampler: LlamaSampler,
    projector: MtmdContext,
    context: LlamaContext<'m>,
    model: &'m LlamaModel,
    template: Option<LlamaChatTemplate>,
    marker: String,
    modality: ModalitySupport,
}

impl TokenChunks for MtmdInputChunks {
    fn n_chunks(&self) -> usize {
        self.len()
    }

    fn n_tokens(&self) -> usize {
        self.total_tokens()
    }

    fn n_positions(&self) -> usize {
        usize::try_from(self.total_positions()).unwrap_or(0)
    }
}

fn tokenize_code(err: &MtmdTokenizeError) -> i32 {
    match err {
        MtmdTokenizeError::BitmapCountMismatch => 1,
        MtmdTokenizeError::ImagePreprocessingError => 2,
        MtmdTokenizeError::UnknownError(code) => *code,
        _ => UNKNOWN_ERROR_CODE,
    }
}

fn eval_code(err: &MtmdEvalError) -> i32 {
    match err {
        MtmdEvalError::EvalFailure(code) => *code,
        #[allow(unreachable_patterns)]
        _ => UNKNOWN_ERROR_CODE,
    }
}

fn to_pos(position: usize) -> Result<i32, RuntimeFailure> {
    i32::try_from(position)
        .map_err(|_| RuntimeFailure::message(format!("position {position} out of range")))
}

impl ModelRuntime for LlamaRuntime<'_> {
    type Media = MtmdBitmap;
    type Chunks = MtmdInputChunks;

    fn context_length(&self) -> usize {
        self.context.n_ctx() as usize
    }

    fn batch_size(&self) -> usize {
        self.context.n_batch() as usize
    }

    fn modality(&self) -> ModalitySupport {
        self.modality
    }

    fn media_marker(&self) -> &str {
        &self.marker
    }

    fn use_chat_template(&mut self, name: Option<&str>) -> Result<(), RuntimeFailure> {
        let template = match name {
            Some(name) => LlamaChatTemplate::new(name)
                .map_err(|e| RuntimeFailure::message(format!("template name '{name}': {e}")))?,
            None => self.model.chat_template(None).map_err(|e| {
                RuntimeFailure::message(format!("model has no usable chat template: {e}"))
            })?,
        };
        self.template = Some(template);
        Ok(())
    }

    fn render_template(&self, message: &ChatMessage) -> Result<String, RuntimeFailure> {
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| RuntimeFailure::message("no chat template selected"))?;
        let message = LlamaChatMessage::new(message.role.as_str().to_string(), message.content.clone())
            .map_err(|e| RuntimeFailure::message(format!("chat message: {e}")))?;
        self.model
            .apply_chat_template(template, &[message], true)
            .map_err(|e| RuntimeFailure::message(format!("apply chat template: {e}")))
    }

    fn tokenize_text(&self, text: &str) -> Result<Vec<Token>, RuntimeFailure> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Never)
            .map_err(|e| RuntimeFailure::message(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn load_media(&self, path: &Path) -> Result<Self::Media, RuntimeFailure> {
        let path = path
            .to_str()
            .ok_or_else(|| RuntimeFailure::message("path is not valid UTF-8"))?;
        MtmdBitmap::from_file(&self.projector, path).map_err(|e| RuntimeFailure::message(e.to_string()))
    }

    fn tokenize_multimodal(
        &mut self,
        prompt: &str,
        add_bos: bool,
        media: &[Self::Media],
    ) -> Result<Self::Chunks, RuntimeFailure> {
        let text = MtmdInputText {
            text: prompt.to_string(),
            add_special: add_bos,
            parse_special: true,
        };
        let bitmaps: Vec<&MtmdBitmap> = media.iter().collect();
        self.projector
            .tokenize(text, &bitmaps)
            .map_err(|e| RuntimeFailure::new(tokenize_code(&e), e.to_string()))
    }

    fn evaluate_chunks(
        &mut self,
        chunks: &Self::Chunks,
        position: usize,
        batch_size: usize,
    ) -> Result<usize, RuntimeFailure> {
        let n_batch = i32::try_from(batch_size).unwrap_or(i32::MAX);
        let next = chunks
            .eval_chunks(&self.projector, &self.context, to_pos(position)?, SEQ_ID, n_batch, true)
            .map_err(|e| RuntimeFailure::new(eval_code(&e), e.to_string()))?;
        usize::try_from(next).map_err(|_| RuntimeFailure::message(format!("invalid position {next}")))
    }

    fn sample(&mut self) -> Token {
        self.sampler.sample(&self.context, -1).0
    }

    fn accept(&mut self, token: Token) {
        self.sampler.accept(LlamaToken(token));
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_piece(&self, token: Token) -> Result<Vec<u8>, RuntimeFailure> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| RuntimeFailure::message(e.to_string()))
    }

    fn decode_token(&mut self, token: Token, position: usize) -> Result<(), RuntimeFailure> {
        self.batch.clear();
        self.batch
            .add(LlamaToken(token), to_pos(position)?, &[SEQ_ID], true)
            .map_err(|e| RuntimeFailure::message(e.to_string()))?;
        self.context
            .decode(&mut self.batch)
            .map_err(|e| RuntimeFailure::message(e.to_string()))
    }

    fn remove_context_from(&mut self, from: usize) -> Result<(), RuntimeFailure> {
        let from = u32::try_from(from)
            .map_err(|_| RuntimeFailure::message(format!("position {from} out of range")))?;
        let removed = self
            .context
            .clear_kv_cache_seq(Some(SEQ_ID as u32), Some(from), None)
            .map_err(|e| RuntimeFailure::message(e.to_string()))?;
        if !removed {
            return Err(RuntimeFailure::message("context refused partial sequence removal"));
        }
        Ok(())
    }
}
