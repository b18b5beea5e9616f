//! Llamaratti - multimodal chat with local llama.cpp models
//!
//! Loads a GGUF language model together with its multimodal projector and
//! streams responses to stdout. Logs go to stderr.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamaratti::inference::{ChatEngine, ChatError, ConsoleSink, MediaKind};
use llamaratti::storage::models::{pair_models, scan_models_directory, ModelPair};
use llamaratti::storage::settings::{load_settings, save_settings, ChatSettings};

#[derive(Debug, Parser)]
#[command(name = "llamaratti", version)]
#[command(about = "Multimodal chat with local llama.cpp models", long_about = None)]
struct Args {
    /// GGUF language model. Defaults to the last model used.
    model: Option<PathBuf>,

    /// GGUF multimodal projector matching MODEL.
    mmproj: Option<PathBuf>,

    /// Context length in tokens.
    #[arg(short = 'c', long)]
    ctx_size: Option<u32>,

    /// Sampling temperature (0 = greedy).
    #[arg(long)]
    temp: Option<f32>,

    /// Sampling seed (4294967295 = random).
    #[arg(long)]
    seed: Option<u32>,

    /// Chat template for models that do not embed one (e.g. vicuna, deepseek).
    #[arg(long)]
    chat_template: Option<String>,

    /// Maximum tokens generated per turn.
    #[arg(short = 'n', long)]
    n_predict: Option<u32>,

    /// Layers offloaded to the GPU.
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// CPU threads.
    #[arg(short = 't', long)]
    threads: Option<i32>,

    /// Image or audio file attached to the first turn. Repeatable.
    #[arg(long = "media", value_name = "PATH")]
    media: Vec<PathBuf>,

    /// Prompt for a single turn.
    #[arg(short = 'p', long)]
    prompt: Option<String>,

    /// Read one turn per line from stdin (`/clear`, `/media <path>`, `/quit`).
    #[arg(short = 'i', long, default_value_t = false)]
    interactive: bool,

    /// List GGUF model/projector pairs found in DIR and exit.
    #[arg(long, value_name = "DIR")]
    list_models: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llamaratti=info")))
        .init();

    info!("Starting Llamaratti v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    if let Some(dir) = &args.list_models {
        return list_models(dir);
    }

    let mut settings = load_settings();
    apply_overrides(&mut settings, &args);

    let pair = resolve_pair(&args, &settings)?;
    let mut config = settings.session_config(&pair);
    config.threads = args.threads;

    let engine = match ChatEngine::start(config, Box::new(ConsoleSink::stdout())) {
        Ok(engine) => engine,
        Err(e) => {
            // already reported on stdout as a status event
            tracing::error!("Unable to start: {}", e);
            std::process::exit(1);
        }
    };
    remember_pair(Some(pair.clone()));

    let control = engine.control();
    ctrlc::set_handler(move || {
        // covers tokenization and prefill, not only generation
        if control.is_turn_active() {
            control.stop_generating();
        } else {
            std::process::exit(130);
        }
    })
    .context("install ctrl-c handler")?;

    eprintln!("Supported media:\n{}", engine.modality().supported_media_types());

    for path in &args.media {
        queue_media(&engine, path);
    }

    if let Some(prompt) = &args.prompt {
        run_turn(&engine, prompt);
    }

    if args.interactive || args.prompt.is_none() {
        interactive_loop(&engine)?;
    }

    Ok(())
}

fn apply_overrides(settings: &mut ChatSettings, args: &Args) {
    if let Some(ctx) = args.ctx_size {
        settings.context_length = ctx;
    }
    if let Some(temp) = args.temp {
        settings.temperature = temp;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(template) = &args.chat_template {
        settings.chat_template = Some(template.clone());
    }
    if let Some(n) = args.n_predict {
        settings.max_tokens = Some(n);
    }
    if let Some(layers) = args.gpu_layers {
        settings.gpu_layers = layers;
    }
    settings.validate();
}

fn resolve_pair(args: &Args, settings: &ChatSettings) -> Result<ModelPair> {
    match (&args.model, &args.mmproj) {
        (Some(model), Some(mmproj)) => Ok(ModelPair::new(model, mmproj)),
        (Some(_), None) => bail!("MMPROJ is required when MODEL is given"),
        _ => match settings.usable_last_model() {
            Some(pair) => {
                info!("Using last model {}", pair.model.display());
                Ok(pair.clone())
            }
            None => bail!("no model given and no previous model to reuse"),
        },
    }
}

/// Records the model pair to reuse on the next start, or forgets it.
fn remember_pair(pair: Option<ModelPair>) {
    let mut stored = load_settings();
    stored.last_model = pair;
    if let Err(e) = save_settings(&stored) {
        tracing::warn!("Failed to save settings: {}", e);
    }
}

fn queue_media(engine: &ChatEngine, path: &Path) {
    match MediaKind::from_path(path) {
        Some(kind) if !engine.modality().supports(kind) => {
            tracing::warn!("The loaded projector does not accept {:?} media: {}", kind, path.display());
        }
        None => tracing::warn!("Unrecognized media type: {}", path.display()),
        Some(_) => {}
    }
    // failures are reported through the sink, the turn goes on without it
    let _ = engine.load_media(path);
}

fn run_turn(engine: &ChatEngine, prompt: &str) {
    match engine.respond(prompt) {
        Ok(state) => tracing::debug!("Turn ended: {:?}", state),
        Err(e) if e.taints_context() => {
            tracing::warn!("Turn aborted, starting a new conversation");
            if let Err(e) = engine.clear_history() {
                tracing::error!("{}", e);
            }
            // the pair may be too large for this machine
            remember_pair(None);
        }
        Err(ChatError::Worker(e)) => tracing::error!("Worker failed: {}", e),
        Err(_) => {}
    }
}

fn interactive_loop(engine: &ChatEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("> ");
        io::stderr().flush().ok();

        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("read stdin")?;
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                engine.clear_history()?;
                eprintln!("History cleared");
            }
            _ => {
                if let Some(path) = line.strip_prefix("/media ") {
                    queue_media(engine, Path::new(path.trim()));
                } else {
                    run_turn(engine, line);
                }
            }
        }
    }

    Ok(())
}

fn list_models(dir: &Path) -> Result<()> {
    let files = scan_models_directory(dir).with_context(|| format!("scan {}", dir.display()))?;
    let pairs = pair_models(&files);

    if pairs.is_empty() {
        eprintln!("No model/projector pairs in {}", dir.display());
        return Ok(());
    }

    for pair in pairs {
        let size = files
            .iter()
            .find(|f| f.path == pair.model)
            .map(|f| f.size_string())
            .unwrap_or_default();
        println!("{}\t{}\t{}", pair.model.display(), pair.projector.display(), size);
    }
    Ok(())
}
