//! Settings storage
//!
//! Persists generation defaults and the most recently used model pair.

use crate::inference::session::{
    SessionConfig, DEFAULT_CONTEXT_LENGTH, DEFAULT_SEED, DEFAULT_TEMPERATURE,
};
use crate::storage::models::ModelPair;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Smallest context length offered
pub const MIN_CONTEXT_LENGTH: u32 = 2048;
/// Largest context length offered
pub const MAX_CONTEXT_LENGTH: u32 = 163_840;

/// Chat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Context window size
    pub context_length: u32,
    /// Sampling seed, 0xFFFFFFFF for a random one
    pub seed: u32,
    /// Token budget per turn, unbounded if unset
    pub max_tokens: Option<u32>,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Prompt evaluation batch size
    pub batch_size: u32,
    /// Chat template override
    pub chat_template: Option<String>,
    /// Directory scanned by `--list-models` when none is given
    pub models_directory: Option<PathBuf>,
    /// Model pair of the last successful start
    pub last_model: Option<ModelPair>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            context_length: DEFAULT_CONTEXT_LENGTH,
            seed: DEFAULT_SEED,
            max_tokens: None,
            gpu_layers: 99, // Offload all layers to GPU by default
            batch_size: 2048,
            chat_template: None,
            models_directory: None,
            last_model: None,
        }
    }
}

impl ChatSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges. Returns the names
    /// of the fields whose values had to be changed; each change is logged.
    pub fn validate(&mut self) -> Vec<&'static str> {
        let mut adjusted = Vec::new();

        let temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, 2.0)
        } else {
            DEFAULT_TEMPERATURE
        };
        if temperature != self.temperature {
            tracing::warn!("Temperature {} is out of range, using {}", self.temperature, temperature);
            self.temperature = temperature;
            adjusted.push("temperature");
        }

        let context_length = self
            .context_length
            .clamp(MIN_CONTEXT_LENGTH, MAX_CONTEXT_LENGTH);
        if context_length != self.context_length {
            tracing::warn!(
                "Context length {} is out of range, using {}",
                self.context_length,
                context_length
            );
            self.context_length = context_length;
            adjusted.push("context_length");
        }

        if self.batch_size == 0 {
            self.batch_size = 2048;
        }

        if self.max_tokens == Some(0) {
            self.max_tokens = None;
        }

        if matches!(self.chat_template.as_deref(), Some(name) if name.trim().is_empty()) {
            self.chat_template = None;
        }

        adjusted
    }

    /// Session configuration for `pair` using these settings
    pub fn session_config(&self, pair: &ModelPair) -> SessionConfig {
        SessionConfig {
            context_length: self.context_length,
            temperature: self.temperature,
            seed: self.seed,
            chat_template: self.chat_template.clone(),
            gpu_layers: self.gpu_layers,
            batch_size: self.batch_size,
            max_tokens: self.max_tokens,
            ..SessionConfig::new(&pair.model, &pair.projector)
        }
    }

    /// The remembered model pair, if both files still exist
    pub fn usable_last_model(&self) -> Option<&ModelPair> {
        self.last_model.as_ref().filter(|pair| pair.exists())
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> ChatSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ChatSettings::default()
        }
    }
}

/// Load settings from `path`, falling back to defaults
pub fn load_settings_from(path: &Path) -> ChatSettings {
    match read_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ChatSettings::default()
        }
    }
}

fn read_settings(path: &Path) -> Result<ChatSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ChatSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ChatSettings = serde_json::from_str(&json)?;

    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &ChatSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`, creating parent directories
pub fn save_settings_to(settings: &ChatSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
