//! Model discovery
//!
//! Finds GGUF files in a directory and pairs each language model with the
//! multimodal projector whose file name shares the longest prefix with it.

use crate::inference::model::is_projector_file;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Information about a GGUF file
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Full path to the file
    pub path: PathBuf,
    /// Filename of the file
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// True for multimodal projectors
    pub is_projector: bool,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            is_projector: is_projector_file(&path),
            path,
            filename,
            size_bytes: metadata.len(),
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// A language model and the projector loaded with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPair {
    pub model: PathBuf,
    pub projector: PathBuf,
}

impl ModelPair {
    pub fn new(model: impl Into<PathBuf>, projector: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            projector: projector.into(),
        }
    }

    /// Returns true if both files are still on disk
    pub fn exists(&self) -> bool {
        self.model.is_file() && self.projector.is_file()
    }
}

/// Scan a directory for GGUF files
///
/// Returns models and projectors alike, sorted by filename.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models path is not a directory: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_gguf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gguf"))
            .unwrap_or(false);
        if !path.is_file() || !is_gguf {
            continue;
        }

        match ModelInfo::from_path(path.clone()) {
            Ok(info) => {
                tracing::debug!("Found GGUF file: {}", info.filename);
                models.push(info);
            }
            Err(e) => {
                tracing::warn!("Failed to read model file {:?}: {}", path, e);
            }
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));

    tracing::info!("Found {} GGUF file(s) in {}", models.len(), directory.display());

    Ok(models)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x.eq_ignore_ascii_case(y))
        .count()
}

/// Pairs every language model with its best matching projector.
///
/// Models are skipped when the directory holds no projector at all.
pub fn pair_models(files: &[ModelInfo]) -> Vec<ModelPair> {
    let projectors: Vec<&ModelInfo> = files.iter().filter(|f| f.is_projector).collect();

    files
        .iter()
        .filter(|f| !f.is_projector)
        .filter_map(|model| {
            // first projector wins ties
            let best = projectors.iter().fold(None, |best: Option<(&ModelInfo, usize)>, p| {
                let len = common_prefix_len(&model.filename, &p.filename);
                match best {
                    Some((_, best_len)) if best_len >= len => best,
                    _ => Some((*p, len)),
                }
            })?;
            Some(ModelPair::new(&model.path, &best.0.path))
        })
        .collect()
}
