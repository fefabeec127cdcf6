//! Downloads and loads a Whisper checkpoint from the Hugging Face Hub,
//! producing the `WhisperModel` + `VocabularyAdapter` pair `WhisperDriver`
//! is built from.

use std::path::PathBuf;

use candle_transformers::models::whisper::Config;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;

use crate::config;
use crate::error::{DriverError, Result};
use crate::model::{default_device, WhisperModel};
use crate::vocabulary::VocabularyAdapter;

#[derive(Debug, Clone)]
pub struct WhisperRepo {
    pub config_filename: PathBuf,
    pub tokenizer_filename: PathBuf,
    pub weights_filename: PathBuf,
}

impl WhisperRepo {
    pub fn config(&self) -> Result<Config> {
        let contents = std::fs::read_to_string(&self.config_filename)
            .map_err(|err| DriverError::ModelLoad(err.to_string()))?;
        serde_json::from_str(&contents).map_err(|err| DriverError::ModelLoad(err.to_string()))
    }

    pub fn tokenizer(&self) -> Result<Tokenizer> {
        Tokenizer::from_file(&self.tokenizer_filename)
            .map_err(|err| DriverError::ModelLoad(err.to_string()))
    }

    fn is_quantized(&self) -> bool {
        self.weights_filename
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "gguf")
            .unwrap_or(false)
    }

    /// Loads the encoder/decoder pair and the resolved vocabulary from this
    /// repo's downloaded files, picking the quantized or float code path from
    /// the weights file's extension.
    pub fn load(&self) -> Result<(WhisperModel, VocabularyAdapter)> {
        let device = default_device()?;
        let config = self.config()?;
        let quantized = self.is_quantized();
        let model = WhisperModel::load(&self.weights_filename, config, &device, quantized)?;
        let tokenizer = self.tokenizer()?;
        let vocabulary = VocabularyAdapter::new(tokenizer)?;
        Ok((model, vocabulary))
    }
}

/// Downloads `repo_id`'s `config.json`, `tokenizer.json`, and weights file
/// (`model.gguf` if present, else `model.safetensors`) from the hub.
pub fn download(repo_id: &str) -> Result<WhisperRepo> {
    let api = Api::new().map_err(|err| DriverError::ModelLoad(err.to_string()))?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_owned(),
        RepoType::Model,
        "main".to_owned(),
    ));
    let config_filename = repo
        .get("config.json")
        .map_err(|err| DriverError::ModelLoad(err.to_string()))?;
    let tokenizer_filename = repo
        .get("tokenizer.json")
        .map_err(|err| DriverError::ModelLoad(err.to_string()))?;
    let weights_filename = repo
        .get("model.gguf")
        .or_else(|_| repo.get("model.safetensors"))
        .map_err(|err| DriverError::ModelLoad(err.to_string()))?;
    Ok(WhisperRepo {
        config_filename,
        tokenizer_filename,
        weights_filename,
    })
}

/// Downloads from the repo named in `config::REPO_ID`.
pub fn download_default() -> Result<WhisperRepo> {
    download(config::REPO_ID)
}
