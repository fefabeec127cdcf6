//! Realizes the "Encoder"/"Decoder" collaborator contracts of §6.2 over the
//! two candle Whisper variants this repo supports, following the `ModelType`
//! enum pattern used by the reference pack's `rwhisper` and `super-stt`
//! integrations (both wrap `candle_transformers::models::whisper::{model,
//! quantized_model}::Whisper` behind a single enum with a `config()` accessor).

use std::path::Path;

use candle_core::{Device, IndexOp, Tensor};
use candle_transformers::models::whisper::{self as whisper_ns, model, quantized_model, Config};

use crate::error::Result;

/// Encoder/decoder pair, quantized (GGUF) or full-precision (safetensors).
pub enum WhisperModel {
    Quantized(quantized_model::Whisper),
    Float(model::Whisper),
}

impl WhisperModel {
    /// Loads a GGUF (`quantized = true`) or safetensors (`quantized = false`)
    /// checkpoint, following `ModelType::load`'s branch in the reference
    /// `rwhisper` integration.
    pub fn load(weights_filename: &Path, config: Config, device: &Device, quantized: bool) -> Result<Self> {
        if quantized {
            let vb = quantized_model::VarBuilder::from_gguf(weights_filename, device)?;
            Ok(Self::Quantized(quantized_model::Whisper::load(&vb, config)?))
        } else {
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_filename], whisper_ns::DTYPE, device)?
            };
            Ok(Self::Float(model::Whisper::load(&vb, config)?))
        }
    }

    pub fn config(&self) -> &Config {
        match self {
            Self::Quantized(m) => &m.config,
            Self::Float(m) => &m.config,
        }
    }

    /// Realizes `Encoder::apply(features[B,80,3000], out)`.
    pub fn encode(&mut self, features: &Tensor, flush: bool) -> Result<Tensor> {
        let out = match self {
            Self::Quantized(m) => m.encoder.forward(features, flush)?,
            Self::Float(m) => m.encoder.forward(features, flush)?,
        };
        Ok(out)
    }

    /// Realizes `Decoder::forward_prompt` / `Decoder::apply`: a batched
    /// forward pass over `tokens` against `memory`, with `flush` selecting
    /// whether the internal key/value cache resets (prefill) or continues
    /// (per-step generation).
    pub fn decode_step(&mut self, tokens: &Tensor, memory: &Tensor, flush: bool) -> Result<Tensor> {
        let hidden = match self {
            Self::Quantized(m) => m.decoder.forward(tokens, memory, flush)?,
            Self::Float(m) => m.decoder.forward(tokens, memory, flush)?,
        };
        Ok(hidden)
    }

    /// Realizes `compute_logits_for_steps(hidden, column_indices, out_logits)`
    /// for the common case of "every column", matching the teacher's
    /// `decoder.final_linear` call in `transcription.rs`.
    pub fn final_linear(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = match self {
            Self::Quantized(m) => m.decoder.final_linear(hidden)?,
            Self::Float(m) => m.decoder.final_linear(hidden)?,
        };
        Ok(logits)
    }

    /// Runs `final_linear` restricted to the last time step of `hidden`,
    /// returning a `[B, V]` logits tensor — the shape every beam-search step
    /// and the language detector consume.
    pub fn final_linear_last_step(&self, hidden: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _) = hidden.dims3()?;
        let last = hidden.i((.., seq_len - 1..seq_len, ..))?;
        let logits = self.final_linear(&last)?;
        Ok(logits.squeeze(1)?)
    }
}

/// Picks the metal device on Apple targets, CPU everywhere else, mirroring
/// the `cfg(target_vendor = "apple")` split in `Cargo.toml`'s `candle-core`
/// feature selection (the teacher hardcodes `Device::new_metal(0)`, which
/// only builds at all on that target).
pub fn default_device() -> Result<Device> {
    #[cfg(target_vendor = "apple")]
    {
        Ok(Device::new_metal(0)?)
    }
    #[cfg(not(target_vendor = "apple"))]
    {
        Ok(Device::Cpu)
    }
}

/// The driver's handle to per-request decoder state: the encoder memory to
/// condition on, plus whether the next decode call must flush (reset) the
/// wrapped model's internal key/value cache. The cache tensors themselves
/// remain owned by the wrapped candle model (true external state per §6.2);
/// this struct is the lifecycle handle plus the one tensor the driver must
/// inject explicitly.
#[derive(Clone)]
pub struct DecoderState {
    pub memory: Tensor,
    pub started: bool,
}

impl DecoderState {
    pub fn new(memory: Tensor) -> Self {
        Self { memory, started: false }
    }

    /// Whether the next decoder call should flush the cache. True only for
    /// the very first call made against this state.
    pub fn flush_next(&mut self) -> bool {
        let flush = !self.started;
        self.started = true;
        flush
    }
}
