//! C5 — `LanguageDetector`: ranks candidate languages for a batch of
//! log-mel feature tensors.
//!
//! Generalizes the teacher's hardcoded language handling — `Decoder` takes a
//! single `language_token: Option<u32>` that, in the shipped driver, is
//! always `None` (`transcribe.rs`'s `// TODO: optionally pass in a language
//! token`) — into an actual detector that asks the model which language it
//! thinks it is hearing.

use candle_core::{DType, Tensor};

use crate::error::{DriverError, Result};
use crate::model::WhisperModel;
use crate::tensor_ops::softmax_last_dim;
use crate::vocabulary::VocabularyAdapter;

/// One batch item's ranked language guesses, highest probability first.
pub type LanguageRanking = Vec<(String, f32)>;

pub fn detect(model: &mut WhisperModel, vocab: &VocabularyAdapter, features: &Tensor) -> Result<Vec<LanguageRanking>> {
    if !vocab.is_multilingual() {
        return Err(DriverError::runtime(
            "detect_language called on an English-only model",
        ));
    }

    let batch_size = features.dim(0)?;
    let memory = model.encode(features, true)?;

    let sot_ids = vec![vocab.sot_id(); batch_size];
    let tokens = Tensor::from_vec(sot_ids, (batch_size, 1), features.device())?;
    let hidden = model.decode_step(&tokens, &memory, true)?;
    let logits = model.final_linear_last_step(&hidden)?; // [B, V]

    let lang_ids = vocab.lang_ids();
    let columns: Vec<u32> = lang_ids.iter().map(|(id, _)| *id).collect();
    let index = Tensor::from_vec(columns.clone(), columns.len(), features.device())?;
    let lang_logits = logits.index_select(&index, 1)?; // [B, L]
    let probs = softmax_last_dim(&lang_logits)?.to_dtype(DType::F32)?;
    let probs: Vec<Vec<f32>> = probs.to_vec2()?;

    let rankings = probs
        .into_iter()
        .map(|row| {
            let mut ranking: LanguageRanking = row
                .into_iter()
                .zip(lang_ids.iter())
                .map(|(p, (_, code))| (code.clone(), p))
                .collect();
            ranking.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranking
        })
        .collect();
    Ok(rankings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rankings_are_sorted_descending() {
        // Exercise the sort/zip logic directly rather than through a real
        // model, which would need network-fetched weights.
        let lang_ids = vec![(1u32, "en".to_string()), (2u32, "es".to_string()), (3u32, "fr".to_string())];
        let row = vec![0.2f32, 0.5, 0.3];
        let mut ranking: LanguageRanking = row.into_iter().zip(lang_ids.iter()).map(|(p, (_, c))| (c.clone(), p)).collect();
        ranking.sort_by(|a, b| b.1.total_cmp(&a.1));
        assert_eq!(ranking[0].0, "es");
        assert_eq!(ranking[1].0, "fr");
        assert_eq!(ranking[2].0, "en");
    }
}
