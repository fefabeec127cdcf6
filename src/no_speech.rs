//! C3 — `NoSpeechExtractor`: produces the per-batch no-speech probability,
//! either eagerly off a standalone logits tensor (prefill path) or lazily as
//! a logits processor installed into the beam loop (short-prompt path).
//!
//! This generalizes the teacher's inline `i == 0` branch in
//! `Decoder::decode` (`transcription.rs`), which read `no_speech_token`'s
//! softmax probability off the first decoding step for a single sequence.

use candle_core::Tensor;

use crate::error::Result;
use crate::processors::{DisableTokens, LogitsProcessor};
use crate::tensor_ops::{gather_column_f32, softmax_last_dim};

/// Shape (a): eager extraction off a `[N, V]` logits tensor (one row per
/// beam). Used when the prompt's SOT token is not the last prompt token,
/// i.e. the no-speech step happens during prefill rather than during
/// generation.
pub fn extract_eager(logits: &Tensor, no_speech_id: u32) -> candle_core::Result<Vec<f32>> {
    let probs = softmax_last_dim(logits)?;
    gather_column_f32(&probs, no_speech_id as usize)
}

/// Shape (b): a stateful logits processor that captures the no-speech
/// probability on the first decoding step, reading row `i * beam_size` of
/// each batch item exactly once, then stays inert for the rest of decoding.
///
/// Installed only when the prompt's SOT token *is* the last prompt token
/// (`sot_is_start_token`), so the no-speech read must happen on step 0 of
/// generation rather than during a prefill pass.
pub struct NoSpeechExtractor {
    no_speech_id: u32,
    beam_size: usize,
    batch_size: usize,
    captured: Option<Vec<f32>>,
}

impl NoSpeechExtractor {
    pub fn new(no_speech_id: u32, beam_size: usize, batch_size: usize) -> Self {
        Self {
            no_speech_id,
            beam_size,
            batch_size,
            captured: None,
        }
    }

    /// Available once `apply` has run for step 0; `None` before that.
    pub fn probs(&self) -> Option<&[f32]> {
        self.captured.as_deref()
    }

    pub fn into_probs(self) -> Option<Vec<f32>> {
        self.captured
    }
}

impl LogitsProcessor for NoSpeechExtractor {
    fn apply_first(&self) -> bool {
        true
    }

    fn apply(
        &mut self,
        step: usize,
        logits: &mut [Vec<f32>],
        _disable: &mut DisableTokens,
        _sequences: &[Vec<u32>],
        _batch_offset: &[usize],
        _sample_begin: &[usize],
    ) -> Result<()> {
        if step != 0 || self.captured.is_some() {
            return Ok(());
        }
        let mut probs = Vec::with_capacity(self.batch_size);
        for i in 0..self.batch_size {
            let row = &logits[i * self.beam_size];
            probs.push(softmax_row(row, self.no_speech_id as usize));
        }
        self.captured = Some(probs);
        Ok(())
    }
}

/// Softmax of a single host-side logits row, returning the probability at
/// `column`. Mirrors `extract_eager` but for one row already on the host,
/// which is how beam-search keeps its working logits.
fn softmax_row(row: &[f32], column: usize) -> f32 {
    let m = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut denom = 0f32;
    let mut numer = 0f32;
    for (i, &v) in row.iter().enumerate() {
        let e = (v - m).exp();
        denom += e;
        if i == column {
            numer = e;
        }
    }
    numer / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn eager_extraction_matches_manual_softmax() -> candle_core::Result<()> {
        let device = Device::Cpu;
        // Two rows, vocab size 4; no_speech_id = 2.
        let logits = Tensor::from_vec(vec![1f32, 2., 5., 0., 0., 0., 0., 10.], (2, 4), &device)?;
        let probs = extract_eager(&logits, 2)?;
        let expected_row0 = softmax_row(&[1., 2., 5., 0.], 2);
        let expected_row1 = softmax_row(&[0., 0., 0., 10.], 2);
        assert!((probs[0] - expected_row0).abs() < 1e-5);
        assert!((probs[1] - expected_row1).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn processor_captures_exactly_once_on_step_zero() {
        let mut proc = NoSpeechExtractor::new(1, 2, 2);
        let mut disable = DisableTokens::new(4);
        let sequences = vec![vec![]; 4];
        let batch_offset = vec![0, 0, 1, 1];
        let sample_begin = vec![0; 4];

        // beam rows: batch0 -> rows 0,1 ; batch1 -> rows 2,3. Only rows 0
        // and 2 (i*beam_size) should be read.
        let mut logits = vec![
            vec![0.0, 5.0, 0.0],
            vec![9.0, 9.0, 9.0],
            vec![0.0, 1.0, 0.0],
            vec![9.0, 9.0, 9.0],
        ];
        proc.apply(0, &mut logits, &mut disable, &sequences, &batch_offset, &sample_begin)
            .unwrap();
        let probs = proc.probs().unwrap().to_vec();
        assert_eq!(probs.len(), 2);
        assert!(probs[0] > 0.9); // dominated by logit at index 1
        assert!(probs[1] > 0.4 && probs[1] < 0.5);

        // A second call at a later step must not overwrite the capture.
        proc.apply(1, &mut logits, &mut disable, &sequences, &batch_offset, &sample_begin)
            .unwrap();
        assert_eq!(proc.probs().unwrap(), probs.as_slice());
    }

    #[test]
    fn processor_declares_apply_first() {
        let proc = NoSpeechExtractor::new(0, 1, 1);
        assert!(proc.apply_first());
    }
}
