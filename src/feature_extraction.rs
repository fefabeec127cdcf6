//! Converts decoded PCM samples into the log-mel features `WhisperDriver`
//! consumes, wrapping `candle_transformers`'s `audio::pcm_to_mel` (the same
//! routine the upstream candle-examples whisper demo uses) the way the
//! reference pack's `spyglass` and `rwhisper` integrations do: build a mel
//! filterbank once per bin count, then reshape the flat mel vector into
//! `[1, num_mel_bins, frames]`.
//!
//! The reference integrations load their filterbank from a prebuilt binary
//! asset shipped alongside the crate (`melfilters.bytes`). This crate has no
//! such asset bundled, so the filterbank is computed analytically instead,
//! following the triangular-filter construction the `coldvox-stt` candle
//! backend falls back to when its own prebuilt asset is absent.

use candle_core::{Device, Tensor};
use candle_transformers::models::whisper::{audio, Config};

use crate::error::Result;

fn hz_to_mel(freq: f64) -> f64 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Builds a `[num_mel_bins, n_fft / 2 + 1]` triangular filterbank, flattened
/// row-major, matching the layout `audio::pcm_to_mel` expects.
fn build_mel_filters(num_mel_bins: usize, n_fft: usize, sample_rate: f64) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let mut filters = vec![0f32; num_mel_bins * n_freqs];

    let freqs: Vec<f64> = (0..n_freqs).map(|i| i as f64 * sample_rate / n_fft as f64).collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..=num_mel_bins + 1)
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (num_mel_bins + 1) as f64)
        .map(mel_to_hz)
        .collect();

    for m in 0..num_mel_bins {
        let left = mel_points[m];
        let center = mel_points[m + 1];
        let right = mel_points[m + 2];
        for (f, &freq) in freqs.iter().enumerate() {
            let weight = if freq < left || freq > right {
                0.0
            } else if freq <= center {
                (freq - left) / (center - left).max(1e-12)
            } else {
                (right - freq) / (right - center).max(1e-12)
            };
            filters[m * n_freqs + f] = weight as f32;
        }
    }
    filters
}

/// Audio sample rate the mel filterbank and STFT framing assume. Whisper
/// checkpoints are trained on 16 kHz mono audio regardless of the rate a
/// source file was recorded at.
const WHISPER_SAMPLE_RATE: f64 = 16_000.0;
const N_FFT: usize = 400;

/// Turns decoded PCM samples into the `[1, num_mel_bins, frames]` feature
/// tensor `WhisperDriver::encode`/`detect_language` expect.
pub fn extract_features(samples: Vec<f32>, config: &Config, device: &Device) -> Result<Tensor> {
    let mel_filters = build_mel_filters(config.num_mel_bins, N_FFT, WHISPER_SAMPLE_RATE);
    let mel = audio::pcm_to_mel(config, &samples, &mel_filters);
    let mel_len = mel.len();
    let tensor = Tensor::from_vec(mel, (1, config.num_mel_bins, mel_len / config.num_mel_bins), device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filterbank_rows_are_nonnegative_and_have_mass() {
        let filters = build_mel_filters(80, N_FFT, WHISPER_SAMPLE_RATE);
        assert_eq!(filters.len(), 80 * (N_FFT / 2 + 1));
        assert!(filters.iter().all(|&w| w >= 0.0));
        assert!(filters.iter().any(|&w| w > 0.0));
    }

    #[test]
    fn hz_mel_roundtrips() {
        let hz = 1000.0;
        let back = mel_to_hz(hz_to_mel(hz));
        assert!((hz - back).abs() < 0.01);
    }
}
