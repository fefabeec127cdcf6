// -----------------------
// Audio decoding settings
// -----------------------

// Sample rate must be 8, 12, 16, 24, or 48 kHz.  The libopus documentation recommends 48.
// The whisper paper mentioned that they re-sampled their audio to 16 MHz in training.
// Interestingly: when using the symphonia crate's matroska demuxer, a lower sample rate provided
// more accurate results.  With the matroska-demuxer crate, a higher sample rate seems to work better.
// In either case, if you get it too high, the transcriptions are just "... ... ..."
//
// Note that the sample rate of a file from the browser may not be one of the rates supported
// by libopus.  When using the browser's MediaRecorder API, you can pass in a custom sample
// rate, and the default rate "is adaptive, depending upon the sample rate and the number of channels."
// See:
//  * https://opus-codec.org/docs/opus_api-1.5.pdf
//  * https://developer.mozilla.org/en-US/docs/Web/API/MediaRecorder/MediaRecorder#audiobitspersecond
//  * https://arxiv.org/pdf/2212.04356 (the whisper paper, their process is described on page 3)
pub const AUDIO_DECODE_SAMPLE_RATE: u32 = 12_000;

// ---------------------------------
// HuggingFace repository settings
// ---------------------------------
pub const REPO_ID: &str = "Demonthos/candle-quantized-whisper-large-v3-turbo";


// -------------------
// Inference settings
// -------------------

// Seed to help provide randomness in a weighted index
pub const SEED: u64 = 299792458;

// ---------------------------------
// Runtime-configurable settings
// ---------------------------------

use serde::Deserialize;

/// Environment variable naming a TOML file to load `Settings` from. Absent
/// or unreadable, the service falls back to `Settings::default()`.
pub const SETTINGS_ENV_VAR: &str = "WHISPER_SERVER_CONFIG";

/// The handful of values that are legitimately runtime knobs for the demo
/// service, rather than compile-time constants: bind address, replica
/// count, and model repo override.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub bind_port: u16,
    pub replica_count: usize,
    pub model_repo: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 7025,
            replica_count: 1,
            model_repo: REPO_ID.to_string(),
        }
    }
}

impl Settings {
    /// Reads `WHISPER_SERVER_CONFIG` if set and points at a readable TOML
    /// file; otherwise returns the built-in defaults.
    pub fn from_env_or_default() -> Self {
        match std::env::var(SETTINGS_ENV_VAR) {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                    log::warn!("failed to parse {path}: {err}, falling back to defaults");
                    Settings::default()
                }),
                Err(err) => {
                    log::warn!("failed to read {path}: {err}, falling back to defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_configured_repo() {
        let settings = Settings::default();
        assert_eq!(settings.model_repo, REPO_ID);
        assert_eq!(settings.replica_count, 1);
    }

    #[test]
    fn parses_a_partial_toml_document_over_defaults() {
        let settings: Settings = toml::from_str("bind_port = 9000\n").unwrap();
        assert_eq!(settings.bind_port, 9000);
        assert_eq!(settings.bind_address, "127.0.0.1");
    }
}
