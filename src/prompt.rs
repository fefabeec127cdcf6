//! C2 — `PromptAnalyzer`: validates a batch of Whisper prompts and locates
//! the start-of-transcript index and the prompt-length boundary shared by
//! the whole batch.
//!
//! The teacher never validates prompt shape — `Decoder::decode` builds the
//! `<|startoftranscript|>` prefix itself from constants it already knows are
//! well-formed. This module generalizes that implicit assumption into an
//! explicit check over caller-supplied prompts, since `WhisperDriver::generate`
//! accepts arbitrary prompts.

use crate::error::{DriverError, Result};

/// `(sot_index, prompt_length)` shared by every prompt in a batch.
pub type PromptShape = (usize, usize);

/// Validates `prompts` and returns the batch-common `(sot_index,
/// prompt_length)` pair.
///
/// # Errors
/// Returns `DriverError::InvalidArgument` if any prompt lacks the SOT token,
/// or if prompts disagree on either `sot_index` or `prompt_length`.
pub fn analyze(prompts: &[Vec<u32>], sot_id: u32, no_timestamps_id: u32) -> Result<PromptShape> {
    let mut shape: Option<PromptShape> = None;
    for (i, prompt) in prompts.iter().enumerate() {
        let sot_index = prompt
            .iter()
            .position(|&tok| tok == sot_id)
            .ok_or_else(|| DriverError::invalid_argument(format!("prompt {i} lacks the SOT token")))?;

        let prompt_length = (sot_index..prompt.len())
            .find(|&idx| !(sot_id..=no_timestamps_id).contains(&prompt[idx]))
            .unwrap_or(prompt.len());

        match shape {
            None => shape = Some((sot_index, prompt_length)),
            Some((expected_sot, expected_len)) => {
                if expected_sot != sot_index || expected_len != prompt_length {
                    return Err(DriverError::invalid_argument(format!(
                        "prompt {i} has (sot_index={sot_index}, prompt_length={prompt_length}), \
                         expected (sot_index={expected_sot}, prompt_length={expected_len})"
                    )));
                }
            }
        }
    }
    // `prompts` empty is handled by the driver before this is called (S1);
    // an analyzer invoked with no rows has nothing to agree or disagree on.
    shape.ok_or_else(|| DriverError::invalid_argument("no prompts to analyze"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOT: u32 = 50258;
    const LANG_EN: u32 = 50259;
    const TRANSCRIBE: u32 = 50359;
    const NO_TIMESTAMPS: u32 = 50363;

    #[test]
    fn short_prompt_is_sot_only() {
        let prompts = vec![vec![SOT]];
        let (sot_index, prompt_length) = analyze(&prompts, SOT, NO_TIMESTAMPS).unwrap();
        assert_eq!(sot_index, 0);
        assert_eq!(prompt_length, 1);
    }

    #[test]
    fn task_prompt_stops_at_first_non_control_token() {
        // sot, lang, transcribe, no_timestamps, then free text continuing
        // past prompt_length.
        let prompts = vec![vec![SOT, LANG_EN, TRANSCRIBE, NO_TIMESTAMPS, 777, 778]];
        let (sot_index, prompt_length) = analyze(&prompts, SOT, NO_TIMESTAMPS).unwrap();
        assert_eq!(sot_index, 0);
        assert_eq!(prompt_length, 4);
    }

    #[test]
    fn timestamps_prompt_has_no_no_timestamps_token() {
        let prompts = vec![vec![SOT, LANG_EN, TRANSCRIBE]];
        let (sot_index, prompt_length) = analyze(&prompts, SOT, NO_TIMESTAMPS).unwrap();
        assert_eq!(sot_index, 0);
        assert_eq!(prompt_length, 3);
    }

    #[test]
    fn text_suffix_length_may_vary_across_batch() {
        let prompts = vec![
            vec![SOT, LANG_EN, TRANSCRIBE, NO_TIMESTAMPS, 1, 2, 3],
            vec![SOT, LANG_EN, TRANSCRIBE, NO_TIMESTAMPS],
        ];
        let (sot_index, prompt_length) = analyze(&prompts, SOT, NO_TIMESTAMPS).unwrap();
        assert_eq!(sot_index, 0);
        assert_eq!(prompt_length, 4);
    }

    #[test]
    fn missing_sot_is_invalid_argument() {
        let prompts = vec![vec![LANG_EN, TRANSCRIBE]];
        assert!(matches!(
            analyze(&prompts, SOT, NO_TIMESTAMPS),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn mismatched_prompt_length_is_invalid_argument() {
        // S5 from spec.md: one row stops after lang, the other continues to
        // transcribe.
        let prompts = vec![vec![SOT, LANG_EN], vec![SOT, LANG_EN, TRANSCRIBE]];
        assert!(matches!(
            analyze(&prompts, SOT, NO_TIMESTAMPS),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn mismatched_sot_index_is_invalid_argument() {
        let prompts = vec![vec![SOT], vec![999, SOT]];
        assert!(matches!(
            analyze(&prompts, SOT, NO_TIMESTAMPS),
            Err(DriverError::InvalidArgument(_))
        ));
    }
}
