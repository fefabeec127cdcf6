//! C4 — `TimestampRules`: the logits processor enforcing Whisper's
//! timestamp-pairing, monotonicity, and initial-bound invariants.
//!
//! The teacher's decode loop (`transcription.rs::Decoder::decode`) left this
//! exact behavior as a `TODO`:
//!
//! ```text
//! // TODO: Besides suppress tokens, we should apply the heuristics from
//! // ApplyTimestampRules, i.e.:
//! // - Timestamps come in pairs, except before EOT.
//! // - Timestamps should be non-decreasing.
//! // - If the sum of the probabilities of timestamps is higher than any
//! //   other tokens, only consider timestamps when sampling.
//! ```
//!
//! This module implements that TODO in full.

use std::ops::Range;

use crate::error::Result;
use crate::processors::{DisableTokens, LogitsProcessor};
use crate::tensor_ops::{logsumexp_over_range, max_over_range};

pub struct TimestampRules {
    eot_id: u32,
    no_timestamps_id: u32,
    timestamp_begin_id: u32,
    timestamp_end_id: u32,
    max_initial_timestamp_id: u32,
}

impl TimestampRules {
    pub fn new(
        eot_id: u32,
        no_timestamps_id: u32,
        timestamp_begin_id: u32,
        timestamp_end_id: u32,
        max_initial_timestamp_index: usize,
    ) -> Self {
        // Defensive clamp: spec.md leaves behavior undefined when the
        // configured index would push `max_initial_timestamp_id` past
        // `timestamp_end_id`.
        let max_initial_timestamp_id = timestamp_begin_id
            .saturating_add(max_initial_timestamp_index as u32)
            .min(timestamp_end_id);
        Self {
            eot_id,
            no_timestamps_id,
            timestamp_begin_id,
            timestamp_end_id,
            max_initial_timestamp_id,
        }
    }

    fn disable_and_mask(&self, disable: &mut DisableTokens, row: &mut [f32], b: usize, range: Range<u32>) {
        disable.disable_range(b, range.clone());
        let lo = range.start as usize;
        let hi = (range.end as usize).min(row.len());
        if lo < hi {
            row[lo..hi].fill(f32::NEG_INFINITY);
        }
    }

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin_id
    }
}

impl LogitsProcessor for TimestampRules {
    fn apply(
        &mut self,
        step: usize,
        logits: &mut [Vec<f32>],
        disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        _batch_offset: &[usize],
        sample_begin: &[usize],
    ) -> Result<()> {
        for b in 0..logits.len() {
            let sb = sample_begin[b];

            // Rule 1: never re-enter "no timestamps" mode mid-generation.
            self.disable_and_mask(disable, &mut logits[b], b, self.no_timestamps_id..self.no_timestamps_id + 1);

            if step == sb {
                // Rule 2: the first generated token must be a timestamp,
                // bounded by the configured initial-timestamp clamp.
                self.disable_and_mask(disable, &mut logits[b], b, 0..self.timestamp_begin_id);
                self.disable_and_mask(
                    disable,
                    &mut logits[b],
                    b,
                    (self.max_initial_timestamp_id + 1)..(self.timestamp_end_id + 1),
                );
                continue;
            }

            let mut needs_mass_check = false;
            let last = sequences[b][step - 1];
            if self.is_timestamp(last) {
                let penultimate = if step - 1 > sb { sequences[b][step - 2] } else { last };
                if self.is_timestamp(penultimate) {
                    // Just closed a pair: next token must be text or EOT.
                    self.disable_and_mask(
                        disable,
                        &mut logits[b],
                        b,
                        self.timestamp_begin_id..(self.timestamp_end_id + 1),
                    );
                } else {
                    // Inside an open pair: next must be a timestamp or EOT.
                    self.disable_and_mask(disable, &mut logits[b], b, 0..self.eot_id);
                    needs_mass_check = true;
                }
            } else {
                needs_mass_check = true;
            }

            // Monotonicity: timestamps may not decrease. Scan newest to
            // oldest and stop at the first timestamp found.
            for idx in (sb..step).rev() {
                let tok = sequences[b][idx];
                if self.is_timestamp(tok) {
                    self.disable_and_mask(disable, &mut logits[b], b, self.timestamp_begin_id..tok);
                    break;
                }
            }

            if needs_mass_check {
                // log_softmax(x)_i = x_i - logsumexp(x); comparing
                // logsumexp(x[timestamps]) - Z against max(x[text]) - Z is
                // equivalent to comparing the raw (already-masked) logits,
                // since the shared normalizer Z cancels. This lets the mass
                // check work directly off `logits[b]` without a separate
                // full-row log-softmax pass.
                let row = &logits[b];
                let text_best = max_over_range(row, 0..self.timestamp_begin_id as usize);
                let timestamp_mass =
                    logsumexp_over_range(row, self.timestamp_begin_id as usize..(self.timestamp_end_id as usize + 1));
                if timestamp_mass > text_best {
                    self.disable_and_mask(disable, &mut logits[b], b, 0..self.timestamp_begin_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: u32 = 50257;
    const NO_TIMESTAMPS: u32 = 50363;
    const TS_BEGIN: u32 = 50364;
    const TS_END: u32 = 51000;
    const VOCAB: usize = (TS_END + 1) as usize;

    fn rules(max_initial_index: usize) -> TimestampRules {
        TimestampRules::new(EOT, NO_TIMESTAMPS, TS_BEGIN, TS_END, max_initial_index)
    }

    fn flat_row() -> Vec<f32> {
        vec![0.0; VOCAB]
    }

    #[test]
    fn first_token_is_confined_to_a_valid_initial_timestamp() {
        let mut r = rules(50);
        let mut logits = vec![flat_row()];
        let mut disable = DisableTokens::new(1);
        let sequences = vec![vec![]];
        let batch_offset = vec![0];
        let sample_begin = vec![0];

        r.apply(0, &mut logits, &mut disable, &sequences, &batch_offset, &sample_begin)
            .unwrap();

        let row = &logits[0];
        // Everything below timestamp_begin_id is disabled.
        assert!(row[0].is_infinite());
        assert!(row[(TS_BEGIN - 1) as usize].is_infinite());
        // The allowed initial window is untouched.
        assert_eq!(row[TS_BEGIN as usize], 0.0);
        assert_eq!(row[(TS_BEGIN + 50) as usize], 0.0);
        // Beyond the clamp, timestamps are disabled again.
        assert!(row[(TS_BEGIN + 51) as usize].is_infinite());
    }

    #[test]
    fn pair_closure_forces_text_or_eot() {
        let mut r = rules(50);
        let sb = 0;
        // step 2: previous two tokens are both timestamps (a closed pair).
        let sequences = vec![vec![TS_BEGIN, TS_BEGIN + 5]];
        let mut logits = vec![flat_row()];
        let mut disable = DisableTokens::new(1);
        r.apply(2, &mut logits, &mut disable, &sequences, &[0], &[sb]).unwrap();

        let row = &logits[0];
        assert!(row[TS_BEGIN as usize].is_infinite());
        assert!(row[TS_END as usize].is_infinite());
        // Text tokens remain open.
        assert_eq!(row[10], 0.0);
    }

    #[test]
    fn open_pair_forbids_text_until_next_timestamp_or_eot() {
        let mut r = rules(50);
        // step 1: only one prior token, and it's a timestamp -> open pair
        // (penultimate falls back to `last` itself per spec.md edge case).
        let sequences = vec![vec![TS_BEGIN]];
        let mut logits = vec![flat_row()];
        let mut disable = DisableTokens::new(1);
        r.apply(1, &mut logits, &mut disable, &sequences, &[0], &[0]).unwrap();

        let row = &logits[0];
        assert!(row[10].is_infinite(), "text tokens before eot must be disabled");
        assert_eq!(row[EOT as usize], 0.0, "eot must remain selectable");
    }

    #[test]
    fn monotonicity_forbids_decreasing_timestamps() {
        let mut r = rules(50);
        // Most recent timestamp in history is TS_BEGIN + 10; timestamps
        // below it must now be disabled for the *next* step regardless of
        // whether we're in an open or closed pair.
        let sequences = vec![vec![TS_BEGIN + 10, 3, 4]];
        let mut logits = vec![flat_row()];
        let mut disable = DisableTokens::new(1);
        r.apply(3, &mut logits, &mut disable, &sequences, &[0], &[0]).unwrap();

        let row = &logits[0];
        assert!(row[TS_BEGIN as usize].is_infinite());
        assert!(row[(TS_BEGIN + 9) as usize].is_infinite());
        assert_eq!(row[(TS_BEGIN + 10) as usize], 0.0, "t itself is not disabled, only ids below it");
    }

    #[test]
    fn mass_check_forces_timestamp_when_timestamp_mass_dominates() {
        let mut r = rules(50);
        let sequences = vec![vec![5, 6]]; // last token is text -> marked for mass check
        let mut logits = vec![flat_row()];
        // Make the timestamp region overwhelmingly likely.
        for v in logits[0][TS_BEGIN as usize..=TS_END as usize].iter_mut() {
            *v = 20.0;
        }
        let mut disable = DisableTokens::new(1);
        r.apply(2, &mut logits, &mut disable, &sequences, &[0], &[0]).unwrap();

        let row = &logits[0];
        assert!(row[0].is_infinite(), "mass check should force a timestamp-only step");
    }

    #[test]
    fn mass_check_does_not_fire_when_text_dominates() {
        let mut r = rules(50);
        let sequences = vec![vec![5, 6]];
        let mut logits = vec![flat_row()];
        logits[0][42] = 20.0; // one text token is overwhelmingly likely
        let mut disable = DisableTokens::new(1);
        r.apply(2, &mut logits, &mut disable, &sequences, &[0], &[0]).unwrap();

        assert_eq!(logits[0][42], 20.0, "dominant text token must survive");
    }

    #[test]
    fn no_timestamps_token_is_always_disabled() {
        let mut r = rules(50);
        let sequences = vec![vec![5]];
        let mut logits = vec![flat_row()];
        let mut disable = DisableTokens::new(1);
        r.apply(1, &mut logits, &mut disable, &sequences, &[0], &[0]).unwrap();
        assert!(logits[0][NO_TIMESTAMPS as usize].is_infinite());
    }

    #[test]
    fn defensive_clamp_when_initial_index_exceeds_range() {
        // max_initial_timestamp_id would exceed timestamp_end_id; the
        // constructor must clamp rather than panic or produce an inverted
        // range.
        let r = rules(usize::from(u16::MAX));
        assert!(r.max_initial_timestamp_id <= TS_END);
    }
}
