//! The logits-processor seam (§6.2) and its `DisableTokens` accumulator.
//!
//! This realizes the "LogitsProcessor trait" and "DisableTokens" collaborator
//! types that spec.md treats as externally supplied. No such generic,
//! Whisper-agnostic crate exists in this dependency stack, so the driver
//! defines them itself as the concrete seam `TimestampRules` and
//! `NoSpeechExtractor` plug into.

use crate::error::Result;
use std::ops::Range;

/// Per-beam-row accumulator of forbidden token ids for one decoding step.
///
/// Processors record *what* to forbid here rather than punching `-inf` into
/// the logits tensor themselves, so that multiple processors' decisions
/// compose as a union regardless of installation order. A processor that
/// also needs the effect of its own disables visible to itself within the
/// same step (`TimestampRules`'s mass check, see §4.4) applies them to its
/// local `logits` slice directly in addition to recording them here.
#[derive(Debug, Clone)]
pub struct DisableTokens {
    rows: Vec<Vec<Range<u32>>>,
}

impl DisableTokens {
    pub fn new(num_rows: usize) -> Self {
        Self {
            rows: vec![Vec::new(); num_rows],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Marks `[start, end)` as forbidden for `row`. A no-op for an empty or
    /// inverted range.
    pub fn disable_range(&mut self, row: usize, range: Range<u32>) {
        if range.start < range.end {
            self.rows[row].push(range);
        }
    }

    pub fn disable_id(&mut self, row: usize, id: u32) {
        self.disable_range(row, id..id + 1);
    }

    /// Applies every recorded disable for `row` to a vocabulary-sized logits
    /// slice, setting disabled positions to `-inf`.
    pub fn apply_to(&self, row: usize, logits_row: &mut [f32]) {
        for range in &self.rows[row] {
            let lo = range.start as usize;
            let hi = (range.end as usize).min(logits_row.len());
            if lo < hi {
                logits_row[lo..hi].fill(f32::NEG_INFINITY);
            }
        }
    }

    /// Ranges recorded for `row`, for tests and diagnostics.
    pub fn ranges(&self, row: usize) -> &[Range<u32>] {
        &self.rows[row]
    }
}

/// A logits processor installed into the beam-search loop.
///
/// `apply` is invoked once per decoding step with the logits for every
/// active beam row (`B' = B * beam_size`). Implementations that need to run
/// before masking processors (e.g. to read unmodified logits) report
/// `apply_first() == true`; the driver installs such processors first (see
/// Design Notes in DESIGN.md on ordering).
pub trait LogitsProcessor {
    fn apply_first(&self) -> bool {
        false
    }

    /// `logits[row]` is the length-`V` logits vector for beam row `row`.
    /// `sequences[row]` is that row's complete token history, prefix prompt
    /// included. `batch_offset[row]` gives the original batch index the row
    /// belongs to. `sample_begin[row]` is the step index at which free
    /// generation started for that row (derived from the prefix length, per
    /// spec.md §4.4) — positions before it belong to the prompt, not to
    /// generated text.
    fn apply(
        &mut self,
        step: usize,
        logits: &mut [Vec<f32>],
        disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        batch_offset: &[usize],
        sample_begin: &[usize],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_range_masks_only_requested_span() {
        let mut d = DisableTokens::new(1);
        d.disable_range(0, 2..5);
        let mut row = vec![1.0f32; 8];
        d.apply_to(0, &mut row);
        assert_eq!(row, vec![1.0, 1.0, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn disable_range_rejects_empty_and_inverted() {
        let mut d = DisableTokens::new(1);
        d.disable_range(0, 5..5);
        d.disable_range(0, 5..2);
        assert!(d.ranges(0).is_empty());
    }

    #[test]
    fn disable_id_is_single_width_range() {
        let mut d = DisableTokens::new(1);
        d.disable_id(0, 7);
        let mut row = vec![0.0f32; 10];
        d.apply_to(0, &mut row);
        assert!(row[7].is_infinite() && row[7] < 0.0);
        assert_eq!(row[6], 0.0);
        assert_eq!(row[8], 0.0);
    }
}
