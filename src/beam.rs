//! Realizes the "beam decoder" collaborator of §6.2:
//! `decode(decoder, state, start_tokens, eot_id, options) -> Vec<DecodingResult>`.
//!
//! No Whisper-agnostic beam-search crate exists in this dependency stack, so
//! this module builds one by generalizing the teacher's single-sequence
//! greedy/weighted-sampling loop (`transcription.rs::Decoder::decode`) from
//! one row to `B * beam_size` rows, adding repetition penalty, n-gram
//! blocking, length-penalized scoring and multi-hypothesis output.
//!
//! Every beam-search row is always represented in the flattened `B *
//! beam_size` row set for the whole call (rows never shrink the tensor
//! shape); a row that has finished or not yet been expanded into real
//! candidates is simply excluded from scoring, matching the fixed
//! `row = item * beam_size + k` layout `NoSpeechExtractor` depends on.
//!
//! Each forward call passes every row's complete token history (prefix
//! included), matching the teacher's own call
//! (`decoder.forward(&tokens_t, &audio_features, i == 0)`): the cache is
//! flushed only on the very first step, exactly as the teacher does, since
//! every later step's tokens tensor already carries everything the earlier
//! steps did plus the newly generated token.
//!
//! Every row within one call must share the same token-sequence length (a
//! `Tensor` needs a rectangular shape), so the caller is responsible for
//! grouping batch items with differing prompt lengths into separate calls
//! rather than padding them into one; this module assumes `start_tokens`
//! already arrives uniform-length and performs no padding of its own.

use candle_core::{DType, Tensor};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::SeedableRng;

use crate::error::Result;
use crate::model::WhisperModel;
use crate::processors::{DisableTokens, LogitsProcessor};

#[derive(Debug, Clone)]
pub struct BeamOptions {
    pub beam_size: usize,
    pub patience: f32,
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub sampling_topk: usize,
    pub sampling_temperature: f32,
    pub num_hypotheses: usize,
    pub max_new: usize,
    pub include_eos_in_hypotheses: bool,
    pub seed: u64,
}

impl Default for BeamOptions {
    fn default() -> Self {
        Self {
            beam_size: 5,
            patience: 1.0,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            sampling_topk: 1,
            sampling_temperature: 1.0,
            num_hypotheses: 1,
            max_new: 448,
            include_eos_in_hypotheses: false,
            seed: 299_792_458,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodingResult {
    pub hypotheses: Vec<Vec<u32>>,
    pub scores: Option<Vec<f32>>,
    pub token_scores: Option<Vec<Vec<f32>>>,
}

#[derive(Clone)]
struct Row {
    item: usize,
    tokens: Vec<u32>,
    logprob_sum: f32,
    token_logprobs: Vec<f32>,
    active: bool,
    finished: bool,
}

struct Finished {
    tokens: Vec<u32>,
    token_logprobs: Vec<f32>,
    score: f32,
}

fn length_penalized_score(logprob_sum: f32, len: usize, length_penalty: f32) -> f32 {
    let denom = ((5.0 + len as f32) / 6.0).powf(length_penalty);
    logprob_sum / denom
}

fn log_softmax_row(row: &[f32]) -> Vec<f32> {
    let m = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !m.is_finite() {
        return row.to_vec();
    }
    let sum: f32 = row.iter().map(|&x| (x - m).exp()).sum();
    let log_z = m + sum.ln();
    row.iter().map(|&x| x - log_z).collect()
}

fn apply_repetition_penalty(row: &mut [f32], tokens: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &tok in tokens {
        if let Some(v) = row.get_mut(tok as usize) {
            *v = if *v > 0.0 { *v / penalty } else { *v * penalty };
        }
    }
}

fn apply_no_repeat_ngram(row: &mut [f32], tokens: &[u32], n: usize) {
    if n == 0 || tokens.len() + 1 < n {
        return;
    }
    let prefix = &tokens[tokens.len() - (n - 1)..];
    for candidate in 0..row.len() {
        let mut ngram = prefix.to_vec();
        ngram.push(candidate as u32);
        let blocked = tokens
            .windows(n)
            .any(|w| w == ngram.as_slice());
        if blocked {
            row[candidate] = f32::NEG_INFINITY;
        }
    }
}

/// Picks `k` distinct token candidates from `logp` (already log-probabilities),
/// either greedily (highest log-prob first) or via weighted sampling
/// restricted to the top `sampling_topk` entries, mirroring the teacher's
/// `t > 0.0` weighted-sampling branch in `Decoder::decode`.
fn pick_candidates(
    logp: &[f32],
    k: usize,
    sampling_topk: usize,
    temperature: f32,
    rng: &mut rand::rngs::StdRng,
) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = logp.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if sampling_topk <= 1 || temperature <= 0.0 {
        ranked.into_iter().take(k).collect()
    } else {
        let pool_size = sampling_topk.min(ranked.len());
        let pool = &ranked[..pool_size];
        let weights: Vec<f32> = pool.iter().map(|&(_, lp)| (lp / temperature).exp()).collect();
        let mut chosen = Vec::with_capacity(k);
        let mut remaining: Vec<(usize, f32)> = pool.to_vec();
        let mut remaining_weights = weights;
        for _ in 0..k.min(pool.len()) {
            let dist = match WeightedIndex::new(&remaining_weights) {
                Ok(d) => d,
                Err(_) => break,
            };
            let pick = dist.sample(rng);
            chosen.push(remaining[pick]);
            remaining.remove(pick);
            remaining_weights.remove(pick);
        }
        chosen
    }
}

/// Runs beam search for a batch of `B` items, each already carrying its full
/// prompt history (prefix plus free-text suffix) in `start_tokens[i]`, all of
/// identical length. `sample_begin[i]` is the position index of that item's
/// first freely-generated token, i.e. `start_tokens[i].len()`.
#[allow(clippy::too_many_arguments)]
pub fn decode(
    model: &mut WhisperModel,
    memory: &Tensor,
    start_tokens: &[Vec<u32>],
    sample_begin: &[usize],
    eot_id: u32,
    options: &BeamOptions,
    processors: &mut [Box<dyn LogitsProcessor>],
) -> Result<Vec<DecodingResult>> {
    let b = start_tokens.len();
    let k = options.beam_size.max(1);

    let mut rows: Vec<Row> = Vec::with_capacity(b * k);
    for (item, tokens) in start_tokens.iter().enumerate() {
        for slot in 0..k {
            rows.push(Row {
                item,
                tokens: tokens.clone(),
                logprob_sum: 0.0,
                token_logprobs: Vec::new(),
                active: slot == 0,
                finished: false,
            });
        }
    }

    let mut expanded = vec![false; b];
    let mut finished: Vec<Vec<Finished>> = vec![Vec::new(); b];
    let mut rng = rand::rngs::StdRng::seed_from_u64(options.seed);

    // apply_first processors must run before masking ones (§6.2).
    processors.sort_by_key(|p| !p.apply_first());

    for generated in 0..options.max_new.max(1) {
        if rows.iter().all(|r| r.finished) {
            break;
        }

        let step = rows[0].tokens.len();
        let n = rows.len();

        let flat_tokens: Vec<u32> = rows.iter().flat_map(|r| r.tokens.iter().copied()).collect();
        let device = memory.device();
        let tokens_tensor = Tensor::from_vec(flat_tokens, (n, step), device)?;

        let item_index: Vec<u32> = rows.iter().map(|r| r.item as u32).collect();
        let index = Tensor::from_vec(item_index, n, device)?;
        let memory_rows = memory.index_select(&index, 0)?;

        let hidden = model.decode_step(&tokens_tensor, &memory_rows, generated == 0)?;
        let logits = model.final_linear_last_step(&hidden)?;
        let mut logits_host: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;

        let sequences: Vec<Vec<u32>> = rows.iter().map(|r| r.tokens.clone()).collect();
        let batch_offset: Vec<usize> = rows.iter().map(|r| r.item).collect();
        let sample_begin_rows: Vec<usize> = rows.iter().map(|r| sample_begin[r.item]).collect();
        let mut disable = DisableTokens::new(n);
        for processor in processors.iter_mut() {
            processor.apply(step, &mut logits_host, &mut disable, &sequences, &batch_offset, &sample_begin_rows)?;
        }
        for row_idx in 0..n {
            disable.apply_to(row_idx, &mut logits_host[row_idx]);
        }

        for item in 0..b {
            if finished[item].len() >= options.num_hypotheses
                && rows[item * k..(item + 1) * k].iter().all(|r| r.finished)
            {
                continue;
            }

            if !expanded[item] {
                let row_idx = item * k;
                if rows[row_idx].finished {
                    continue;
                }
                let logp = log_softmax_row(&logits_host[row_idx]);
                let mut masked = logp.clone();
                apply_repetition_penalty(&mut masked, &rows[row_idx].tokens, options.repetition_penalty);
                apply_no_repeat_ngram(&mut masked, &rows[row_idx].tokens, options.no_repeat_ngram_size);
                let picks = pick_candidates(&masked, k, options.sampling_topk, options.sampling_temperature, &mut rng);
                let picks_len = picks.len();

                let base = rows[row_idx].clone();
                for (slot, (token, lp)) in picks.into_iter().enumerate() {
                    let mut new_row = base.clone();
                    new_row.tokens.push(token as u32);
                    new_row.logprob_sum += lp;
                    new_row.token_logprobs.push(lp);
                    new_row.active = true;
                    if token as u32 == eot_id {
                        finish_row(&new_row, &mut finished[item], options);
                        new_row.finished = true;
                    }
                    rows[item * k + slot] = new_row;
                }
                for slot in picks_len..k {
                    rows[item * k + slot].active = false;
                    rows[item * k + slot].finished = true;
                }
                expanded[item] = true;
                continue;
            }

            let mut candidates: Vec<(usize, usize, f32)> = Vec::new(); // (slot, token, new_logprob_sum)
            for slot in 0..k {
                let row_idx = item * k + slot;
                if rows[row_idx].finished || !rows[row_idx].active {
                    continue;
                }
                let logp = log_softmax_row(&logits_host[row_idx]);
                let mut masked = logp.clone();
                apply_repetition_penalty(&mut masked, &rows[row_idx].tokens, options.repetition_penalty);
                apply_no_repeat_ngram(&mut masked, &rows[row_idx].tokens, options.no_repeat_ngram_size);
                let picks = pick_candidates(&masked, k, options.sampling_topk, options.sampling_temperature, &mut rng);
                for (token, lp) in picks {
                    candidates.push((slot, token, rows[row_idx].logprob_sum + lp));
                }
            }
            candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

            let mut next_rows: Vec<Row> = Vec::with_capacity(k);
            for &(slot, token, _new_sum) in candidates.iter() {
                if next_rows.len() >= k {
                    break;
                }
                let parent = &rows[item * k + slot];
                let lp = log_softmax_row(&logits_host[item * k + slot])[token];
                let mut new_row = parent.clone();
                new_row.tokens.push(token as u32);
                new_row.logprob_sum += lp;
                new_row.token_logprobs.push(lp);
                if token as u32 == eot_id && !options.include_eos_in_hypotheses {
                    finish_row(&new_row, &mut finished[item], options);
                    new_row.finished = true;
                } else if new_row.tokens.len() - sample_begin[item] >= options.max_new {
                    finish_row(&new_row, &mut finished[item], options);
                    new_row.finished = true;
                }
                next_rows.push(new_row);
            }
            while next_rows.len() < k {
                let mut filler = rows[item * k].clone();
                filler.active = false;
                filler.finished = true;
                next_rows.push(filler);
            }
            for (slot, row) in next_rows.into_iter().enumerate() {
                rows[item * k + slot] = row;
            }

            // Patience-based early stop: once enough hypotheses are banked
            // relative to the configured patience multiplier, stop growing
            // this item's beams further.
            let target = ((k as f32) * options.patience).ceil() as usize;
            if finished[item].len() >= target.max(options.num_hypotheses) {
                for slot in 0..k {
                    rows[item * k + slot].finished = true;
                }
            }
        }
    }

    for item in 0..b {
        for slot in 0..k {
            let row = &rows[item * k + slot];
            if !row.finished || finished[item].iter().any(|f| f.tokens == row.tokens) {
                continue;
            }
            finish_row(row, &mut finished[item], options);
        }
    }

    let mut results = Vec::with_capacity(b);
    for item in 0..b {
        let mut hyps = finished[item].drain(..).collect::<Vec<_>>();
        hyps.sort_by(|a, b| b.score.total_cmp(&a.score));
        hyps.truncate(options.num_hypotheses.max(1));

        let hypotheses: Vec<Vec<u32>> = hyps.iter().map(|h| h.tokens[sample_begin[item]..].to_vec()).collect();
        let scores = Some(hyps.iter().map(|h| h.score).collect());
        let token_scores = Some(hyps.iter().map(|h| h.token_logprobs.clone()).collect());
        results.push(DecodingResult {
            hypotheses,
            scores,
            token_scores,
        });
    }
    Ok(results)
}

fn finish_row(row: &Row, bucket: &mut Vec<Finished>, options: &BeamOptions) {
    let score = length_penalized_score(row.logprob_sum, row.token_logprobs.len(), options.length_penalty);
    bucket.push(Finished {
        tokens: row.tokens.clone(),
        token_logprobs: row.token_logprobs.clone(),
        score,
    });
}
