//! C1 — `VocabularyAdapter`: resolves Whisper's special-token identifiers
//! from a loaded `tokenizers::Tokenizer` and classifies the model as
//! multilingual or English-only.
//!
//! Generalizes the teacher's inline token resolution in
//! `Decoder::new` (`transcription.rs`), which looked up `sot_token`,
//! `transcribe_token`, `eot_token`, `no_speech_token` and
//! `no_timestamps_token` by hand for a single decoder instance, into a
//! reusable, immutable adapter shared read-only across replicas.

use candle_transformers::models::whisper::{
    EOT_TOKEN, LANGUAGES, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SOT_TOKEN, TRANSCRIBE_TOKEN,
};
use tokenizers::Tokenizer;

use crate::error::{DriverError, Result};

/// Vocabulary size at which the released Whisper checkpoints switch from
/// English-only to multilingual tokenizers.
const MULTILINGUAL_VOCAB_SIZE: usize = 51865;

#[derive(Debug, Clone)]
pub struct VocabularyAdapter {
    tokenizer: Tokenizer,
    unk_id: u32,
    sot_id: u32,
    transcribe_id: u32,
    eot_id: u32,
    no_timestamps_id: u32,
    no_speech_id: u32,
    timestamp_begin_id: u32,
    timestamp_end_id: u32,
    is_multilingual: bool,
    /// Candidate language tokens available in this tokenizer, in the fixed
    /// order `candle_transformers`'s `LANGUAGES` table defines them.
    lang_ids: Vec<(u32, String)>,
}

impl VocabularyAdapter {
    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let vocab_size = tokenizer.get_vocab_size(true);
        let sot_id = require_token(&tokenizer, SOT_TOKEN)?;
        let transcribe_id = require_token(&tokenizer, TRANSCRIBE_TOKEN)?;
        let eot_id = require_token(&tokenizer, EOT_TOKEN)?;
        let no_timestamps_id = require_token(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let no_speech_id = NO_SPEECH_TOKENS
            .iter()
            .find_map(|tok| tokenizer.token_to_id(tok))
            .ok_or_else(|| {
                DriverError::invalid_argument("vocabulary has neither <|nospeech|> nor <|nocaptions|>")
            })?;
        let unk_id = tokenizer
            .token_to_id("<|unk|>")
            .or_else(|| tokenizer.token_to_id("<unk>"))
            .unwrap_or(0);

        let timestamp_begin_id = no_timestamps_id + 1;
        let timestamp_end_id = vocab_size.saturating_sub(1) as u32;
        let is_multilingual = vocab_size == MULTILINGUAL_VOCAB_SIZE;

        let lang_ids = LANGUAGES
            .iter()
            .filter_map(|(code, _name)| {
                tokenizer
                    .token_to_id(&format!("<|{code}|>"))
                    .map(|id| (id, (*code).to_string()))
            })
            .collect();

        Ok(Self {
            tokenizer,
            unk_id,
            sot_id,
            transcribe_id,
            eot_id,
            no_timestamps_id,
            no_speech_id,
            timestamp_begin_id,
            timestamp_end_id,
            is_multilingual,
            lang_ids,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Looks up a token string, returning the UNK id if it is not present.
    pub fn token_to_id(&self, token: &str) -> u32 {
        self.tokenizer.token_to_id(token).unwrap_or(self.unk_id)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }

    /// Encodes free text into ids without adding the tokenizer's own
    /// special tokens (Whisper prompts assemble special tokens explicitly).
    pub fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        self.tokenizer
            .encode(text, false)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| DriverError::Tokenizer(e.to_string()))
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| DriverError::Tokenizer(e.to_string()))
    }

    pub fn sot_id(&self) -> u32 {
        self.sot_id
    }
    pub fn transcribe_id(&self) -> u32 {
        self.transcribe_id
    }
    pub fn eot_id(&self) -> u32 {
        self.eot_id
    }
    pub fn no_timestamps_id(&self) -> u32 {
        self.no_timestamps_id
    }
    pub fn no_speech_id(&self) -> u32 {
        self.no_speech_id
    }
    pub fn timestamp_begin_id(&self) -> u32 {
        self.timestamp_begin_id
    }
    pub fn timestamp_end_id(&self) -> u32 {
        self.timestamp_end_id
    }
    pub fn is_multilingual(&self) -> bool {
        self.is_multilingual
    }
    pub fn lang_ids(&self) -> &[(u32, String)] {
        &self.lang_ids
    }
}

fn require_token(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| DriverError::invalid_argument(format!("no token id for {token}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Builds a tiny `WordLevel` tokenizer containing only the Whisper
    /// special tokens this module needs, plus a handful of plain words, so
    /// tests run with no network access.
    fn fake_tokenizer(multilingual: bool) -> Tokenizer {
        use tokenizers::models::wordlevel::WordLevel;

        let mut vocab: HashMap<String, u32> = HashMap::new();
        let mut next = 0u32;
        let mut push = |s: &str, vocab: &mut HashMap<String, u32>| {
            vocab.insert(s.to_string(), next);
            next += 1;
        };
        push(SOT_TOKEN, &mut vocab);
        push(EOT_TOKEN, &mut vocab);
        push(NO_TIMESTAMPS_TOKEN, &mut vocab);
        push("<|nospeech|>", &mut vocab);
        push("<|en|>", &mut vocab);
        push("<|transcribe|>", &mut vocab);
        push("hello", &mut vocab);
        push("world", &mut vocab);

        if multilingual {
            // Pad to the released multilingual vocab size so
            // `is_multilingual` resolves true, matching real checkpoints.
            while (next as usize) < 51865 {
                push(&format!("<|pad{next}|>"), &mut vocab);
            }
        }

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<|unk|>".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn resolves_special_tokens() {
        let adapter = VocabularyAdapter::new(fake_tokenizer(false)).unwrap();
        assert_eq!(adapter.sot_id(), adapter.token_to_id(SOT_TOKEN));
        assert_eq!(adapter.eot_id(), adapter.token_to_id(EOT_TOKEN));
        assert_eq!(adapter.no_speech_id(), adapter.token_to_id("<|nospeech|>"));
        assert_eq!(adapter.timestamp_begin_id(), adapter.no_timestamps_id() + 1);
    }

    #[test]
    fn unknown_token_falls_back_to_unk() {
        let adapter = VocabularyAdapter::new(fake_tokenizer(false)).unwrap();
        assert_eq!(adapter.token_to_id("<|definitely-not-present|>"), adapter.unk_id);
    }

    #[test]
    fn multilingual_flag_tracks_vocab_size() {
        let small = VocabularyAdapter::new(fake_tokenizer(false)).unwrap();
        assert!(!small.is_multilingual());

        let big = VocabularyAdapter::new(fake_tokenizer(true)).unwrap();
        assert!(big.is_multilingual());
    }

    #[test]
    fn lang_ids_only_contains_tokens_present_in_vocab() {
        let adapter = VocabularyAdapter::new(fake_tokenizer(false)).unwrap();
        assert!(adapter.lang_ids().iter().any(|(_, code)| code == "en"));
        assert_eq!(adapter.lang_ids().len(), 1);
    }
}
