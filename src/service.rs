//! C7 — `WhisperService`: a façade binding a pool of `WhisperDriver` replicas
//! to a request-dispatch pool, reusing the async runtime's blocking-thread
//! pool (`tokio::task::spawn_blocking`) rather than hand-rolling a worker
//! pool, exactly as the teacher's `actix-web` server already depends on
//! `tokio` for this purpose.

use std::sync::Arc;

use candle_core::Tensor;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::driver::{WhisperDriver, WhisperGenerationResult, WhisperOptions};
use crate::error::{DriverError, Result};
use crate::language::LanguageRanking;
use crate::vocabulary::VocabularyAdapter;

/// Prompts may be supplied pre-tokenized or as free text, realizing 4.6.2 vs
/// 4.6.3.
pub enum PromptInput {
    Ids(Vec<Vec<u32>>),
    Text(Vec<String>),
}

enum Job {
    Generate(Tensor, PromptInput, WhisperOptions, oneshot::Sender<Result<Vec<WhisperGenerationResult>>>),
    DetectLanguage(Tensor, oneshot::Sender<Result<Vec<LanguageRanking>>>),
}

/// Owns N replicas, each replica owning its own `WhisperDriver`. Decoder
/// state is exclusively owned by whichever replica picks up a request; model
/// weights and vocabulary were already shared read-only across replicas at
/// construction time (the caller builds each `WhisperDriver` from `Arc`-shared
/// weights before handing the set to `WhisperService::spawn`).
#[derive(Clone)]
pub struct WhisperService {
    sender: mpsc::UnboundedSender<Job>,
    is_multilingual: bool,
    /// Tokenizer-derived ids and decoding, snapshotted from the first
    /// replica at spawn time. Immutable and shared read-only, so this avoids
    /// a round trip through the replica pool just to build a prompt or
    /// render a hypothesis back to text.
    vocab: VocabularyAdapter,
}

impl WhisperService {
    /// Starts one background replica task per driver in `replicas`. Each
    /// task pulls jobs off a shared queue and executes them on the blocking
    /// pool, returning its driver to the loop afterward.
    pub fn spawn(replicas: Vec<WhisperDriver>) -> Self {
        let is_multilingual = replicas.first().map(|d| d.is_multilingual()).unwrap_or(false);
        let vocab = replicas
            .first()
            .expect("WhisperService::spawn requires at least one replica")
            .vocabulary()
            .clone();
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        for driver in replicas {
            tokio::spawn(replica_loop(driver, receiver.clone()));
        }
        Self { sender, is_multilingual, vocab }
    }

    pub fn is_multilingual(&self) -> bool {
        self.is_multilingual
    }

    pub fn sot_id(&self) -> u32 {
        self.vocab.sot_id()
    }

    pub fn transcribe_id(&self) -> u32 {
        self.vocab.transcribe_id()
    }

    pub fn no_timestamps_id(&self) -> u32 {
        self.vocab.no_timestamps_id()
    }

    pub fn decode_text(&self, ids: &[u32]) -> Result<String> {
        self.vocab.decode(ids, true)
    }

    pub async fn generate(&self, features: Tensor, prompts: PromptInput, options: WhisperOptions) -> Result<Vec<WhisperGenerationResult>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Job::Generate(features, prompts, options, reply_tx))
            .map_err(|_| DriverError::runtime("whisper service has shut down"))?;
        reply_rx.await.map_err(|_| DriverError::runtime("replica dropped the request before replying"))?
    }

    pub async fn detect_language(&self, features: Tensor) -> Result<Vec<LanguageRanking>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Job::DetectLanguage(features, reply_tx))
            .map_err(|_| DriverError::runtime("whisper service has shut down"))?;
        reply_rx.await.map_err(|_| DriverError::runtime("replica dropped the request before replying"))?
    }
}

async fn replica_loop(mut driver: WhisperDriver, receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        driver = match job {
            Job::Generate(features, prompts, options, reply) => {
                let outcome = tokio::task::spawn_blocking(move || {
                    let result = match prompts {
                        PromptInput::Ids(ids) => driver.generate(&features, &ids, &options),
                        PromptInput::Text(text) => driver.generate_from_text(&features, &text, &options),
                    };
                    (driver, result)
                })
                .await;
                match outcome {
                    Ok((driver, result)) => {
                        let _ = reply.send(result);
                        driver
                    }
                    Err(err) => {
                        log::error!("whisper replica panicked during generate: {err}");
                        return;
                    }
                }
            }
            Job::DetectLanguage(features, reply) => {
                let outcome = tokio::task::spawn_blocking(move || {
                    let result = driver.detect_language(&features);
                    (driver, result)
                })
                .await;
                match outcome {
                    Ok((driver, result)) => {
                        let _ = reply.send(result);
                        driver
                    }
                    Err(err) => {
                        log::error!("whisper replica panicked during detect_language: {err}");
                        return;
                    }
                }
            }
        };
    }
}
