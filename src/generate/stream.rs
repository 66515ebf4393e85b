use super::sampler::{Sampler, SamplingParams};
use crate::core::{KVCache, Result, TokenId, TokenStream, Tokenizer, VisionLanguageModel, VlmError};
use candle_core::Tensor;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared flag that stops a generation at its next step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    DecodeBudgetExceeded,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    /// Stop tokens on top of the model's own.
    pub stop_token_ids: Vec<TokenId>,
    pub cancel: CancellationToken,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: crate::envconfig::DEFAULT_MAX_TOKENS,
            sampling: SamplingParams::default(),
            stop_token_ids: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub stop_reason: StopReason,
    pub logprobs: Option<Vec<f32>>,
    pub prefill_tokens_per_sec: f64,
    pub decode_tokens_per_sec: f64,
}

impl GenerationOutput {
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

enum State {
    Prefill(Tensor),
    Decoding(TokenId),
    Stopped(StopReason),
    /// A forward pass or sampling step returned an error; no stop reason applies.
    Failed,
}

/// Lazily decodes one token per step and yields the text each step completes.
///
/// Each step holds the model's read lock only for its own forward pass, so
/// adapter swaps interleave between steps and never inside one.
pub struct GenerationStream {
    model: Arc<RwLock<Box<dyn VisionLanguageModel>>>,
    detokenizer: TokenStream,
    sampler: Sampler,
    cache: Box<dyn KVCache>,
    state: State,
    stop_tokens: HashSet<TokenId>,
    budget: usize,
    prompt_tokens: usize,
    generated: Vec<TokenId>,
    logprobs: Vec<f32>,
    cancel: CancellationToken,
    flushed: bool,
    prefill_time: Duration,
    decode_started: Option<Instant>,
    decode_time: Duration,
}

impl GenerationStream {
    /// `embeds` is the merged `[seq, hidden]` prompt. Fails with
    /// `ContextOverflow` when the prompt leaves no room to decode.
    pub fn new(
        model: Arc<RwLock<Box<dyn VisionLanguageModel>>>,
        tokenizer: Arc<dyn Tokenizer>,
        embeds: Tensor,
        context_length: usize,
        eos_token_ids: &[TokenId],
        options: GenerateOptions,
    ) -> Result<Self> {
        let prompt_tokens = embeds.dim(0)?;
        if prompt_tokens >= context_length {
            return Err(VlmError::ContextOverflow {
                requested: prompt_tokens + 1,
                capacity: context_length,
            });
        }
        let budget = options.max_tokens.min(context_length - prompt_tokens);

        let cache = model.read().new_cache(context_length);
        let stop_tokens = eos_token_ids
            .iter()
            .chain(options.stop_token_ids.iter())
            .copied()
            .collect();
        debug!(prompt_tokens, budget, "starting generation");

        Ok(Self {
            model,
            detokenizer: TokenStream::new(tokenizer),
            sampler: Sampler::new(options.sampling),
            cache,
            state: State::Prefill(embeds),
            stop_tokens,
            budget,
            prompt_tokens,
            generated: Vec::new(),
            logprobs: Vec::new(),
            cancel: options.cancel,
            flushed: false,
            prefill_time: Duration::ZERO,
            decode_started: None,
            decode_time: Duration::ZERO,
        })
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Why the stream ended. `None` while it is running or after it failed.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            State::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    pub fn generated_tokens(&self) -> &[TokenId] {
        &self.generated
    }

    /// Drains the stream and reports the whole generation.
    pub fn collect_output(mut self) -> Result<GenerationOutput> {
        for piece in self.by_ref() {
            piece?;
        }
        let stop_reason = self
            .stop_reason()
            .ok_or_else(|| VlmError::InvalidLogits("generation ended without a stop reason".to_string()))?;

        let per_sec = |tokens: usize, time: Duration| {
            let secs = time.as_secs_f64();
            if secs > 0.0 {
                tokens as f64 / secs
            } else {
                0.0
            }
        };
        Ok(GenerationOutput {
            text: self.detokenizer.text().to_string(),
            prompt_tokens: self.prompt_tokens,
            stop_reason,
            logprobs: self.sampler.params().logprobs.then(|| self.logprobs.clone()),
            prefill_tokens_per_sec: per_sec(self.prompt_tokens, self.prefill_time),
            decode_tokens_per_sec: per_sec(self.generated.len(), self.decode_time),
            tokens: self.generated,
        })
    }

    fn stop(&mut self, reason: StopReason) {
        if let Some(started) = self.decode_started.take() {
            self.decode_time = started.elapsed();
        }
        info!(
            tokens = self.generated.len(),
            reason = ?reason,
            decode_ms = self.decode_time.as_millis() as u64,
            "generation finished"
        );
        self.state = State::Stopped(reason);
    }

    /// One forward pass plus sampling. Returns the text the token completes.
    fn step(&mut self) -> Result<Option<String>> {
        if self.cancel.is_cancelled() {
            self.stop(StopReason::Cancelled);
            return Ok(None);
        }
        if self.generated.len() >= self.budget {
            self.stop(StopReason::DecodeBudgetExceeded);
            return Ok(None);
        }

        let logits = {
            let model = self.model.read();
            match &self.state {
                State::Prefill(embeds) => {
                    let started = Instant::now();
                    let logits = model.forward_embeds(embeds, 0, self.cache.as_mut())?;
                    self.prefill_time = started.elapsed();
                    self.decode_started = Some(Instant::now());
                    logits
                }
                State::Decoding(last) => {
                    let embeds = model.embed_tokens(&[*last])?;
                    let offset = self.prompt_tokens + self.generated.len() - 1;
                    model.forward_embeds(&embeds, offset, self.cache.as_mut())?
                }
                State::Stopped(_) | State::Failed => return Ok(None),
            }
        };

        let sampled = self.sampler.sample(&logits, &self.generated)?;
        if self.stop_tokens.contains(&sampled.token) {
            self.stop(StopReason::EndOfSequence);
            return Ok(None);
        }

        self.generated.push(sampled.token);
        if let Some(logprob) = sampled.logprob {
            self.logprobs.push(logprob);
        }
        self.state = State::Decoding(sampled.token);
        self.detokenizer.push(sampled.token)
    }
}

impl Iterator for GenerationStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let State::Failed = self.state {
                return None;
            }
            if let State::Stopped(_) = self.state {
                if self.flushed {
                    return None;
                }
                self.flushed = true;
                return match self.detokenizer.flush() {
                    Ok(Some(rest)) => Some(Ok(rest)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                };
            }

            match self.step() {
                Ok(Some(piece)) => return Some(Ok(piece)),
                Ok(None) => continue,
                Err(e) => {
                    if let Some(started) = self.decode_started.take() {
                        self.decode_time = started.elapsed();
                    }
                    warn!(tokens = self.generated.len(), error = %e, "generation failed");
                    self.state = State::Failed;
                    return Some(Err(e));
                }
            }
        }
    }
}
