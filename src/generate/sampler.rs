use crate::core::{Result, TokenId, VlmError};
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    /// `0.0` selects the arg-max token.
    pub temperature: f32,
    pub top_p: f32,
    /// `1.0` disables the penalty.
    pub repetition_penalty: f32,
    /// Window of most recent generated tokens the penalty looks at.
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
    pub logprobs: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            repeat_last_n: 64,
            seed: None,
            logprobs: false,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub logprob: Option<f32>,
}

pub struct Sampler {
    params: SamplingParams,
    processor: LogitsProcessor,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let seed = params.seed.unwrap_or_else(rand::random);
        let sampling = if params.is_greedy() {
            Sampling::ArgMax
        } else if params.top_p > 0.0 && params.top_p < 1.0 {
            Sampling::TopP {
                p: params.top_p as f64,
                temperature: params.temperature as f64,
            }
        } else {
            Sampling::All {
                temperature: params.temperature as f64,
            }
        };
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            params,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Picks the next token from `[vocab]` logits. `history` is every token
    /// generated so far in this request.
    pub fn sample(&mut self, logits: &Tensor, history: &[TokenId]) -> Result<SampledToken> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        let penalized = if self.params.repetition_penalty != 1.0 && !history.is_empty() {
            let start = history.len().saturating_sub(self.params.repeat_last_n);
            let window: Vec<u32> = history[start..].iter().map(|t| t.0).collect();
            candle_transformers::utils::apply_repeat_penalty(&logits, self.params.repetition_penalty, &window)?
        } else {
            logits
        };
        self.select(&penalized)
    }

    pub fn sample_slice(&mut self, logits: &[f32]) -> Result<SampledToken> {
        let logits = Tensor::new(logits, &Device::Cpu)?;
        self.select(&logits)
    }

    fn select(&mut self, logits: &Tensor) -> Result<SampledToken> {
        let values = logits.to_vec1::<f32>()?;
        if values.is_empty() {
            return Err(VlmError::InvalidLogits("empty logits".to_string()));
        }
        if let Some(i) = values.iter().position(|l| !l.is_finite()) {
            return Err(VlmError::InvalidLogits(format!("non-finite logit at index {}", i)));
        }

        // candle's arg-max keeps the last of equal maxima
        let index = if self.params.is_greedy() {
            argmax(&values)
        } else {
            self.processor.sample(logits)? as usize
        };

        let logprob = if self.params.logprobs {
            let scaled = if self.params.is_greedy() {
                logits.clone()
            } else {
                (logits / self.params.temperature as f64)?
            };
            let logprobs = candle_nn::ops::log_softmax(&scaled, D::Minus1)?;
            Some(logprobs.get(index)?.to_scalar::<f32>()?)
        } else {
            None
        };

        Ok(SampledToken {
            token: TokenId(index as u32),
            logprob,
        })
    }
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_greedy_prefers_first_of_ties() {
        let mut sampler = Sampler::new(SamplingParams::greedy());
        let token = sampler.sample_slice(&[0.1, 3.0, 3.0, -1.0]).unwrap();
        assert_eq!(token.token, TokenId(1));
        assert!(token.logprob.is_none());
    }

    #[test]
    fn test_non_finite_logits_rejected() {
        let mut sampler = Sampler::new(SamplingParams::greedy());
        let err = sampler.sample_slice(&[0.0, f32::NAN]).unwrap_err();
        assert!(matches!(err, VlmError::InvalidLogits(_)));
        assert!(sampler.sample_slice(&[]).is_err());
    }

    #[test]
    fn test_repetition_penalty_applied_before_selection() {
        let params = SamplingParams {
            repetition_penalty: 4.0,
            ..SamplingParams::greedy()
        };
        let mut sampler = Sampler::new(params);
        let logits = Tensor::new(&[1.0f32, 2.0, 1.5], &Device::Cpu).unwrap();

        // token 1 was just generated; 2.0 / 4.0 drops below 1.5
        let token = sampler.sample(&logits, &[TokenId(1)]).unwrap();
        assert_eq!(token.token, TokenId(2));

        // outside the window the penalty does not apply
        let params = SamplingParams {
            repetition_penalty: 4.0,
            repeat_last_n: 1,
            ..SamplingParams::greedy()
        };
        let mut sampler = Sampler::new(params);
        let token = sampler.sample(&logits, &[TokenId(1), TokenId(0)]).unwrap();
        assert_eq!(token.token, TokenId(1));
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.9,
            seed: Some(42),
            ..Default::default()
        };
        let logits = [0.5f32, 0.4, 0.3, 0.2, 0.1];

        let mut a = Sampler::new(params.clone());
        let mut b = Sampler::new(params);
        for _ in 0..20 {
            assert_eq!(a.sample_slice(&logits).unwrap(), b.sample_slice(&logits).unwrap());
        }
    }

    #[test]
    fn test_top_p_excludes_tail() {
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.5,
            seed: Some(7),
            ..Default::default()
        };
        let mut sampler = Sampler::new(params);
        let logits = [10.0f32, 0.0, 0.0, 0.0];
        for _ in 0..50 {
            assert_eq!(sampler.sample_slice(&logits).unwrap().token, TokenId(0));
        }
    }

    #[test]
    fn test_logprobs_reported() {
        let params = SamplingParams {
            logprobs: true,
            ..SamplingParams::greedy()
        };
        let mut sampler = Sampler::new(params);
        let token = sampler.sample_slice(&[1.0, 1.0]).unwrap();
        assert_eq!(token.token, TokenId(0));
        assert_relative_eq!(token.logprob.unwrap(), 0.5f32.ln(), epsilon = 1e-6);

        let params = SamplingParams {
            temperature: 0.5,
            seed: Some(3),
            logprobs: true,
            ..Default::default()
        };
        let mut sampler = Sampler::new(params);
        let token = sampler.sample_slice(&[2.0, 2.0, 2.0, 2.0]).unwrap();
        assert_relative_eq!(token.logprob.unwrap(), 0.25f32.ln(), epsilon = 1e-5);
    }
}
