use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::{Device, IndexOp, Tensor};

use gpt2_core::CausalLm;
use tokenizer::{BPE, END_OF_TEXT};

use crate::sampling::{Sampler, SamplingParams};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub prompt: String,
    /// Independent samples to draw.
    pub entry_count: usize,
    /// Maximum tokens appended to the prompt per sample.
    pub entry_length: usize,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompt: "<|sentence|>".to_string(),
            entry_count: 10,
            entry_length: 100,
            sampling: SamplingParams::default(),
            seed: None,
        }
    }
}

/// Tokens of one sample, prompt included.
#[derive(Debug, Clone)]
pub struct GenerationTrace {
    tokens: Vec<i64>,
    finished: bool,
}

impl GenerationTrace {
    fn new(prompt_ids: &[i64]) -> Self {
        Self {
            tokens: prompt_ids.to_vec(),
            finished: false,
        }
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    /// Whether the model produced the end-of-text token itself.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decodes the trace; a sample cut off by the length cap gets an explicit
    /// end marker.
    pub fn into_text(self, tokenizer: &BPE) -> String {
        let ids: Vec<u32> = self.tokens.iter().map(|&id| id as u32).collect();
        let text = tokenizer.decode(&ids);
        if self.finished {
            text
        } else {
            format!("{}{}", text, END_OF_TEXT)
        }
    }
}

/// Autoregressive nucleus sampling over a borrowed, frozen model.
pub struct Generator<'a, M: CausalLm> {
    model: &'a M,
    tokenizer: &'a BPE,
    device: Device,
    eos_token_id: i64,
    rng: StdRng,
}

impl<'a, M: CausalLm> Generator<'a, M> {
    pub fn new(model: &'a M, tokenizer: &'a BPE, device: Device) -> Result<Self> {
        Ok(Self {
            model,
            tokenizer,
            device,
            eos_token_id: i64::from(tokenizer.eos_token_id()?),
            rng: StdRng::from_entropy(),
        })
    }

    /// Makes sampling reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Draws `entry_count` samples continuing `prompt`, in order.
    pub fn generate(
        &mut self,
        prompt: &str,
        entry_count: usize,
        entry_length: usize,
        params: &SamplingParams,
    ) -> Result<Vec<String>> {
        params.validate()?;
        let prompt_ids: Vec<i64> = self
            .tokenizer
            .encode(prompt)
            .into_iter()
            .map(i64::from)
            .collect();
        anyhow::ensure!(!prompt_ids.is_empty(), "prompt {:?} encodes to no tokens", prompt);

        let mut generated = Vec::with_capacity(entry_count);
        for entry_idx in 0..entry_count {
            let trace = self.generate_trace(&prompt_ids, entry_length, params)?;
            tracing::debug!(
                entry = entry_idx,
                tokens = trace.tokens().len(),
                finished = trace.is_finished(),
                "sample done"
            );
            generated.push(trace.into_text(self.tokenizer));
        }

        Ok(generated)
    }

    pub fn generate_trace(
        &mut self,
        prompt_ids: &[i64],
        entry_length: usize,
        params: &SamplingParams,
    ) -> Result<GenerationTrace> {
        let _guard = tch::no_grad_guard();
        let context = self.model.max_positions().max(1) as usize;
        let mut trace = GenerationTrace::new(prompt_ids);

        for _ in 0..entry_length {
            // Only the most recent positions fit the model
            let window = &trace.tokens[trace.tokens.len().saturating_sub(context)..];
            let input = Tensor::from_slice(window)
                .view([1, window.len() as i64])
                .to(self.device);

            let logits = self.model.forward_t(&input, None, false).logits;
            let next_token_logits = logits.i((0, -1, ..));
            let next_token = Sampler::sample(&next_token_logits, params, &mut self.rng)?;

            trace.tokens.push(next_token);
            if next_token == self.eos_token_id {
                trace.finished = true;
                break;
            }
        }

        Ok(trace)
    }
}
