use anyhow::{Context, Result};
use std::path::Path;
use tch::{nn, Device, Tensor};

use crate::config::ModelConfig;
use crate::safetensors_util::load_safetensors;
use crate::transformer::Gpt2Model;

/// Label value excluded from the language-modelling loss.
pub const IGNORE_INDEX: i64 = -100;

pub struct LmOutput {
    /// Mean next-token cross entropy, present when labels were given.
    pub loss: Option<Tensor>,
    /// [batch, seq_len, vocab_size]
    pub logits: Tensor,
}

/// Mean next-token cross entropy of `logits` [batch, seq_len, vocab] against
/// `labels` [batch, seq_len]; position `i` is scored on label `i + 1`.
pub fn lm_loss(logits: &Tensor, labels: &Tensor) -> Tensor {
    let size = logits.size();
    let (t, v) = (size[1], size[2]);
    let shift_logits = logits.narrow(1, 0, t - 1).reshape([-1, v]);
    let shift_labels = labels.narrow(1, 1, t - 1).reshape([-1]);
    shift_logits.cross_entropy_loss::<Tensor>(
        &shift_labels,
        None,
        tch::Reduction::Mean,
        IGNORE_INDEX,
        0.0,
    )
}

/// A causal language model: `forward(tokens, labels) -> (loss, logits)`.
///
/// Labels have the same shape as the inputs and are shifted internally, so
/// passing the input ids as labels trains next-token prediction.
pub trait CausalLm {
    fn forward_t(&self, input_ids: &Tensor, labels: Option<&Tensor>, train: bool) -> LmOutput;

    /// Longest sequence a single forward pass accepts.
    fn max_positions(&self) -> i64;
}

/// GPT-2 model together with the var store that owns its parameters.
pub struct PretrainedLm {
    pub vs: nn::VarStore,
    pub model: Gpt2Model,
}

impl PretrainedLm {
    /// Randomly initialised model, mostly for tests and smoke runs.
    pub fn random(config: &ModelConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let model = Gpt2Model::new(&vs.root(), config);
        Self { vs, model }
    }

    /// Loads `config.json` and `model.safetensors` from a pretrained GPT-2
    /// directory.
    pub fn from_pretrained<P: AsRef<Path>>(dir: P, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config = ModelConfig::load(dir.join("config.json"))?;
        let mut lm = Self::random(&config, device);

        let weights = dir.join("model.safetensors");
        let report = load_safetensors(&mut lm.vs, &weights)
            .with_context(|| format!("Failed to load pretrained weights from {:?}", weights))?;
        anyhow::ensure!(
            report.missing.is_empty(),
            "pretrained weights at {:?} lack {} model tensors, e.g. {}",
            weights,
            report.missing.len(),
            report.missing[0]
        );
        log::info!("Loaded {} pretrained tensors from {:?}", report.loaded, weights);

        Ok(lm)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.model.config
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Writes a parameter-only snapshot. The format follows the extension;
    /// `.safetensors` is what `load_checkpoint` reads back.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.vs
            .save(path)
            .with_context(|| format!("Failed to write checkpoint {:?}", path))
    }

    /// Overwrites every parameter from a snapshot written by `save_checkpoint`.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let report = load_safetensors(&mut self.vs, path)
            .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
        anyhow::ensure!(
            report.missing.is_empty() && report.unexpected.is_empty(),
            "checkpoint {:?} does not match the model: {} missing, {} unexpected tensors",
            path,
            report.missing.len(),
            report.unexpected.len()
        );
        Ok(())
    }
}

impl CausalLm for PretrainedLm {
    fn forward_t(&self, input_ids: &Tensor, labels: Option<&Tensor>, train: bool) -> LmOutput {
        self.model.forward_t(input_ids, labels, train)
    }

    fn max_positions(&self) -> i64 {
        self.model.max_positions()
    }
}
