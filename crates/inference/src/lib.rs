use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

use gpt2_core::PretrainedLm;
use tokenizer::BPE;

pub mod generator;
pub mod perplexity;
pub mod sampling;

// Re-export common types
pub use generator::{GenerationConfig, GenerationTrace, Generator};
pub use perplexity::{perplexity, perplexity_of_file};
pub use sampling::{Sampler, SamplingParams};

/// Where the pretrained GPT-2 files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSource {
    /// Directory holding `config.json` and `model.safetensors`.
    pub pretrained_dir: PathBuf,
    /// Directory holding `vocab.json` and `merges.txt`; defaults to
    /// `pretrained_dir`.
    #[serde(default)]
    pub tokenizer_dir: Option<PathBuf>,
}

impl ModelSource {
    pub fn load_tokenizer(&self) -> Result<BPE> {
        let dir = self.tokenizer_dir.as_ref().unwrap_or(&self.pretrained_dir);
        BPE::from_pretrained_dir(dir)
            .with_context(|| format!("Failed to load tokenizer from {:?}", dir))
    }

    pub fn load_model(&self, device: Device) -> Result<PretrainedLm> {
        PretrainedLm::from_pretrained(&self.pretrained_dir, device)
    }
}

/// Pretrained model with the parameters of a fine-tuning checkpoint on top.
pub fn load_finetuned(pretrained_dir: &Path, checkpoint: &Path, device: Device) -> Result<PretrainedLm> {
    let mut lm = PretrainedLm::from_pretrained(pretrained_dir, device)?;
    lm.load_checkpoint(checkpoint)?;
    tracing::info!(?checkpoint, "loaded fine-tuned weights");
    Ok(lm)
}

/// Checkpoint `{prefix}-{epoch}.safetensors` in `dir` with the highest epoch.
/// A directory that does not exist yet holds no checkpoints.
pub fn latest_checkpoint(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list checkpoint directory {:?}", dir))
        }
    };

    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "safetensors") {
            continue;
        }
        let epoch = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|epoch| epoch.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
                latest = Some((epoch, path));
            }
        }
    }

    Ok(latest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_checkpoint_orders_epochs_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "spinoff-2.safetensors",
            "spinoff-10.safetensors",
            "spinoff-9.safetensors",
            "other-50.safetensors",
            "spinoff-11.bin",
            "config.json",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let latest = latest_checkpoint(dir.path(), "spinoff").unwrap();
        assert_eq!(latest, Some(dir.path().join("spinoff-10.safetensors")));
    }

    #[test]
    fn no_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_checkpoint(dir.path(), "spinoff").unwrap(), None);
    }

    #[test]
    fn missing_output_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let never_trained = dir.path().join("checkpoints");
        assert_eq!(latest_checkpoint(&never_trained, "spinoff").unwrap(), None);
    }

    #[test]
    fn tokenizer_dir_falls_back_to_pretrained_dir() {
        let source: ModelSource = serde_yaml::from_str("pretrained_dir: /models/gpt2\n").unwrap();
        assert!(source.tokenizer_dir.is_none());
        assert!(source.load_tokenizer().is_err());
    }
}
