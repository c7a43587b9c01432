use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use inference::{GenerationConfig, ModelSource};

use crate::corpus::CorpusConfig;
use crate::TrainerConfig;

/// Everything one fine-tuning run needs, read from a single YAML file.
///
/// ```yaml
/// model:
///   pretrained_dir: models/gpt2
/// corpus:
///   control_code: sentence
///   train_files: [data/train.txt]
/// trainer:
///   epochs: 4
/// generation:
///   entry_count: 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    pub model: ModelSource,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl FinetuneConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.corpus.validate()?;
        self.trainer.validate()?;
        self.generation.sampling.validate()?;
        Ok(())
    }
}
