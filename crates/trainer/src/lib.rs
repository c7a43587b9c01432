pub mod config;
pub mod corpus;
pub mod error;
pub mod packer;
pub mod schedule;
pub mod train;

pub use config::FinetuneConfig;
pub use corpus::{Corpus, CorpusConfig, TokenSequence};
pub use error::ConfigError;
pub use train::{EpochReport, Trainer, TrainingReport};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Packed blocks per optimizer step.
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Capacity of a packed block in tokens.
    pub max_seq_len: usize,
    pub warmup_steps: usize,
    /// Optimizer step at which the learning rate reaches zero. Without it the
    /// rate stays at `learning_rate` once warmup is over.
    pub total_steps: Option<usize>,
    pub weight_decay: f64,
    pub output_dir: String,
    pub output_prefix: String,
    pub save_model_on_epoch: bool,
    /// Seeds the per-epoch shuffle; entropy from the OS when absent.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 4,
            learning_rate: 2e-5,
            max_seq_len: 400,
            warmup_steps: 5000,
            total_steps: None,
            weight_decay: 0.0,
            output_dir: ".".to_string(),
            output_prefix: "wreckgar".to_string(),
            save_model_on_epoch: false,
            seed: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { name: "batch_size" });
        }
        if self.epochs == 0 {
            return Err(ConfigError::Zero { name: "epochs" });
        }
        if self.max_seq_len == 0 {
            return Err(ConfigError::Zero { name: "max_seq_len" });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::NotPositive {
                name: "learning_rate",
                value: self.learning_rate,
            });
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ConfigError::Negative {
                name: "weight_decay",
                value: self.weight_decay,
            });
        }
        Ok(())
    }
}
