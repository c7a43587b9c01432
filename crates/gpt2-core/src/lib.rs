pub mod attention;
pub mod config;
pub mod lm;
pub mod safetensors_util;
pub mod transformer;

pub use config::ModelConfig;
pub use lm::{lm_loss, CausalLm, LmOutput, PretrainedLm, IGNORE_INDEX};
pub use transformer::Gpt2Model;
