use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hyperparameters of a GPT-2 checkpoint, read from the `config.json` shipped
/// with pretrained weights. Unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Dimension of the token embeddings (and internal transformer states).
    pub n_embd: i64,
    /// Number of attention heads.
    pub n_head: i64,
    /// Number of transformer layers.
    pub n_layer: i64,
    /// Size of the vocabulary.
    pub vocab_size: i64,
    /// Number of learned positions, i.e. the longest sequence the model accepts.
    pub n_positions: i64,
    #[serde(alias = "resid_pdrop")]
    pub dropout: f64,
    pub attn_pdrop: f64,
    pub embd_pdrop: f64,
    pub layer_norm_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_embd: 768, // GPT-2 small
            n_head: 12,
            n_layer: 12,
            vocab_size: 50257,
            n_positions: 1024,
            dropout: 0.1,
            attn_pdrop: 0.1,
            embd_pdrop: 0.1,
            layer_norm_epsilon: 1e-5,
        }
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.n_embd / self.n_head
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config at {:?}", path))?;
        let config: ModelConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config at {:?}", path))?;
        anyhow::ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            config.n_embd,
            config.n_head
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hugging_face_gpt2_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "architectures": ["GPT2LMHeadModel"],
                "n_ctx": 1024,
                "n_positions": 1024,
                "n_embd": 768,
                "n_head": 12,
                "n_layer": 12,
                "resid_pdrop": 0.1,
                "vocab_size": 50257
            }"#,
        )
        .unwrap();

        let config = ModelConfig::load(&path).unwrap();
        assert_eq!(config.n_positions, 1024);
        assert_eq!(config.head_size(), 64);
        assert_eq!(config.layer_norm_epsilon, 1e-5);
    }

    #[test]
    fn rejects_uneven_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"n_embd": 10, "n_head": 3}"#).unwrap();
        assert!(ModelConfig::load(&path).is_err());
    }
}
