use anyhow::{Context, Result};
use std::path::Path;
use tch::{Device, Kind, Tensor};

use gpt2_core::{CausalLm, IGNORE_INDEX};
use tokenizer::BPE;

/// Sliding-window perplexity of `token_ids`.
///
/// Window `k` ends at `min((k + 1) * stride, n)` and reaches back up to
/// `max_positions` tokens. Only its last `stride` tokens are scored; the ones
/// before them are context already scored by an earlier window.
pub fn perplexity<M: CausalLm>(
    model: &M,
    token_ids: &[i64],
    stride: usize,
    device: Device,
) -> Result<f64> {
    anyhow::ensure!(stride > 0, "stride must be positive");
    anyhow::ensure!(
        token_ids.len() >= 2,
        "need at least two tokens to score, got {}",
        token_ids.len()
    );

    let _guard = tch::no_grad_guard();
    let max_length = model.max_positions().max(2) as usize;
    let seq_len = token_ids.len();
    if stride > max_length {
        tracing::warn!(stride, max_length, "stride exceeds the model context, clamping");
    }
    let stride = stride.min(max_length);

    let mut nll_sum = 0.0;
    let mut scored = 0usize;

    for i in (0..seq_len).step_by(stride) {
        let begin = (i + stride).saturating_sub(max_length);
        let end = (i + stride).min(seq_len);
        let trg_len = end - i;
        let window = &token_ids[begin..end];
        // A lone token has nothing to predict
        if window.len() < 2 {
            continue;
        }

        let input = Tensor::from_slice(window)
            .view([1, window.len() as i64])
            .to(device);
        let labels = input.copy();
        let context = (window.len() - trg_len) as i64;
        if context > 0 {
            let _ = labels.narrow(1, 0, context).fill_(IGNORE_INDEX);
        }

        let loss = model
            .forward_t(&input, Some(&labels), false)
            .loss
            .context("model returned no loss for labelled input")?;
        nll_sum += loss.to_kind(Kind::Double).double_value(&[]) * trg_len as f64;
        scored += trg_len;
    }

    anyhow::ensure!(scored > 0, "no tokens were scored");
    let ppl = (nll_sum / scored as f64).exp();
    tracing::info!(tokens = seq_len, scored, ppl, "perplexity");
    Ok(ppl)
}

/// Perplexity of a whole text file, encoded as one token stream.
pub fn perplexity_of_file<M: CausalLm, P: AsRef<Path>>(
    model: &M,
    tokenizer: &BPE,
    path: P,
    stride: usize,
    device: Device,
) -> Result<f64> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read evaluation file {:?}", path))?;
    let token_ids: Vec<i64> = tokenizer.encode(&text).into_iter().map(i64::from).collect();
    perplexity(model, &token_ids, stride, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpt2_core::{lm_loss, LmOutput, ModelConfig, PretrainedLm};

    /// Spreads mass evenly over the vocabulary.
    struct Uniform {
        vocab_size: i64,
        max_positions: i64,
    }

    impl CausalLm for Uniform {
        fn forward_t(&self, input_ids: &Tensor, labels: Option<&Tensor>, _train: bool) -> LmOutput {
            let t = input_ids.size()[1];
            let logits = Tensor::zeros(&[1, t, self.vocab_size], (Kind::Float, Device::Cpu));
            let loss = labels.map(|labels| lm_loss(&logits, labels));
            LmOutput { loss, logits }
        }

        fn max_positions(&self) -> i64 {
            self.max_positions
        }
    }

    #[test]
    fn uniform_model_scores_the_vocabulary_size() {
        let model = Uniform {
            vocab_size: 10,
            max_positions: 8,
        };
        let tokens: Vec<i64> = (0..20).map(|i| i % 10).collect();
        let ppl = perplexity(&model, &tokens, 5, Device::Cpu).unwrap();
        assert!((ppl - 10.0).abs() < 1e-4, "got {}", ppl);
    }

    #[test]
    fn stride_longer_than_the_context_is_clamped() {
        let model = Uniform {
            vocab_size: 4,
            max_positions: 3,
        };
        let tokens = vec![0, 1, 2, 3, 0, 1, 2];
        let ppl = perplexity(&model, &tokens, 10, Device::Cpu).unwrap();
        assert!((ppl - 4.0).abs() < 1e-4);
    }

    #[test]
    fn single_token_is_rejected() {
        let model = Uniform {
            vocab_size: 4,
            max_positions: 3,
        };
        assert!(perplexity(&model, &[1], 1, Device::Cpu).is_err());
        assert!(perplexity(&model, &[1, 2], 0, Device::Cpu).is_err());
    }

    #[test]
    fn text_file_yields_finite_perplexity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval.txt");
        std::fs::write(&path, "the cat sat on the mat\nthe dog sat too\n").unwrap();

        let bpe = BPE::byte_level(&[]).unwrap();
        let config = ModelConfig {
            n_embd: 16,
            n_head: 2,
            n_layer: 1,
            vocab_size: bpe.vocab().len() as i64,
            n_positions: 16,
            ..Default::default()
        };
        let lm = PretrainedLm::random(&config, Device::Cpu);
        let ppl = perplexity_of_file(&lm, &bpe, &path, 8, Device::Cpu).unwrap();
        assert!(ppl.is_finite() && ppl > 1.0);
    }
}
