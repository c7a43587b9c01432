use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Logits are divided by this; values <= 0 leave them unscaled.
    pub temperature: f64,
    /// Nucleus mass, in (0, 1].
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.8,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            "top_p must lie in (0, 1], got {}",
            self.top_p
        );
        Ok(())
    }
}

pub struct Sampler;

impl Sampler {
    /// Sets every logit outside the nucleus to -inf.
    ///
    /// Tokens are ranked by probability; a token is dropped once the mass of
    /// the tokens ranked before it already exceeds `top_p`. The most likely
    /// token always survives.
    /// logits: [vocab_size] tensor.
    pub fn top_p_filter(logits: &Tensor, top_p: f64) -> Tensor {
        let (sorted_logits, sorted_indices) = logits.sort(-1, true);
        let cumulative_probs = sorted_logits
            .softmax(-1, Kind::Float)
            .cumsum(-1, Kind::Float);

        let to_remove = cumulative_probs.gt(top_p);
        let n = to_remove.size()[0];
        let keep_first = Tensor::zeros(&[1], (Kind::Bool, to_remove.device()));
        let to_remove = Tensor::cat(&[keep_first, to_remove.narrow(0, 0, n - 1)], 0);

        let removed_ids = sorted_indices.masked_select(&to_remove);
        logits.index_fill(0, &removed_ids, f64::NEG_INFINITY)
    }

    /// Sample a token ID from logits.
    /// logits: [vocab_size] tensor.
    pub fn sample<R: Rng>(logits: &Tensor, params: &SamplingParams, rng: &mut R) -> anyhow::Result<i64> {
        let _guard = tch::no_grad_guard();

        let temperature = if params.temperature > 0.0 { params.temperature } else { 1.0 };
        let scaled_logits = logits.to_kind(Kind::Float) / temperature;

        let filtered = Self::top_p_filter(&scaled_logits, params.top_p);
        let probs = filtered
            .softmax(-1, Kind::Float)
            .to_kind(Kind::Double)
            .to_device(Device::Cpu);
        let probs_vec: Vec<f64> = Vec::<f64>::try_from(&probs)?;

        let dist = rand::distributions::WeightedIndex::new(&probs_vec)
            .map_err(|e| anyhow::anyhow!("WeightedIndex error: {}", e))?;
        Ok(dist.sample(rng) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn logits_of(probs: &[f32]) -> Tensor {
        Tensor::from_slice(probs).log()
    }

    fn kept(filtered: &Tensor) -> Vec<i64> {
        let finite = filtered.isfinite().nonzero().view([-1]);
        Vec::<i64>::try_from(&finite).unwrap()
    }

    #[test]
    fn token_crossing_the_threshold_is_kept() {
        let logits = logits_of(&[0.15, 0.5, 0.05, 0.3]);
        // cumulative over the ranking 1, 3, 0, 2: 0.5, 0.8, 0.95, 1.0
        assert_eq!(kept(&Sampler::top_p_filter(&logits, 0.6)), vec![1, 3]);
        assert_eq!(kept(&Sampler::top_p_filter(&logits, 0.85)), vec![0, 1, 3]);
    }

    #[test]
    fn nucleus_always_holds_the_most_likely_token() {
        let logits = Tensor::from_slice(&[0.3f32, -1.2, 2.5, 0.0, 1.1, -0.4, 2.4, 0.9]);
        for top_p in [1e-9, 0.05, 0.3, 0.5, 0.8, 0.99, 1.0] {
            let kept = kept(&Sampler::top_p_filter(&logits, top_p));
            assert!(!kept.is_empty(), "empty nucleus for top_p {}", top_p);
            assert!(kept.contains(&2), "argmax dropped for top_p {}", top_p);
        }
    }

    #[test]
    fn tiny_top_p_is_greedy() {
        let mut rng = StdRng::seed_from_u64(3);
        let logits = Tensor::from_slice(&[0.1f32, 0.2, 0.4, 0.3]);
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1e-6,
        };
        for _ in 0..20 {
            assert_eq!(Sampler::sample(&logits, &params, &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn non_positive_temperature_leaves_logits_unscaled() {
        let mut rng = StdRng::seed_from_u64(11);
        // Dividing by -1 would make token 0 the favourite instead
        let logits = Tensor::from_slice(&[0.0f32, 5.0]);
        for temperature in [0.0, -1.0] {
            let params = SamplingParams {
                temperature,
                top_p: 0.5,
            };
            assert_eq!(Sampler::sample(&logits, &params, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn wide_nucleus_samples_every_token_eventually() {
        let mut rng = StdRng::seed_from_u64(5);
        let logits = Tensor::from_slice(&[0.0f32, 0.0, 0.0]);
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.99,
        };

        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[Sampler::sample(&logits, &params, &mut rng).unwrap() as usize] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn top_p_outside_unit_interval_is_invalid() {
        assert!(SamplingParams { top_p: 0.0, ..Default::default() }.validate().is_err());
        assert!(SamplingParams { top_p: 1.5, ..Default::default() }.validate().is_err());
        assert!(SamplingParams::default().validate().is_ok());
    }
}
