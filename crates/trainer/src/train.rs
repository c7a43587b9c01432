use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use tch::{nn, nn::OptimizerConfig, Device};

use gpt2_core::{CausalLm, PretrainedLm};

use crate::corpus::Corpus;
use crate::error::ConfigError;
use crate::packer::{pack, Packed, PackedBlock};
use crate::schedule::LinearWarmup;
use crate::TrainerConfig;

#[derive(Debug, Clone, Default)]
pub struct EpochReport {
    pub epoch: usize,
    pub forward_passes: usize,
    pub optimizer_steps: usize,
    pub mean_loss: f64,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
}

impl TrainingReport {
    pub fn checkpoints(&self) -> impl Iterator<Item = &PathBuf> {
        self.epochs.iter().filter_map(|e| e.checkpoint.as_ref())
    }
}

/// Fine-tunes a causal LM on packed blocks with gradient accumulation.
///
/// Every forward pass consumes one packed block. Gradients of `batch_size`
/// consecutive passes are summed before the optimizer and the learning-rate
/// schedule advance. The count restarts every epoch and a trailing partial
/// batch is dropped, so an epoch of `n` passes takes `n / batch_size` steps.
pub struct Trainer {
    config: TrainerConfig,
    lm: PretrainedLm,
    optimizer: nn::Optimizer,
    schedule: LinearWarmup,
    rng: StdRng,
    device: Device,
}

impl Trainer {
    pub fn new(lm: PretrainedLm, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        if config.max_seq_len as i64 > lm.max_positions() {
            return Err(ConfigError::SequenceTooLong {
                max_seq_len: config.max_seq_len,
                n_positions: lm.max_positions(),
            }
            .into());
        }

        let mut optimizer = nn::AdamW {
            wd: config.weight_decay,
            eps: 1e-6,
            ..Default::default()
        }
        .build(&lm.vs, config.learning_rate)?;

        let schedule = LinearWarmup::new(config.learning_rate, config.warmup_steps, config.total_steps);
        optimizer.set_lr(schedule.current_lr());

        let rng = match config.seed {
            Some(seed) => {
                tch::manual_seed(seed as i64);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            device: lm.device(),
            config,
            lm,
            optimizer,
            schedule,
            rng,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Optimizer steps taken so far, across epochs.
    pub fn optimizer_steps(&self) -> usize {
        self.schedule.steps()
    }

    pub fn train(&mut self, corpus: &Corpus) -> Result<TrainingReport> {
        anyhow::ensure!(!corpus.is_empty(), "cannot train on an empty corpus");
        log::info!("Starting training with configuration: {:?}", self.config);

        let mut report = TrainingReport::default();
        for epoch in 0..self.config.epochs {
            log::info!("Training epoch {}", epoch);
            let mut epoch_report = self.train_epoch(epoch, corpus)?;

            if self.config.save_model_on_epoch {
                epoch_report.checkpoint = Some(self.save_checkpoint(epoch)?);
            }

            log::info!(
                "Epoch {} | passes {} | steps {} | mean loss {:.4}",
                epoch,
                epoch_report.forward_passes,
                epoch_report.optimizer_steps,
                epoch_report.mean_loss
            );
            report.epochs.push(epoch_report);
        }

        Ok(report)
    }

    /// Hands the fine-tuned model over for inference.
    pub fn into_model(self) -> PretrainedLm {
        self.lm
    }

    fn train_epoch(&mut self, epoch: usize, corpus: &Corpus) -> Result<EpochReport> {
        let mut order: Vec<usize> = (0..corpus.len()).collect();
        order.shuffle(&mut self.rng);

        let progress = ProgressBar::new(order.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")?
                .progress_chars("##-"),
        );

        // Leftovers of the previous epoch's partial batch
        self.optimizer.zero_grad();

        let mut report = EpochReport {
            epoch,
            ..Default::default()
        };
        let mut loss_sum = 0.0;
        let max_len = self.config.max_seq_len;
        let last = order.len() - 1;
        let mut block: Option<PackedBlock> = None;

        for (idx, &entry) in order.iter().enumerate() {
            progress.inc(1);

            let (ready, deferred) = match pack(corpus[entry].as_slice(), block.take(), max_len) {
                Packed::Open(open) if idx != last => {
                    block = Some(open);
                    continue;
                }
                Packed::Open(open) => (open, None),
                Packed::Closed { block: full, deferred } => (full, Some(deferred)),
            };

            loss_sum += self.accumulate(&ready, &mut report)?;
            progress.set_message(format!("{:.4}", loss_sum / report.forward_passes as f64));

            if let Some(deferred) = deferred {
                let seeded = PackedBlock::start(deferred, max_len);
                if idx == last {
                    loss_sum += self.accumulate(&seeded, &mut report)?;
                } else {
                    block = Some(seeded);
                }
            }
        }

        progress.finish_and_clear();
        report.mean_loss = loss_sum / report.forward_passes.max(1) as f64;
        Ok(report)
    }

    /// Forward and backward pass over one block; steps the optimizer when a
    /// full batch has been accumulated. Returns the block's loss.
    fn accumulate(&mut self, block: &PackedBlock, report: &mut EpochReport) -> Result<f64> {
        let input = block.to_tensor(self.device);
        let loss = self
            .lm
            .forward_t(&input, Some(&input), true)
            .loss
            .context("model returned no loss for a labelled batch")?;
        loss.backward();

        report.forward_passes += 1;
        if report.forward_passes % self.config.batch_size == 0 {
            self.optimizer.step();
            let lr = self.schedule.step();
            self.optimizer.set_lr(lr);
            self.optimizer.zero_grad();
            report.optimizer_steps += 1;
        }

        Ok(loss.double_value(&[]))
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.config.output_dir);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        }

        let path = dir.join(format!("{}-{}.safetensors", self.config.output_prefix, epoch));
        self.lm.save_checkpoint(&path)?;

        let config_json = serde_json::to_string_pretty(self.lm.config())?;
        std::fs::write(dir.join("config.json"), config_json)?;

        log::info!("Saved checkpoint to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusConfig;
    use gpt2_core::ModelConfig;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tokenizer::BPE;

    fn tiny_lm(tokenizer: &BPE) -> PretrainedLm {
        let config = ModelConfig {
            n_embd: 16,
            n_head: 2,
            n_layer: 1,
            vocab_size: tokenizer.vocab().len() as i64,
            n_positions: 64,
            dropout: 0.0,
            attn_pdrop: 0.0,
            embd_pdrop: 0.0,
            layer_norm_epsilon: 1e-5,
        };
        PretrainedLm::random(&config, Device::Cpu)
    }

    fn corpus_from(dir: &Path, lines: &[&str], tokenizer: &BPE) -> Corpus {
        let path = dir.join("train.txt");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        let config = CorpusConfig {
            control_code: "s".to_string(),
            train_files: vec![path],
            ..Default::default()
        };
        Corpus::load(&config, tokenizer).unwrap()
    }

    fn config(dir: &Path, batch_size: usize, max_seq_len: usize) -> TrainerConfig {
        TrainerConfig {
            batch_size,
            epochs: 1,
            learning_rate: 1e-3,
            max_seq_len,
            warmup_steps: 0,
            output_dir: dir.join("out").to_string_lossy().into_owned(),
            output_prefix: "spinoff".to_string(),
            save_model_on_epoch: true,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn three_lines_one_epoch_writes_one_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        let corpus = corpus_from(dir.path(), &["fish swim", "stars burn", "time flies"], &bpe);

        let mut trainer = Trainer::new(tiny_lm(&bpe), config(dir.path(), 1, 64)).unwrap();
        let report = trainer.train(&corpus).unwrap();

        assert_eq!(report.epochs.len(), 1);
        assert!(report.epochs[0].mean_loss.is_finite());

        let written: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "safetensors"))
            .collect();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].file_name(), "spinoff-0.safetensors");
        assert_eq!(report.checkpoints().count(), 1);
    }

    #[test]
    fn every_sequence_gets_its_own_block_when_capacity_is_tight() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        // Each example is tag + 3 + newline + end = 6 tokens; two never fit in 11
        let corpus = corpus_from(dir.path(), &["aaa", "bbb", "ccc", "ddd", "eee"], &bpe);

        let mut config = config(dir.path(), 2, 11);
        config.save_model_on_epoch = false;
        let mut trainer = Trainer::new(tiny_lm(&bpe), config).unwrap();
        let report = trainer.train(&corpus).unwrap();

        let epoch = &report.epochs[0];
        assert_eq!(epoch.forward_passes, 5);
        assert_eq!(epoch.optimizer_steps, 5 / 2);
        assert_eq!(trainer.optimizer_steps(), 2);
    }

    #[test]
    fn short_sequences_share_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        let lines = ["a", "b", "c", "d", "e", "f"];
        let corpus = corpus_from(dir.path(), &lines, &bpe);

        // 4-token examples; merging drops a token, so blocks grow 4, 7, 10
        let mut config = config(dir.path(), 1, 10);
        config.save_model_on_epoch = false;
        let mut trainer = Trainer::new(tiny_lm(&bpe), config).unwrap();
        let report = trainer.train(&corpus).unwrap();

        assert_eq!(report.epochs[0].forward_passes, 2);
        assert_eq!(report.epochs[0].optimizer_steps, 2);
    }

    #[test]
    fn step_count_is_floor_of_passes_over_batch_size_each_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        let lines: Vec<String> = (0..7).map(|i| format!("line {}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let corpus = corpus_from(dir.path(), &refs, &bpe);

        // 9-token examples never share a 17-token block
        let mut config = config(dir.path(), 3, 17);
        config.epochs = 2;
        config.save_model_on_epoch = false;
        let mut trainer = Trainer::new(tiny_lm(&bpe), config).unwrap();
        let report = trainer.train(&corpus).unwrap();

        for epoch in &report.epochs {
            assert_eq!(epoch.forward_passes, 7);
            assert_eq!(epoch.optimizer_steps, 2);
        }
        assert_eq!(trainer.optimizer_steps(), 4);
    }

    #[test]
    fn partial_batch_gradients_do_not_leak_into_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        let corpus = corpus_from(dir.path(), &["lonely line"], &bpe);

        // One pass per epoch never fills a batch of two, so parameters stay put
        let mut config = config(dir.path(), 2, 64);
        config.save_model_on_epoch = false;
        let mut trainer = Trainer::new(tiny_lm(&bpe), config).unwrap();
        let name = "h.0.mlp.c_fc.weight";

        let first = trainer.train_epoch(0, &corpus).unwrap();
        assert_eq!(first.optimizer_steps, 0);
        let leftover = trainer.lm.vs.variables()[name].grad().copy();
        assert!(leftover.abs().sum(tch::Kind::Double).double_value(&[]) > 0.0);

        trainer.train_epoch(1, &corpus).unwrap();
        let grad = trainer.lm.vs.variables()[name].grad();
        assert!(
            grad.allclose(&leftover, 1e-6, 1e-6, false),
            "second epoch accumulated on top of the first"
        );
    }

    #[test]
    fn parameters_change_after_a_step() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&["<|s|>"]).unwrap();
        let corpus = corpus_from(dir.path(), &["hello there"], &bpe);

        let lm = tiny_lm(&bpe);
        let before = lm.vs.variables()["h.0.mlp.c_fc.weight"].copy();

        let mut config = config(dir.path(), 1, 64);
        config.save_model_on_epoch = false;
        let mut trainer = Trainer::new(lm, config).unwrap();
        trainer.train(&corpus).unwrap();

        let lm = trainer.into_model();
        let variables = lm.vs.variables();
        assert!(!variables["h.0.mlp.c_fc.weight"].equal(&before));
    }

    #[test]
    fn block_longer_than_model_context_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bpe = BPE::byte_level(&[]).unwrap();
        let err = Trainer::new(tiny_lm(&bpe), config(dir.path(), 1, 65)).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::SequenceTooLong {
                max_seq_len: 65,
                n_positions: 64
            })
        );
    }
}
