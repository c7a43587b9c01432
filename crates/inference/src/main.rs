use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use tch::Device;

use gpt2_core::PretrainedLm;
use inference::{
    latest_checkpoint, load_finetuned, perplexity_of_file, GenerationConfig, Generator, ModelSource,
};

#[derive(Parser)]
#[command(author, version, about = "Sample from or evaluate a fine-tuned GPT-2", long_about = None)]
struct Cli {
    /// Fine-tuning YAML config; its `model`, `generation` and `trainer`
    /// sections are read.
    #[arg(short, long, default_value = "configs/finetune.yaml")]
    config: PathBuf,

    /// Checkpoint to load; defaults to the latest one in the trainer output
    /// directory. Pass `none` to use the pretrained weights as they are.
    #[arg(long)]
    checkpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Draw samples continuing a prompt
    Generate {
        /// Overrides `generation.prompt`
        #[arg(short, long)]
        prompt: Option<String>,

        /// Overrides `generation.entry_count`
        #[arg(short = 'n', long)]
        entry_count: Option<usize>,

        /// Overrides `generation.entry_length`
        #[arg(long)]
        entry_length: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Sliding-window perplexity of a text file
    Perplexity {
        file: PathBuf,

        #[arg(long, default_value_t = 512)]
        stride: usize,
    },
}

#[derive(Deserialize)]
struct CheckpointLocation {
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    #[serde(default = "default_output_prefix")]
    output_prefix: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_prefix() -> String {
    "wreckgar".to_string()
}

impl Default for CheckpointLocation {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            output_prefix: default_output_prefix(),
        }
    }
}

#[derive(Deserialize)]
struct RunConfig {
    model: ModelSource,
    #[serde(default)]
    generation: GenerationConfig,
    #[serde(default)]
    trainer: CheckpointLocation,
}

fn load_lm(cli: &Cli, config: &RunConfig, device: Device) -> Result<PretrainedLm> {
    let checkpoint = match cli.checkpoint.as_deref() {
        Some("none") => None,
        Some(path) => Some(PathBuf::from(path)),
        None => latest_checkpoint(&config.trainer.output_dir, &config.trainer.output_prefix)?,
    };

    match checkpoint {
        Some(path) => load_finetuned(&config.model.pretrained_dir, &path, device),
        None => {
            tracing::warn!("no fine-tuning checkpoint, sampling from pretrained weights");
            config.model.load_model(device)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let content = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config {:?}", cli.config))?;
    let config: RunConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", cli.config))?;

    let device = Device::cuda_if_available();
    tracing::info!(?device, "using device");

    let tokenizer = config.model.load_tokenizer()?;
    let lm = load_lm(&cli, &config, device)?;

    match &cli.command {
        Commands::Generate {
            prompt,
            entry_count,
            entry_length,
            seed,
        } => {
            let generation = &config.generation;
            let prompt = prompt.as_deref().unwrap_or(&generation.prompt);
            let entry_count = entry_count.unwrap_or(generation.entry_count);
            let entry_length = entry_length.unwrap_or(generation.entry_length);

            let mut generator = Generator::new(&lm, &tokenizer, device)?;
            if let Some(seed) = seed.or(generation.seed) {
                generator = generator.with_seed(seed);
            }

            let texts = generator.generate(prompt, entry_count, entry_length, &generation.sampling)?;
            for (i, text) in texts.iter().enumerate() {
                println!("Sentence {}: {}", i, text);
            }
        }
        Commands::Perplexity { file, stride } => {
            let ppl = perplexity_of_file(&lm, &tokenizer, file, *stride, device)?;
            println!("Perplexity: {:.4}", ppl);
        }
    }

    Ok(())
}
