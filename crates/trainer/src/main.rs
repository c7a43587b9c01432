use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tch::Device;

use inference::Generator;
use trainer::{Corpus, FinetuneConfig, Trainer};

#[derive(Parser)]
#[command(author, version, about = "Fine-tune GPT-2 on a line-per-example corpus", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "configs/finetune.yaml")]
    config: PathBuf,

    /// Skip sampling once training is over
    #[arg(long)]
    no_generate: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = FinetuneConfig::load(&cli.config)?;
    config.validate()?;

    let device = Device::cuda_if_available();
    log::info!("Using device: {:?}", device);

    // 1. Tokenizer and pretrained weights
    let mut tokenizer = config.model.load_tokenizer()?;
    let tag = config.corpus.control_tag();
    if tokenizer.vocab().contains(&tag) {
        tokenizer.add_special_token(&tag)?;
    }
    let lm = config.model.load_model(device)?;

    // 2. Data
    let corpus = Corpus::load(&config.corpus, &tokenizer)?;

    // 3. Train
    let mut trainer = Trainer::new(lm, config.trainer.clone())?;
    let report = trainer.train(&corpus)?;
    for path in report.checkpoints() {
        println!("Checkpoint: {}", path.display());
    }
    println!("Training complete!");

    // 4. Sample from the fine-tuned model
    if cli.no_generate {
        return Ok(());
    }
    let lm = trainer.into_model();
    let generation = &config.generation;
    let mut generator = Generator::new(&lm, &tokenizer, device)?;
    if let Some(seed) = generation.seed {
        generator = generator.with_seed(seed);
    }
    let texts = generator.generate(
        &generation.prompt,
        generation.entry_count,
        generation.entry_length,
        &generation.sampling,
    )?;
    for (i, text) in texts.iter().enumerate() {
        println!("Sentence {}: {}", i, text);
    }

    Ok(())
}
