use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Index;
use std::path::PathBuf;

use tokenizer::{BPE, END_OF_TEXT};

use crate::error::ConfigError;

/// Entries kept when `truncate` is set.
pub const TRUNCATED_LEN: usize = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Domain tag, written into every example as `<|control_code|>`.
    pub control_code: String,
    pub train_files: Vec<PathBuf>,
    /// Keep only the first 20,000 examples.
    pub truncate: bool,
    /// Characters kept from each line, line terminator included.
    pub max_length: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            control_code: "sentence".to_string(),
            train_files: Vec::new(),
            truncate: false,
            max_length: 768,
        }
    }
}

impl CorpusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_code.is_empty() {
            return Err(ConfigError::EmptyControlCode);
        }
        if self.max_length == 0 {
            return Err(ConfigError::Zero { name: "max_length" });
        }
        if self.train_files.is_empty() {
            return Err(ConfigError::NoTrainFiles);
        }
        if let Some(missing) = self.train_files.iter().find(|path| !path.is_file()) {
            return Err(ConfigError::MissingTrainFile(missing.clone()));
        }
        Ok(())
    }

    /// The prompt that starts an example of this domain.
    pub fn control_tag(&self) -> String {
        format!("<|{}|>", self.control_code)
    }
}

/// Token ids of one annotated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence(Vec<i64>);

impl TokenSequence {
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for TokenSequence {
    fn from(ids: Vec<u32>) -> Self {
        Self(ids.into_iter().map(i64::from).collect())
    }
}

/// Ordered training examples, one per input line, in file-list then line
/// order.
#[derive(Debug, Clone)]
pub struct Corpus {
    sequences: Vec<TokenSequence>,
}

impl Corpus {
    pub fn load(config: &CorpusConfig, tokenizer: &BPE) -> Result<Self> {
        config.validate()?;
        let tag = config.control_tag();
        let mut sequences = Vec::new();

        for path in &config.train_files {
            let file = File::open(path)
                .with_context(|| format!("Failed to open training file {:?}", path))?;
            let before = sequences.len();

            // Lines keep their terminator, which counts towards `max_length`
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            loop {
                line.clear();
                let read = reader
                    .read_line(&mut line)
                    .with_context(|| format!("Failed to read {:?}", path))?;
                if read == 0 {
                    break;
                }
                let text: String = line.chars().take(config.max_length).collect();
                let example = format!("{}{}{}", tag, text, END_OF_TEXT);
                sequences.push(TokenSequence::from(tokenizer.encode(&example)));
            }

            log::info!("Read {} examples from {:?}", sequences.len() - before, path);
        }

        if config.truncate {
            sequences.truncate(TRUNCATED_LEN);
        }

        log::info!("Corpus holds {} examples", sequences.len());
        Ok(Self { sequences })
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TokenSequence> {
        self.sequences.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenSequence> {
        self.sequences.iter()
    }
}

impl Index<usize> for Corpus {
    type Output = TokenSequence;

    fn index(&self, index: usize) -> &TokenSequence {
        &self.sequences[index]
    }
}
