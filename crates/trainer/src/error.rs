use std::path::PathBuf;
use thiserror::Error;

/// Invalid settings, reported before any data is loaded or trained on.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("no training files configured")]
    NoTrainFiles,

    #[error("training file not found: {0:?}")]
    MissingTrainFile(PathBuf),

    #[error("control code must not be empty")]
    EmptyControlCode,

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{name} must be a positive finite number, got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("{name} must be a non-negative finite number, got {value}")]
    Negative { name: &'static str, value: f64 },

    #[error("max_seq_len {max_seq_len} exceeds the model's {n_positions} positions")]
    SequenceTooLong { max_seq_len: usize, n_positions: i64 },
}
