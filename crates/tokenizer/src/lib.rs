pub mod byte_level;
pub mod error;
pub mod vocab;
pub mod bpe;

pub use bpe::{BPE, END_OF_TEXT};
pub use vocab::Vocab;
pub use error::TokenizerError;
