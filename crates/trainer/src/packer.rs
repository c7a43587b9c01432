//! Packs tokenized examples into training blocks of bounded length.

use tch::{Device, Tensor};

/// Token ids fed to one training forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBlock {
    tokens: Vec<i64>,
}

impl PackedBlock {
    /// Opens a block holding `seq`, cut to `max_len` tokens.
    pub fn start(seq: &[i64], max_len: usize) -> Self {
        if seq.len() > max_len {
            log::warn!(
                "Sequence of {} tokens exceeds the block capacity of {}, truncating",
                seq.len(),
                max_len
            );
        }
        Self {
            tokens: seq[..seq.len().min(max_len)].to_vec(),
        }
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// [1, len] tensor on `device`.
    pub fn to_tensor(&self, device: Device) -> Tensor {
        Tensor::from_slice(&self.tokens)
            .view([1, self.tokens.len() as i64])
            .to(device)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Packed<'a> {
    /// The block can take more sequences.
    Open(PackedBlock),
    /// `deferred` did not fit; `block` is unchanged and ready for training.
    Closed { block: PackedBlock, deferred: &'a [i64] },
}

/// Adds `new_seq` to `current`.
///
/// A sequence that fits is placed in front of the block, and the block's
/// first token is dropped: the result is `new_seq ++ current[1..]`.
pub fn pack(new_seq: &[i64], current: Option<PackedBlock>, max_len: usize) -> Packed<'_> {
    let Some(block) = current else {
        return Packed::Open(PackedBlock::start(new_seq, max_len));
    };

    if new_seq.len() + block.len() > max_len {
        return Packed::Closed {
            block,
            deferred: new_seq,
        };
    }

    let rest = block.tokens.get(1..).unwrap_or_default();
    let mut tokens = Vec::with_capacity(new_seq.len() + rest.len());
    tokens.extend_from_slice(new_seq);
    tokens.extend_from_slice(rest);
    Packed::Open(PackedBlock { tokens })
}
