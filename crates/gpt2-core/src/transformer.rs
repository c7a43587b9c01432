use tch::{nn, nn::Module, Kind, Tensor};

use crate::attention::CausalSelfAttention;
use crate::config::ModelConfig;
use crate::lm::{lm_loss, CausalLm, LmOutput};

/// GPT-2's transposed linear layer: weight is stored as [n_in, n_out], which
/// is the layout of the published checkpoints.
#[derive(Debug)]
pub struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    pub fn new(vs: &nn::Path, n_in: i64, n_out: i64) -> Self {
        let weight = vs.var("weight", &[n_in, n_out], nn::Init::Randn { mean: 0.0, stdev: 0.02 });
        let bias = vs.var("bias", &[n_out], nn::Init::Const(0.0));
        Self { weight, bias }
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.matmul(&self.weight) + &self.bias
    }
}

/// FeedForward block (MLP)
pub struct MLP {
    c_fc: Conv1D,
    c_proj: Conv1D,
    dropout: f64,
}

impl MLP {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let n_embd = config.n_embd;
        let n_hidden = 4 * n_embd;

        Self {
            c_fc: Conv1D::new(&(vs / "c_fc"), n_embd, n_hidden),
            c_proj: Conv1D::new(&(vs / "c_proj"), n_hidden, n_embd),
            dropout: config.dropout,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        // gelu_new in the reference implementation is the tanh approximation
        self.c_proj
            .forward(&self.c_fc.forward(x).gelu("tanh"))
            .dropout(self.dropout, train)
    }
}

/// Transformer Block
pub struct Block {
    ln_1: nn::LayerNorm,
    attn: CausalSelfAttention,
    ln_2: nn::LayerNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let ln_config = nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        };

        Self {
            ln_1: nn::layer_norm(vs / "ln_1", vec![config.n_embd], ln_config),
            attn: CausalSelfAttention::new(&(vs / "attn"), config),
            ln_2: nn::layer_norm(vs / "ln_2", vec![config.n_embd], ln_config),
            mlp: MLP::new(&(vs / "mlp"), config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let x = x + self.attn.forward_t(&x.apply(&self.ln_1), train);
        let mlp_out = self.mlp.forward_t(&x.apply(&self.ln_2), train);
        x + mlp_out
    }
}

/// GPT-2 language model with the LM head tied to the token embedding.
///
/// Variable names follow the published checkpoints (`wte.weight`,
/// `h.0.attn.c_attn.weight`, ...) so pretrained weights load by name.
pub struct Gpt2Model {
    wte: nn::Embedding,
    wpe: nn::Embedding,
    blocks: Vec<Block>,
    ln_f: nn::LayerNorm,
    pub config: ModelConfig,
}

impl Gpt2Model {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let emb_config = nn::EmbeddingConfig {
            ws_init: nn::Init::Randn { mean: 0.0, stdev: 0.02 },
            ..Default::default()
        };
        let wte = nn::embedding(vs / "wte", config.vocab_size, config.n_embd, emb_config);
        let wpe = nn::embedding(vs / "wpe", config.n_positions, config.n_embd, emb_config);

        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&(vs / "h" / i), config))
            .collect();

        let ln_f = nn::layer_norm(
            vs / "ln_f",
            vec![config.n_embd],
            nn::LayerNormConfig {
                eps: config.layer_norm_epsilon,
                ..Default::default()
            },
        );

        Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config: config.clone(),
        }
    }

    /// idx: [batch, seq_len] token ids, seq_len <= n_positions.
    /// Returns logits [batch, seq_len, vocab_size].
    pub fn logits(&self, idx: &Tensor, train: bool) -> Tensor {
        let t = idx.size()[1];
        let pos = Tensor::arange(t, (Kind::Int64, idx.device()));

        let mut x = (idx.apply(&self.wte) + pos.apply(&self.wpe))
            .dropout(self.config.embd_pdrop, train);

        for block in &self.blocks {
            x = block.forward_t(&x, train);
        }

        x.apply(&self.ln_f).matmul(&self.wte.ws.transpose(0, 1))
    }
}

impl CausalLm for Gpt2Model {
    fn forward_t(&self, input_ids: &Tensor, labels: Option<&Tensor>, train: bool) -> LmOutput {
        let logits = self.logits(input_ids, train);

        let loss = labels.map(|labels| lm_loss(&logits, labels));
        LmOutput { loss, logits }
    }

    fn max_positions(&self) -> i64 {
        self.config.n_positions
    }
}
