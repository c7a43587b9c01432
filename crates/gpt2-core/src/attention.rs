use tch::{nn, nn::Module, IndexOp, Kind, Tensor};

use crate::config::ModelConfig;
use crate::transformer::Conv1D;

pub struct CausalSelfAttention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: i64,
    head_size: i64,
    attn_dropout: f64,
    resid_dropout: f64,
    /// Lower-triangular [1, 1, n_positions, n_positions] mask.
    bias: Tensor,
}

impl CausalSelfAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let n_embd = config.n_embd;
        let n_pos = config.n_positions;

        let c_attn = Conv1D::new(&(vs / "c_attn"), n_embd, 3 * n_embd);
        let c_proj = Conv1D::new(&(vs / "c_proj"), n_embd, n_embd);

        let bias = Tensor::ones(&[n_pos, n_pos], (Kind::Bool, vs.device()))
            .tril(0)
            .reshape(&[1, 1, n_pos, n_pos]);

        Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_size: config.head_size(),
            attn_dropout: config.attn_pdrop,
            resid_dropout: config.dropout,
            bias,
        }
    }

    /// x: [batch, seq_len, n_embd]
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let size = x.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let head_size = self.head_size;

        let qkv = self.c_attn.forward(x);
        let chunks = qkv.split(c, 2);
        let (q, k, v) = (&chunks[0], &chunks[1], &chunks[2]);

        let q = q.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let k = k.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let v = v.view([b, t, self.n_head, head_size]).transpose(1, 2);

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        let mask = self.bias.i((.., .., ..t, ..t));
        let att = att
            .masked_fill(&mask.logical_not(), f64::NEG_INFINITY)
            .softmax(-1, Kind::Float)
            .dropout(self.attn_dropout, train);

        let y = att
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, c]);
        self.c_proj.forward(&y).dropout(self.resid_dropout, train)
    }
}
