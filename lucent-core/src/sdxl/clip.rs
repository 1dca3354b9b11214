//! CLIP text transformer used by both SDXL text encoders.
//!
//! The vocabulary size is part of the config so that fine-tunes can append
//! rows for their own special tokens.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    QuickGelu,
    Gelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Activation::Gelu => xs.gelu_erf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    /// Token used for padding, end-of-text when unset.
    pub pad_with: Option<String>,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub activation: Activation,
}

impl ClipTextConfig {
    /// CLIP ViT-L/14 text tower.
    pub fn sdxl() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            activation: Activation::QuickGelu,
        }
    }

    /// OpenCLIP ViT-bigG/14 text tower.
    pub fn sdxl2() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 1280,
            intermediate_size: 5120,
            max_position_embeddings: 77,
            pad_with: Some("!".to_string()),
            num_hidden_layers: 32,
            num_attention_heads: 20,
            activation: Activation::Gelu,
        }
    }
}

#[derive(Debug)]
struct ClipTextEmbeddings {
    token_embedding: Embedding,
    position_embedding: Embedding,
    position_ids: Tensor,
}

impl ClipTextEmbeddings {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> candle_core::Result<Self> {
        let token_embedding = embedding(c.vocab_size, c.embed_dim, vb.pp("token_embedding"))?;
        let position_embedding = embedding(
            c.max_position_embeddings,
            c.embed_dim,
            vb.pp("position_embedding"),
        )?;
        let position_ids =
            Tensor::arange(0u32, c.max_position_embeddings as u32, vb.device())?.unsqueeze(0)?;
        Ok(Self {
            token_embedding,
            position_embedding,
            position_ids,
        })
    }
}

impl Module for ClipTextEmbeddings {
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let seq_len = input_ids.dim(D::Minus1)?;
        let token_embedding = self.token_embedding.forward(input_ids)?;
        let position_ids = self.position_ids.narrow(1, 0, seq_len)?;
        let position_embedding = self.position_embedding.forward(&position_ids)?;
        token_embedding.broadcast_add(&position_embedding)
    }
}

#[derive(Debug)]
struct ClipAttention {
    k_proj: Linear,
    v_proj: Linear,
    q_proj: Linear,
    out_proj: Linear,
    head_dim: usize,
    scale: f64,
    num_attention_heads: usize,
}

impl ClipAttention {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> candle_core::Result<Self> {
        let embed_dim = c.embed_dim;
        let num_attention_heads = c.num_attention_heads;
        let head_dim = embed_dim / num_attention_heads;
        Ok(Self {
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            num_attention_heads,
        })
    }

    fn shape(&self, xs: &Tensor, seq_len: usize, bsz: usize) -> candle_core::Result<Tensor> {
        xs.reshape((bsz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, causal_attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let in_dtype = xs.dtype();
        let (bsz, seq_len, embed_dim) = xs.dims3()?;
        let heads = self.num_attention_heads;
        let proj_shape = (bsz * heads, seq_len, self.head_dim);

        let query_states = (self.q_proj.forward(xs)? * self.scale)?;
        let query_states = self
            .shape(&query_states, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;
        let key_states = self
            .shape(&self.k_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;
        let value_states = self
            .shape(&self.v_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;

        let attn_weights = query_states.matmul(&key_states.transpose(1, 2)?)?;
        let src_len = key_states.dim(1)?;
        let attn_weights = attn_weights
            .reshape((bsz, heads, seq_len, src_len))?
            .broadcast_add(causal_attention_mask)?
            .reshape((bsz * heads, seq_len, src_len))?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;

        let attn_output = attn_weights
            .matmul(&value_states)?
            .to_dtype(in_dtype)?
            .reshape((bsz, heads, seq_len, self.head_dim))?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, embed_dim))?;
        self.out_proj.forward(&attn_output)
    }
}

#[derive(Debug)]
struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl ClipMlp {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear(c.embed_dim, c.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(c.intermediate_size, c.embed_dim, vb.pp("fc2"))?,
            activation: c.activation,
        })
    }
}

impl Module for ClipMlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        self.fc2.forward(&self.activation.forward(&xs)?)
    }
}

#[derive(Debug)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: LayerNorm,
    mlp: ClipMlp,
    layer_norm2: LayerNorm,
}

impl ClipEncoderLayer {
    fn new(vb: VarBuilder, c: &ClipTextConfig) -> candle_core::Result<Self> {
        Ok(Self {
            self_attn: ClipAttention::new(vb.pp("self_attn"), c)?,
            layer_norm1: layer_norm(c.embed_dim, 1e-5, vb.pp("layer_norm1"))?,
            mlp: ClipMlp::new(vb.pp("mlp"), c)?,
            layer_norm2: layer_norm(c.embed_dim, 1e-5, vb.pp("layer_norm2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, causal_attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = self.self_attn.forward(&xs, causal_attention_mask)?;
        let xs = (xs + residual)?;

        let residual = &xs;
        let ys = self.layer_norm2.forward(&xs)?;
        let ys = self.mlp.forward(&ys)?;
        ys + residual
    }
}

#[derive(Debug)]
pub struct ClipTextTransformer {
    embeddings: ClipTextEmbeddings,
    layers: Vec<ClipEncoderLayer>,
}

impl ClipTextTransformer {
    /// Expects the `text_model.` prefix of a transformers checkpoint at `vb`.
    /// The final layer norm is never loaded since only penultimate hidden
    /// states are used.
    pub fn new(vb: VarBuilder, c: &ClipTextConfig) -> candle_core::Result<Self> {
        let vb = vb.pp("text_model");
        let embeddings = ClipTextEmbeddings::new(vb.pp("embeddings"), c)?;
        let vb_layers = vb.pp("encoder").pp("layers");
        let layers = (0..c.num_hidden_layers)
            .map(|index| ClipEncoderLayer::new(vb_layers.pp(index.to_string()), c))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    fn causal_attention_mask(bsz: usize, seq_len: usize, device: &Device) -> candle_core::Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::MIN } else { 0. }))
            .collect();
        Tensor::from_slice(&mask, (seq_len, seq_len), device)?.broadcast_as((bsz, 1, seq_len, seq_len))
    }

    /// Hidden states of the second to last encoder layer, `(batch, seq, dim)`.
    pub fn forward_penultimate(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (bsz, seq_len) = input_ids.dims2()?;
        let mask = Self::causal_attention_mask(bsz, seq_len, input_ids.device())?;
        let mut xs = self.embeddings.forward(input_ids)?;
        let used = self.layers.len().saturating_sub(1);
        for layer in &self.layers[..used] {
            xs = layer.forward(&xs, &mask)?;
        }
        Ok(xs)
    }
}
