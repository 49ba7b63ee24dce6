//! Llama-architecture decoder, including the linear RoPE scaling that
//! deepseek-coder checkpoints declare in their `config.json`.
// Adapted from
// https://github.com/huggingface/candle/blob/main/candle-transformers/src/models/llama.rs

use anyhow::bail;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::ops::{silu, softmax_last_dim};
use candle_nn::rotary_emb::rope;
use candle_nn::{embedding, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type", alias = "rope_type")]
    pub kind: String,
    pub factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Divisor applied to token positions before the rotary embedding.
    pub fn position_scale(&self) -> anyhow::Result<f64> {
        match &self.rope_scaling {
            None => Ok(1.0),
            Some(RopeScaling { kind, factor }) if kind == "linear" => {
                if *factor < 1.0 {
                    bail!("rope_scaling factor must be at least 1, got {factor}");
                }
                Ok(*factor)
            }
            Some(RopeScaling { kind, .. }) => bail!("Unsupported rope_scaling type '{kind}'"),
        }
    }
}

/// Per-request key/value history, one slot per layer.
pub struct Cache {
    kvs: Vec<Option<(Tensor, Tensor)>>,
}

impl Cache {
    /// Number of positions already processed.
    pub fn len(&self) -> usize {
        match self.kvs.first() {
            Some(Some((k, _))) => k.dims()[2],
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct RotaryTables {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryTables {
    fn new(cfg: &LlamaConfig, position_scale: f64, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?.reshape((1, head_dim / 2))?;
        let positions = Tensor::arange(0u32, cfg.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .affine(1.0 / position_scale, 0.0)?
            .reshape((cfg.max_position_embeddings, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        let cos = self.cos.narrow(0, index_pos, seq_len)?;
        let sin = self.sin.narrow(0, index_pos, seq_len)?;
        rope(x, &cos, &sin)
    }
}

/// `1` where query `i` (at absolute position `offset + i`) must not see key `j`.
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total = offset + seq_len;
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..total).map(move |j| u8::from(j > offset + i)))
        .collect();
    Tensor::from_slice(&mask, (seq_len, total), device)
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.shape().dims())?;
    mask.where_cond(&on_true, on_false)
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, cfg: &LlamaConfig) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let size_q = head_dim * cfg.num_attention_heads;
        let size_kv = head_dim * cfg.num_key_value_heads();
        Ok(Self {
            q_proj: linear_no_bias(cfg.hidden_size, size_q, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(cfg.hidden_size, size_kv, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(cfg.hidden_size, size_kv, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(size_q, cfg.hidden_size, vb.pp("o_proj"))?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        rotary: &RotaryTables,
        kv: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;
        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = rotary.apply(&q, index_pos)?;
        let k = rotary.apply(&k, index_pos)?;

        let (k, v) = match kv.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?,
                Tensor::cat(&[&prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        *kv = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;
        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = if seq_len == 1 {
            att
        } else {
            let mask = causal_mask(seq_len, index_pos, x.device())?.broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };
        let att = softmax_last_dim(&att)?;
        let y = att.matmul(&v)?.to_dtype(in_dtype)?;
        let y = y
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&y)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, cfg: &LlamaConfig) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (silu(&self.gate_proj.forward(x)?)? * self.up_proj.forward(x)?)?;
        self.down_proj.forward(&x)
    }
}

#[derive(Debug, Clone)]
struct Block {
    input_layernorm: RmsNorm,
    attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            attn: Attention::load(vb.pp("self_attn"), cfg)?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(vb.pp("mlp"), cfg)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        rotary: &RotaryTables,
        kv: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = (self.attn.forward(&x, index_pos, rotary, kv)? + residual)?;
        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        self.mlp.forward(&x)? + residual
    }
}

/// The weights are only read during a forward pass; all per-request state lives in [`Cache`].
#[derive(Debug, Clone)]
pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryTables,
    max_position_embeddings: usize,
}

impl Llama {
    pub fn load(vb: VarBuilder, cfg: &LlamaConfig) -> anyhow::Result<Self> {
        let position_scale = cfg.position_scale()?;
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| Block::load(vb.pp(format!("model.layers.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;
        let rotary = RotaryTables::new(cfg, position_scale, vb.dtype(), vb.device())?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            max_position_embeddings: cfg.max_position_embeddings,
        })
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    pub fn new_cache(&self) -> Cache {
        Cache {
            kvs: vec![None; self.layers.len()],
        }
    }

    /// Logits for the last position of `input` (shape `(batch, seq_len)`), as F32.
    pub fn forward(&self, input: &Tensor, index_pos: usize, cache: &mut Cache) -> Result<Tensor> {
        let (_b_sz, seq_len) = input.dims2()?;
        if index_pos + seq_len > self.max_position_embeddings {
            candle_core::bail!(
                "Position {} exceeds the model context of {} tokens",
                index_pos + seq_len,
                self.max_position_embeddings
            );
        }
        let mut x = self.embed_tokens.forward(input)?;
        for (layer, kv) in self.layers.iter().zip(cache.kvs.iter_mut()) {
            x = layer.forward(&x, index_pos, &self.rotary, kv)?;
        }
        let x = self.norm.forward(&x)?;
        let x = x.i((.., seq_len - 1, ..))?.contiguous()?;
        self.lm_head.forward(&x)?.to_dtype(DType::F32)
    }
}
