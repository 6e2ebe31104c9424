//! Multilingual encoder-decoder transformer.
//!
//! Post-norm layout throughout: every sub-block is `norm(x + dropout(block(x)))`.
//! Token embeddings are scaled by `sqrt(d_model)` and summed with a fixed
//! sinusoidal position table. Embedding and output-projection tables are kept
//! per language in a [`LanguageTable`], which aliases a single table for all
//! languages when `shared_embeddings` is set.

use candle_core::{bail, DType, Device, Module, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder};

use super::config::ModelConfig;
use super::latent::{LatentBottleneck, LatentCode};

/// Score given to masked attention positions before softmax.
const MASK_FILL: f32 = -1e9;

// ── Per-language tables ─────────────────────────────────────────────────

/// Key used in weight names for a table entry: `shared` or the language id.
pub fn table_key(lang: Option<usize>) -> String {
    match lang {
        Some(l) => l.to_string(),
        None => "shared".to_string(),
    }
}

/// A table indexed by language id. Either every slot aliases one entry or each
/// slot owns its own.
#[derive(Debug, Clone)]
pub struct LanguageTable<T> {
    entries: Vec<T>,
    shared: bool,
}

impl<T: Clone> LanguageTable<T> {
    pub fn build<F>(n_langs: usize, shared: bool, mut make: F) -> Result<Self>
    where
        F: FnMut(Option<usize>) -> Result<T>,
    {
        let entries = if shared {
            let entry = make(None)?;
            vec![entry; n_langs]
        } else {
            (0..n_langs).map(|l| make(Some(l))).collect::<Result<Vec<_>>>()?
        };
        Ok(Self { entries, shared })
    }

    pub fn get(&self, lang: usize) -> Result<&T> {
        match self.entries.get(lang) {
            Some(entry) => Ok(entry),
            None => bail!("unknown language id {lang} (table has {})", self.entries.len()),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Weight names of the tables seeded from pretrained vectors for one table key.
pub fn embedding_weight_names(key: &str) -> [String; 3] {
    [
        format!("encoder.embed_tokens.{key}.weight"),
        format!("decoder.embed_tokens.{key}.weight"),
        format!("lm_head.{key}.weight"),
    ]
}

// ── Positional encoding ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// `[max_len, d_model]`: sin on even slots, cos on odd slots.
    table: Tensor,
    max_len: usize,
}

impl PositionalEncoding {
    pub fn new(d_model: usize, max_len: usize, dtype: DType, device: &Device) -> Result<Self> {
        let mut data = vec![0f32; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let angle = pos as f64 * 10000f64.powf(-(i as f64) / d_model as f64);
                data[pos * d_model + i] = angle.sin() as f32;
                if i + 1 < d_model {
                    data[pos * d_model + i + 1] = angle.cos() as f32;
                }
            }
        }
        let table = Tensor::from_vec(data, (max_len, d_model), device)?.to_dtype(dtype)?;
        Ok(Self { table, max_len })
    }

    /// Adds positions `0..len` to `xs` of shape `[B, len, d_model]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(1)?;
        if seq_len > self.max_len {
            bail!("sequence length {seq_len} exceeds max_len {}", self.max_len)
        }
        xs.broadcast_add(&self.table.narrow(0, 0, seq_len)?)
    }
}

// ── Attention ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    n_heads: usize,
    d_k: usize,
    scale: f64,
}

impl MultiHeadAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let d_k = config.d_k();
        Ok(Self {
            q_proj: candle_nn::linear(d, d, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(d, d, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(d, d, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear(d, d, vb.pp("o_proj"))?,
            n_heads: config.n_heads,
            d_k,
            scale: 1.0 / (d_k as f64).sqrt(),
        })
    }

    /// `[B, L, d_model] -> [B, heads, L, d_k]`
    fn split_heads(&self, xs: &Tensor, b_sz: usize, seq_len: usize) -> Result<Tensor> {
        xs.reshape((b_sz, seq_len, self.n_heads, self.d_k))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn check_mask(&self, mask: &Tensor, b_sz: usize, q_len: usize, k_len: usize) -> Result<()> {
        let dims = mask.dims();
        let ok = dims.len() == 4
            && (dims[0] == 1 || dims[0] == b_sz)
            && (dims[1] == 1 || dims[1] == self.n_heads)
            && (dims[2] == 1 || dims[2] == q_len)
            && dims[3] == k_len;
        if !ok {
            bail!(
                "attention mask {dims:?} does not broadcast to [{b_sz}, {}, {q_len}, {k_len}]",
                self.n_heads
            )
        }
        Ok(())
    }

    /// Scaled dot-product attention. `mask` is `U8`, 1 = visible; masked
    /// scores are filled before the softmax.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_sz, q_len, d_model) = query.dims3()?;
        let (k_b, k_len, _) = key.dims3()?;
        let (v_b, v_len, _) = value.dims3()?;
        if k_b != b_sz || v_b != b_sz || v_len != k_len {
            bail!(
                "attention inputs disagree: query {:?}, key {:?}, value {:?}",
                query.dims(),
                key.dims(),
                value.dims()
            )
        }

        let q = self.split_heads(&self.q_proj.forward(query)?, b_sz, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(key)?, b_sz, k_len)?;
        let v = self.split_heads(&self.v_proj.forward(value)?, b_sz, k_len)?;

        // [B, H, Q, K]
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let scores = match mask {
            Some(mask) => {
                self.check_mask(mask, b_sz, q_len, k_len)?;
                let mask = mask.broadcast_as(scores.shape())?;
                let fill = Tensor::new(MASK_FILL, scores.device())?
                    .to_dtype(scores.dtype())?
                    .broadcast_as(scores.shape())?;
                mask.where_cond(&scores, &fill)?
            }
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, q_len, d_model))?;
        self.o_proj.forward(&out)
    }
}

// ── Feed-forward ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FeedForward {
    w1: Linear,
    w2: Linear,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w1: candle_nn::linear(config.d_model, config.d_ff, vb.pp("w1"))?,
            w2: candle_nn::linear(config.d_ff, config.d_model, vb.pp("w2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.w2.forward(&self.w1.forward(xs)?.relu()?)
    }
}

// ── Layers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: MultiHeadAttention,
    ffn: FeedForward,
    attn_norm: LayerNorm,
    ffn_norm: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            ffn: FeedForward::new(config, vb.pp("ffn"))?,
            attn_norm: candle_nn::layer_norm(config.d_model, eps, vb.pp("attn_norm"))?,
            ffn_norm: candle_nn::layer_norm(config.d_model, eps, vb.pp("ffn_norm"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(&self, xs: &Tensor, src_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let attn = self.self_attn.forward(xs, xs, xs, src_mask)?;
        let xs = self.attn_norm.forward(&(xs + self.dropout.forward(&attn, train)?)?)?;
        let ff = self.ffn.forward(&xs)?;
        self.ffn_norm.forward(&(&xs + self.dropout.forward(&ff, train)?)?)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ffn: FeedForward,
    self_attn_norm: LayerNorm,
    cross_attn_norm: LayerNorm,
    ffn_norm: LayerNorm,
    dropout: Dropout,
}

impl DecoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(config, vb.pp("cross_attn"))?,
            ffn: FeedForward::new(config, vb.pp("ffn"))?,
            self_attn_norm: candle_nn::layer_norm(config.d_model, eps, vb.pp("self_attn_norm"))?,
            cross_attn_norm: candle_nn::layer_norm(config.d_model, eps, vb.pp("cross_attn_norm"))?,
            ffn_norm: candle_nn::layer_norm(config.d_model, eps, vb.pp("ffn_norm"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        src_mask: Option<&Tensor>,
        tgt_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let attn = self.self_attn.forward(xs, xs, xs, tgt_mask)?;
        let xs = self.self_attn_norm.forward(&(xs + self.dropout.forward(&attn, train)?)?)?;

        let attn = self.cross_attn.forward(&xs, memory, memory, src_mask)?;
        let xs = self.cross_attn_norm.forward(&(&xs + self.dropout.forward(&attn, train)?)?)?;

        let ff = self.ffn.forward(&xs)?;
        self.ffn_norm.forward(&(&xs + self.dropout.forward(&ff, train)?)?)
    }
}

// ── Stacks ──────────────────────────────────────────────────────────────

fn embedding_table(config: &ModelConfig, vb: VarBuilder) -> Result<LanguageTable<Embedding>> {
    LanguageTable::build(config.n_langs(), config.shared_embeddings, |lang| {
        let vocab_size = config.vocab_size(lang.unwrap_or(0))?;
        candle_nn::embedding(vocab_size, config.d_model, vb.pp(table_key(lang)))
    })
}

#[derive(Debug, Clone)]
pub struct Encoder {
    embed_tokens: LanguageTable<Embedding>,
    positions: PositionalEncoding,
    layers: Vec<EncoderLayer>,
    dropout: Dropout,
    emb_scale: f64,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding_table(config, vb.pp("embed_tokens"))?;
        let positions = PositionalEncoding::new(config.d_model, config.max_len, vb.dtype(), vb.device())?;
        let layers_vb = vb.pp("layers");
        let layers = (0..config.n_layers)
            .map(|i| EncoderLayer::new(config, layers_vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            positions,
            layers,
            dropout: Dropout::new(config.dropout),
            emb_scale: (config.d_model as f64).sqrt(),
        })
    }

    /// `[B, S]` token ids -> `[B, S, d_model]`.
    pub fn forward(&self, tokens: &Tensor, src_mask: Option<&Tensor>, lang: usize, train: bool) -> Result<Tensor> {
        let xs = (self.embed_tokens.get(lang)?.forward(tokens)? * self.emb_scale)?;
        let mut xs = self.dropout.forward(&self.positions.forward(&xs)?, train)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, src_mask, train)?;
        }
        Ok(xs)
    }

    pub fn embeddings(&self) -> &LanguageTable<Embedding> {
        &self.embed_tokens
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    embed_tokens: LanguageTable<Embedding>,
    positions: PositionalEncoding,
    layers: Vec<DecoderLayer>,
    dropout: Dropout,
    emb_scale: f64,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding_table(config, vb.pp("embed_tokens"))?;
        let positions = PositionalEncoding::new(config.d_model, config.max_len, vb.dtype(), vb.device())?;
        let layers_vb = vb.pp("layers");
        let layers = (0..config.n_layers)
            .map(|i| DecoderLayer::new(config, layers_vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            positions,
            layers,
            dropout: Dropout::new(config.dropout),
            emb_scale: (config.d_model as f64).sqrt(),
        })
    }

    /// `[B, T]` previous tokens + `[B, S, d_model]` memory -> `[B, T, d_model]`.
    pub fn forward(
        &self,
        prev_tokens: &Tensor,
        memory: &Tensor,
        src_mask: Option<&Tensor>,
        tgt_mask: Option<&Tensor>,
        lang: usize,
        train: bool,
    ) -> Result<Tensor> {
        let xs = (self.embed_tokens.get(lang)?.forward(prev_tokens)? * self.emb_scale)?;
        let mut xs = self.dropout.forward(&self.positions.forward(&xs)?, train)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, memory, src_mask, tgt_mask, train)?;
        }
        Ok(xs)
    }

    pub fn embeddings(&self) -> &LanguageTable<Embedding> {
        &self.embed_tokens
    }
}

// ── Full model ──────────────────────────────────────────────────────────

/// Logits plus the latent regulariser of one teacher-forced pass.
#[derive(Debug, Clone)]
pub struct Seq2SeqOutput {
    /// `[B, T, vocab]`
    pub logits: Tensor,
    pub kl: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct Seq2SeqTransformer {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: LanguageTable<Linear>,
    latent: LatentBottleneck,
    config: ModelConfig,
    device: Device,
}

impl Seq2SeqTransformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        let lm_head_vb = vb.pp("lm_head");
        let lm_head = LanguageTable::build(config.n_langs(), config.shared_embeddings, |lang| {
            let vocab_size = config.vocab_size(lang.unwrap_or(0))?;
            candle_nn::linear(config.d_model, vocab_size, lm_head_vb.pp(table_key(lang)))
        })?;
        let latent = LatentBottleneck::new(config, vb.pp("latent"))?;

        tracing::info!(
            "built transformer: {} layers, d_model={}, heads={}, langs={:?}, shared_emb={}, variational={}",
            config.n_layers,
            config.d_model,
            config.n_heads,
            config.languages,
            config.shared_embeddings,
            latent.is_variational(),
        );

        Ok(Self {
            encoder,
            decoder,
            lm_head,
            latent,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn latent(&self) -> &LatentBottleneck {
        &self.latent
    }

    /// Deterministic encoder output, `[B, S, d_model]`.
    pub fn encode(&self, tokens: &Tensor, src_mask: &Tensor, src_lang: usize) -> Result<Tensor> {
        self.encoder.forward(tokens, Some(src_mask), src_lang, false)
    }

    /// Encoder output passed through the latent bottleneck.
    pub fn encode_latent(
        &self,
        tokens: &Tensor,
        src_mask: &Tensor,
        src_lang: usize,
        n_samples: usize,
        train: bool,
    ) -> Result<LatentCode> {
        let z = self.encoder.forward(tokens, Some(src_mask), src_lang, train)?;
        self.latent.apply(&z, src_mask, n_samples)
    }

    /// Full-sequence logits, `[B, T, vocab(tgt_lang)]`.
    pub fn decode(
        &self,
        prev_tokens: &Tensor,
        latent: &Tensor,
        src_mask: &Tensor,
        tgt_mask: Option<&Tensor>,
        tgt_lang: usize,
        train: bool,
    ) -> Result<Tensor> {
        let hidden = self
            .decoder
            .forward(prev_tokens, latent, Some(src_mask), tgt_mask, tgt_lang, train)?;
        self.lm_head.get(tgt_lang)?.forward(&hidden)
    }

    /// Logits for the position after the last token of `prefix`, `[B, vocab]`.
    /// Without an explicit `tgt_mask` the prefix is masked causally.
    pub fn decode_step(
        &self,
        prefix: &Tensor,
        latent: &Tensor,
        src_mask: &Tensor,
        tgt_mask: Option<&Tensor>,
        tgt_lang: usize,
    ) -> Result<Tensor> {
        let (_b_sz, seq_len) = prefix.dims2()?;
        let causal;
        let tgt_mask = match tgt_mask {
            Some(mask) => mask,
            None => {
                causal = Tensor::tril2(seq_len, DType::U8, prefix.device())?.reshape((1, 1, seq_len, seq_len))?;
                &causal
            }
        };
        let hidden = self
            .decoder
            .forward(prefix, latent, Some(src_mask), Some(tgt_mask), tgt_lang, false)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        self.lm_head.get(tgt_lang)?.forward(&last)
    }

    /// Teacher-forced pass. One latent sample is drawn in variational mode.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        src_tokens: &Tensor,
        prev_tokens: &Tensor,
        src_mask: &Tensor,
        tgt_mask: &Tensor,
        src_lang: usize,
        tgt_lang: usize,
        train: bool,
    ) -> Result<Seq2SeqOutput> {
        let code = self.encode_latent(src_tokens, src_mask, src_lang, 1, train)?;
        let src_mask = code.expand_rows(src_mask)?;
        let logits = self.decode(prev_tokens, &code.latent, &src_mask, Some(tgt_mask), tgt_lang, train)?;
        Ok(Seq2SeqOutput { logits, kl: code.kl })
    }
}

/// Log-probabilities over the vocabulary along the last dimension.
pub fn log_probs(logits: &Tensor) -> Result<Tensor> {
    candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::masks;
    use candle_nn::VarMap;

    fn tiny_model(shared: bool) -> Result<(Seq2SeqTransformer, VarMap)> {
        let mut config = ModelConfig::tiny(12, 2);
        config.shared_embeddings = shared;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Ok((Seq2SeqTransformer::new(&config, vb)?, varmap))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn positional_table_is_sinusoidal() -> Result<()> {
        let pe = PositionalEncoding::new(4, 8, DType::F32, &Device::Cpu)?;
        let zeros = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu)?;
        let rows = pe.forward(&zeros)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0.0, 1.0, 0.0, 1.0]);
        assert!((rows[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((rows[1][1] - 1f32.cos()).abs() < 1e-6);
        assert!((rows[2][2] - (2.0f32 * 0.01).sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn positional_table_rejects_long_inputs() -> Result<()> {
        let pe = PositionalEncoding::new(4, 2, DType::F32, &Device::Cpu)?;
        let xs = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu)?;
        assert!(pe.forward(&xs).is_err());
        Ok(())
    }

    #[test]
    fn attention_rejects_mismatched_mask() -> Result<()> {
        let config = ModelConfig::tiny(12, 1);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::new(&config, vb)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu)?;
        let bad = Tensor::ones((2, 1, 1, 4), DType::U8, &Device::Cpu)?;
        assert!(attn.forward(&xs, &xs, &xs, Some(&bad)).is_err());
        let good = Tensor::ones((2, 1, 1, 5), DType::U8, &Device::Cpu)?;
        assert_eq!(attn.forward(&xs, &xs, &xs, Some(&good))?.dims(), &[2, 5, 16]);
        Ok(())
    }

    #[test]
    fn masked_keys_do_not_contribute() -> Result<()> {
        let config = ModelConfig::tiny(12, 1);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::new(&config, vb)?;
        let q = Tensor::randn(0f32, 1f32, (1, 2, 16), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1f32, (1, 4, 16), &Device::Cpu)?;
        let noise = Tensor::randn(0f32, 5f32, (1, 1, 16), &Device::Cpu)?;
        let kv_changed = Tensor::cat(&[kv.narrow(1, 0, 3)?, noise], 1)?;
        let mask = Tensor::new(&[1u8, 1, 1, 0], &Device::Cpu)?.reshape((1, 1, 1, 4))?;
        let a = attn.forward(&q, &kv, &kv, Some(&mask))?;
        let b = attn.forward(&q, &kv_changed, &kv_changed, Some(&mask))?;
        assert!(max_abs_diff(&a, &b)? < 1e-5);
        Ok(())
    }

    #[test]
    fn decoder_is_causal() -> Result<()> {
        let (model, _varmap) = tiny_model(true)?;
        let src = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu)?;
        let src_mask = masks::source_mask(&src, 2)?;
        let memory = model.encode(&src, &src_mask, 0)?;

        let a = Tensor::new(&[[0u32, 6, 7, 8]], &Device::Cpu)?;
        let b = Tensor::new(&[[0u32, 6, 9, 10]], &Device::Cpu)?;
        let mask = Tensor::tril2(4, DType::U8, &Device::Cpu)?.reshape((1, 1, 4, 4))?;
        let la = model.decode(&a, &memory, &src_mask, Some(&mask), 1, false)?;
        let lb = model.decode(&b, &memory, &src_mask, Some(&mask), 1, false)?;
        // Positions 0 and 1 only see the shared prefix.
        assert!(max_abs_diff(&la.narrow(1, 0, 2)?, &lb.narrow(1, 0, 2)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn encoder_ignores_padding_content() -> Result<()> {
        let (model, _varmap) = tiny_model(true)?;
        let a = Tensor::new(&[[3u32, 4, 2, 2]], &Device::Cpu)?;
        let b = Tensor::new(&[[3u32, 4, 7, 9]], &Device::Cpu)?;
        let mask = masks::source_mask(&a, 2)?;
        let za = model.encode(&a, &mask, 0)?;
        let zb = model.encode(&b, &mask, 0)?;
        assert!(max_abs_diff(&za.narrow(1, 0, 2)?, &zb.narrow(1, 0, 2)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn decode_step_returns_last_position_logits() -> Result<()> {
        let (model, _varmap) = tiny_model(false)?;
        let src = Tensor::new(&[[3u32, 4, 5], [6, 7, 2]], &Device::Cpu)?;
        let src_mask = masks::source_mask(&src, 2)?;
        let memory = model.encode(&src, &src_mask, 0)?;
        let prefix = Tensor::new(&[[1u32, 8], [1, 9]], &Device::Cpu)?;
        let step = model.decode_step(&prefix, &memory, &src_mask, None, 1)?;
        assert_eq!(step.dims(), &[2, 12]);
        let full = model.decode(&prefix, &memory, &src_mask, Some(&masks::target_mask(&prefix, 2)?), 1, false)?;
        assert!(max_abs_diff(&step, &full.narrow(1, 1, 1)?.squeeze(1)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn language_tables_alias_only_when_shared() -> Result<()> {
        let (shared, shared_vars) = tiny_model(true)?;
        assert!(shared.encoder().embeddings().is_shared());
        let e0 = shared.encoder().embeddings().get(0)?.embeddings().clone();
        let e1 = shared.encoder().embeddings().get(1)?.embeddings().clone();
        assert_eq!(max_abs_diff(&e0, &e1)?, 0.0);
        assert!(shared_vars.data().lock().unwrap().contains_key("encoder.embed_tokens.shared.weight"));

        let (separate, separate_vars) = tiny_model(false)?;
        assert!(!separate.decoder().embeddings().is_shared());
        let names = separate_vars.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
        assert!(names.iter().any(|n| n == "decoder.embed_tokens.1.weight"));
        assert!(names.iter().any(|n| n == "lm_head.0.weight"));
        assert!(separate.encoder().embeddings().get(2).is_err());
        Ok(())
    }
}
