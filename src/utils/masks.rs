//! Attention masks for the encoder and decoder.
//!
//! Masks are `U8` tensors where `1` marks a visible key position. They are
//! shaped so they broadcast against attention scores of shape
//! `[batch, heads, query_len, key_len]`.

use candle_core::{bail, DType, Result, Tensor};

/// Padding mask for source tokens: `[B, S] -> [B, 1, 1, S]`.
pub fn source_mask(tokens: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (b_sz, src_len) = tokens.dims2()?;
    let pad = Tensor::new(pad_id, tokens.device())?.to_dtype(tokens.dtype())?;
    tokens
        .broadcast_ne(&pad)?
        .reshape((b_sz, 1, 1, src_len))
}

/// Causal + padding mask for decoder inputs: `[B, T] -> [B, 1, T, T]`.
///
/// Query position `i` sees key position `j` iff `j <= i` and token `j` is not PAD.
pub fn target_mask(tokens: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (b_sz, tgt_len) = tokens.dims2()?;
    if tgt_len == 0 {
        bail!("target_mask: empty target sequence")
    }
    let causal = Tensor::tril2(tgt_len, DType::U8, tokens.device())?.reshape((1, 1, tgt_len, tgt_len))?;
    let keys = source_mask(tokens, pad_id)?; // [B, 1, 1, T]
    keys.broadcast_mul(&causal)?
        .reshape((b_sz, 1, tgt_len, tgt_len))
}
