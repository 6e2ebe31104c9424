use candle_core::{Device, Result, Tensor};

use crate::models::unmt::latent::LatentCode;

/// What the decoding loops need from an encoder-decoder model.
pub trait Seq2SeqModel {
    fn device(&self) -> &Device;

    fn vocab_size(&self, lang: usize) -> Result<usize>;

    /// Encoder output, `[B, S, d_model]`.
    fn encode(&self, tokens: &Tensor, src_mask: &Tensor, src_lang: usize) -> Result<Tensor>;

    /// Draws latent samples around an encoder output. Models without a latent
    /// bottleneck hand the encoder output back unchanged.
    fn sample_latent(&self, encoded: &Tensor, _src_mask: &Tensor, _n_samples: usize) -> Result<LatentCode> {
        Ok(LatentCode::deterministic(encoded.clone()))
    }

    /// Next-token logits for every row of `prefix`, `[B, vocab(tgt_lang)]`.
    fn decode_step(
        &self,
        prefix: &Tensor,
        latent: &Tensor,
        src_mask: &Tensor,
        tgt_mask: Option<&Tensor>,
        tgt_lang: usize,
    ) -> Result<Tensor>;
}
