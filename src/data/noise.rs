//! Token-level corruption used by denoising auto-encoding.

use anyhow::Result;
use candle_core::{DType, Tensor};

use super::vocabulary::Vocabulary;

pub trait NoiseModel {
    /// Corrupts a `[B, T]` batch of token ids. Returns the corrupted batch and
    /// the new per-example lengths.
    fn add_noise(&self, tokens: &Tensor, lengths: &[usize], lang: usize) -> Result<(Tensor, Vec<usize>)>;
}

/// Leaves the input untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNoise;

impl NoiseModel for NoNoise {
    fn add_noise(&self, tokens: &Tensor, lengths: &[usize], _lang: usize) -> Result<(Tensor, Vec<usize>)> {
        Ok((tokens.clone(), lengths.to_vec()))
    }
}

/// Replaces ordinary words by the blank token with probability `prob`.
/// BOS (position 0), EOS and PAD are never blanked, so lengths are unchanged.
#[derive(Debug, Clone)]
pub struct WordBlanking {
    prob: f32,
    blank_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl WordBlanking {
    pub fn new(prob: f32, vocab: &Vocabulary) -> Result<Self> {
        if !(0.0..1.0).contains(&prob) {
            anyhow::bail!("blanking probability must be in [0, 1), got {prob}");
        }
        Ok(Self {
            prob,
            blank_id: vocab.blank_id,
            eos_id: vocab.eos_id,
            pad_id: vocab.pad_id,
        })
    }
}

impl NoiseModel for WordBlanking {
    fn add_noise(&self, tokens: &Tensor, lengths: &[usize], _lang: usize) -> Result<(Tensor, Vec<usize>)> {
        let (b_sz, _) = tokens.dims2()?;
        if lengths.len() != b_sz {
            anyhow::bail!("{} lengths for a batch of {b_sz}", lengths.len());
        }
        let keep = keep_mask(tokens, self.prob)?;
        let protected = tokens
            .eq(self.eos_id as f64)?
            .maximum(&tokens.eq(self.pad_id as f64)?)?;
        let keep = keep.maximum(&protected)?;
        let blanks = Tensor::full(self.blank_id, tokens.dims(), tokens.device())?;
        Ok((keep.where_cond(tokens, &blanks)?, lengths.to_vec()))
    }
}

/// Bernoulli keep mask (`U8`) with position 0 always kept.
fn keep_mask(tokens: &Tensor, drop_prob: f32) -> Result<Tensor> {
    let (b_sz, seq_len) = tokens.dims2()?;
    let keep = Tensor::rand(0f32, 1f32, (b_sz, seq_len), tokens.device())?.ge(drop_prob as f64)?;
    if seq_len <= 1 {
        return Ok(Tensor::ones((b_sz, seq_len), DType::U8, tokens.device())?);
    }
    let first = Tensor::ones((b_sz, 1), DType::U8, tokens.device())?;
    Ok(Tensor::cat(&[&first, &keep.narrow(1, 1, seq_len - 1)?], 1)?)
}

/// Decoder-input word dropout: every token but the first becomes `blank_id`
/// with probability `drop_prob`.
pub fn word_dropout(tokens: &Tensor, drop_prob: f32, blank_id: u32) -> Result<Tensor> {
    if drop_prob <= 0.0 {
        return Ok(tokens.clone());
    }
    let keep = keep_mask(tokens, drop_prob)?;
    let blanks = Tensor::full(blank_id, tokens.dims(), tokens.device())?;
    Ok(keep.where_cond(tokens, &blanks)?)
}
