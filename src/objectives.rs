//! Loss computation for unsupervised training: denoising auto-encoding and
//! back-translation. No optimizer or training loop lives here.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

use crate::data::noise::{word_dropout, NoiseModel};
use crate::data::vocabulary::Vocabulary;
use crate::generation::{translate, BeamSearchConfig};
use crate::models::unmt::modeling::Seq2SeqTransformer;
use crate::utils::masks::{source_mask, target_mask};

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// `nll + kl_weight * kl`, a scalar.
    pub loss: Tensor,
    /// Mean negative log-likelihood per non-PAD target token.
    pub nll: Tensor,
    pub kl: Option<Tensor>,
    pub n_tokens: usize,
}

/// Mean cross entropy of `logits` (`[B, T, V]`) against `targets` (`[B, T]`),
/// skipping positions whose target is `pad_id`.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor, pad_id: u32) -> Result<(Tensor, usize)> {
    let (b_sz, seq_len, vocab) = logits.dims3()?;
    if targets.dims() != [b_sz, seq_len] {
        anyhow::bail!("targets {:?} do not match logits {:?}", targets.dims(), logits.dims());
    }
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?
        .reshape((b_sz * seq_len, vocab))?;
    let targets = targets.reshape(b_sz * seq_len)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;
    let weights = targets.ne(pad_id as f64)?.to_dtype(DType::F32)?;
    let n_tokens = weights.sum_all()?.to_scalar::<f32>()? as usize;
    if n_tokens == 0 {
        anyhow::bail!("batch has no target tokens");
    }
    let nll = ((picked * weights)?.sum_all()?.neg()? / n_tokens as f64)?;
    Ok((nll, n_tokens))
}

pub struct Objectives<'a> {
    model: &'a Seq2SeqTransformer,
    vocab: &'a Vocabulary,
    kl_weight: f64,
}

impl<'a> Objectives<'a> {
    pub fn new(model: &'a Seq2SeqTransformer, vocab: &'a Vocabulary, kl_weight: f64) -> Self {
        Self {
            model,
            vocab,
            kl_weight,
        }
    }

    /// Denoising auto-encoding: rebuild `batch` (`[B, T]`, BOS..EOS then PAD)
    /// in `lang` from a corrupted copy of itself.
    pub fn reconstruction_loss(
        &self,
        batch: &Tensor,
        lengths: &[usize],
        lang: usize,
        noise: &dyn NoiseModel,
    ) -> Result<LossOutput> {
        let (noisy, _) = noise.add_noise(batch, lengths, lang)?;
        self.teacher_forced(&noisy, batch, lang, lang)
    }

    /// Translates `batch` from `src_lang` into `tgt_lang` with beam search,
    /// then learns to rebuild the original sentences from that translation.
    /// The translation is treated as a constant.
    #[allow(clippy::too_many_arguments)]
    pub fn back_translation_loss(
        &self,
        batch: &Tensor,
        lengths: &[usize],
        src_lang: usize,
        tgt_lang: usize,
        beam: &BeamSearchConfig,
        noise: &dyn NoiseModel,
    ) -> Result<LossOutput> {
        let (noisy, _) = noise.add_noise(batch, lengths, src_lang)?;
        let src_mask = source_mask(&noisy, self.vocab.pad_id)?;
        let translation = translate(self.model, &noisy, &src_mask, src_lang, tgt_lang, self.vocab, beam, 0)?;
        let translation = translation.tokens.detach();
        self.teacher_forced(&translation, batch, tgt_lang, src_lang)
    }

    fn teacher_forced(&self, src: &Tensor, target: &Tensor, src_lang: usize, tgt_lang: usize) -> Result<LossOutput> {
        let seq_len = target.dim(1)?;
        if seq_len < 2 {
            anyhow::bail!("targets need at least BOS and EOS, got length {seq_len}");
        }
        let mut prev = target.narrow(1, 0, seq_len - 1)?;
        let next = target.narrow(1, 1, seq_len - 1)?;
        let config = self.model.config();
        if self.model.latent().is_variational() && config.word_drop > 0.0 {
            prev = word_dropout(&prev, config.word_drop, self.vocab.blank_id)?;
        }

        let src_mask = source_mask(src, self.vocab.pad_id)?;
        let tgt_mask = target_mask(&prev, self.vocab.pad_id)?;
        let output = self
            .model
            .forward(src, &prev, &src_mask, &tgt_mask, src_lang, tgt_lang, true)?;

        let (nll, n_tokens) = cross_entropy(&output.logits, &next, self.vocab.pad_id)?;
        let loss = match &output.kl {
            Some(kl) => (&nll + (kl.to_dtype(DType::F32)? * self.kl_weight)?)?,
            None => nll.clone(),
        };
        Ok(LossOutput {
            loss,
            nll,
            kl: output.kl,
            n_tokens,
        })
    }
}
