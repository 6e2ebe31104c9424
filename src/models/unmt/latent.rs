//! Variational sentence bottleneck.
//!
//! The encoder output is summarised by its mean over the sequence, PAD
//! positions included unless the config asks for a masked mean.
//! A small network predicts a diagonal covariance for that sentence, and each
//! latent sample shifts every position of the sentence by the same Gaussian
//! draw. Sampled rows are laid out sample-major: row `s * B + b` is sample `s`
//! of example `b`.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::config::ModelConfig;

/// Output of the latent bottleneck.
#[derive(Debug, Clone)]
pub struct LatentCode {
    /// `[n_samples * B, S, d_model]`, or the encoder output when not sampled.
    pub latent: Tensor,
    /// Sentence embedding, `[B, d_model]`.
    pub mean: Option<Tensor>,
    /// Diagonal covariance, `[B, d_model]`.
    pub covariance: Option<Tensor>,
    /// Shift added to each sample, `[n_samples, B, d_model]`.
    pub shifts: Option<Tensor>,
    /// Batch-averaged KL divergence to the standard normal prior.
    pub kl: Option<Tensor>,
    /// How many times each example appears in `latent`.
    pub n_samples: usize,
}

impl LatentCode {
    pub fn deterministic(latent: Tensor) -> Self {
        Self {
            latent,
            mean: None,
            covariance: None,
            shifts: None,
            kl: None,
            n_samples: 1,
        }
    }

    /// Repeats per-example rows (masks, token batches) so they line up with
    /// `latent`.
    pub fn expand_rows(&self, xs: &Tensor) -> Result<Tensor> {
        if self.n_samples == 1 {
            return Ok(xs.clone());
        }
        let mut reps = vec![1usize; xs.rank()];
        reps[0] = self.n_samples;
        xs.repeat(reps)
    }
}

/// `log(1 + exp(x))`, stable for large `|x|`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    xs.relu()? + tail
}

/// Mean of `z` (`[B, S, D]`) over positions where `src_mask` (`[B, 1, 1, S]`) is set.
pub fn masked_mean(z: &Tensor, src_mask: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, _) = z.dims3()?;
    let weights = src_mask.reshape((b_sz, seq_len, 1))?.to_dtype(z.dtype())?;
    let total = z.broadcast_mul(&weights)?.sum(1)?;
    let count = weights.sum(1)?.maximum(1f64)?;
    total.broadcast_div(&count)
}

/// KL(N(mean, diag(var)) || N(0, I)), summed over dimensions and averaged over the batch.
///
/// The posterior is the first argument: this is KL(q || p) with the standard
/// normal prior p, not the reverse KL(p || q).
pub fn gaussian_kl(mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let per_dim = ((var + mean.sqr()?)? - var.log()?)?.affine(1.0, -1.0)?;
    (per_dim.sum(1)? * 0.5)?.mean(0)
}

#[derive(Debug, Clone)]
pub struct GaussianLatent {
    hidden: Linear,
    out: Linear,
    masked_mean: bool,
}

impl GaussianLatent {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            hidden: candle_nn::linear(d, d, vb.pp("sigma_hidden"))?,
            out: candle_nn::linear(d, d, vb.pp("sigma_out"))?,
            masked_mean: config.masked_sentence_mean,
        })
    }

    /// Strictly positive diagonal covariance for each sentence embedding.
    pub fn covariance(&self, sent_emb: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden.forward(sent_emb)?.tanh()?;
        softplus(&self.out.forward(&hidden)?)
    }

    /// `[B, d_model]` summary of `z` that the covariance is predicted from.
    pub fn sentence_embedding(&self, z: &Tensor, src_mask: &Tensor) -> Result<Tensor> {
        if self.masked_mean {
            masked_mean(z, src_mask)
        } else {
            z.mean(1)
        }
    }

    /// Reparameterised draw of `n_samples` shifted copies of `z`.
    pub fn sample(&self, z: &Tensor, src_mask: &Tensor, n_samples: usize) -> Result<LatentCode> {
        if n_samples == 0 {
            bail!("GaussianLatent::sample needs at least one sample")
        }
        let (b_sz, seq_len, d_model) = z.dims3()?;
        let mean = self.sentence_embedding(z, src_mask)?;
        let var = self.covariance(&mean)?;

        let eps = Tensor::randn(0f32, 1f32, (n_samples, b_sz, d_model), z.device())?.to_dtype(z.dtype())?;
        let shifts = eps.broadcast_mul(&var.sqrt()?.unsqueeze(0)?)?;

        let latent = z
            .unsqueeze(0)?
            .broadcast_add(&shifts.unsqueeze(2)?)?
            .reshape((n_samples * b_sz, seq_len, d_model))?;
        let kl = gaussian_kl(&mean, &var)?;

        Ok(LatentCode {
            latent,
            mean: Some(mean),
            covariance: Some(var),
            shifts: Some(shifts),
            kl: Some(kl),
            n_samples,
        })
    }
}

/// The latent strategy, fixed at construction.
#[derive(Debug, Clone)]
pub enum LatentBottleneck {
    PassThrough,
    Gaussian(GaussianLatent),
}

impl LatentBottleneck {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if config.variational {
            Ok(Self::Gaussian(GaussianLatent::new(config, vb)?))
        } else {
            Ok(Self::PassThrough)
        }
    }

    pub fn is_variational(&self) -> bool {
        matches!(self, Self::Gaussian(_))
    }

    /// `n_samples == 0` bypasses sampling even for the Gaussian strategy.
    pub fn apply(&self, z: &Tensor, src_mask: &Tensor, n_samples: usize) -> Result<LatentCode> {
        match self {
            Self::Gaussian(g) if n_samples > 0 => g.sample(z, src_mask, n_samples),
            _ => Ok(LatentCode::deterministic(z.clone())),
        }
    }
}
