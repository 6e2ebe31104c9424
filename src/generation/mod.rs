//! Autoregressive decoding: beam search, sampling and their configuration.

pub mod based;
pub mod batch_state;
pub mod beam_search;
pub mod sampling;
pub mod translator;

use anyhow::Result;
use serde::Deserialize;

pub use based::Seq2SeqModel;
pub use batch_state::BatchState;
pub use beam_search::{BeamSearch, Hypothesis, StepOutcome};
pub use sampling::sample_decode;
pub use translator::{beam_search, format_hypotheses, translate, DecodeOutput, Selection};

/// Normalisation of cumulative log-probabilities by hypothesis length.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LengthPenalty {
    /// Rank by raw cumulative log-probability.
    #[default]
    None,
    /// Wu et al.: divide by `((5 + len) / 6)^alpha`.
    Wu { alpha: f32 },
    /// Divide by the length.
    Average,
}

impl LengthPenalty {
    pub fn factor(&self, length: usize) -> f32 {
        match *self {
            LengthPenalty::None => 1.0,
            LengthPenalty::Wu { alpha } => ((5.0 + length as f32) / 6.0).powf(alpha),
            LengthPenalty::Average => length.max(1) as f32,
        }
    }

    pub fn normalize(&self, log_prob: f32, length: usize) -> f32 {
        log_prob / self.factor(length)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeamSearchConfig {
    pub beam_size: usize,
    /// Finished hypotheses to collect per example before it stops.
    pub n_best: usize,
    /// Tokens after BOS, the closing EOS included.
    pub max_length: usize,
    #[serde(default)]
    pub length_penalty: LengthPenalty,
    /// Forbid repeating any n-gram of this size. 0 disables.
    #[serde(default)]
    pub block_repeated_ngram: usize,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            beam_size: 4,
            n_best: 1,
            max_length: 100,
            length_penalty: LengthPenalty::Wu { alpha: 0.7 },
            block_repeated_ngram: 0,
        }
    }
}

impl BeamSearchConfig {
    pub fn greedy(max_length: usize) -> Self {
        Self {
            beam_size: 1,
            n_best: 1,
            max_length,
            length_penalty: LengthPenalty::None,
            block_repeated_ngram: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            anyhow::bail!("beam_size must be at least 1");
        }
        if self.n_best == 0 || self.n_best > self.beam_size {
            anyhow::bail!(
                "n_best ({}) must be between 1 and beam_size ({})",
                self.n_best,
                self.beam_size
            );
        }
        if self.max_length == 0 {
            anyhow::bail!("max_length must be positive");
        }
        if let LengthPenalty::Wu { alpha } = self.length_penalty {
            if !alpha.is_finite() || alpha < 0.0 {
                anyhow::bail!("length penalty alpha must be finite and >= 0, got {alpha}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// `None` decodes greedily.
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_length: usize,
    #[serde(default)]
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: Some(1.0),
            top_p: None,
            max_length: 100,
            seed: 299792458,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            anyhow::bail!("max_length must be positive");
        }
        if let Some(t) = self.temperature {
            if !(t > 0.0) {
                anyhow::bail!("temperature must be positive, got {t}");
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                anyhow::bail!("top_p must be in (0, 1], got {p}");
            }
        }
        Ok(())
    }
}
