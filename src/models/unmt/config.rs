use candle_core::{bail, Result};
use serde::Deserialize;

fn default_d_model() -> usize {
    512
}
fn default_n_heads() -> usize {
    8
}
fn default_d_ff() -> usize {
    2048
}
fn default_n_layers() -> usize {
    6
}
fn default_max_len() -> usize {
    512
}
fn default_dropout() -> f32 {
    0.1
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_true() -> bool {
    true
}

/// Special token strings, resolved against each language's tokenizer.
#[derive(Debug, Clone, Deserialize)]
pub struct VocabConfig {
    #[serde(default = "VocabConfig::default_pad")]
    pub pad_token: String,
    #[serde(default = "VocabConfig::default_eos")]
    pub eos_token: String,
    #[serde(default = "VocabConfig::default_blank")]
    pub blank_token: String,
    #[serde(default = "VocabConfig::default_unk")]
    pub unk_token: String,
    /// Per-language start symbol, e.g. `["<s_en>", "<s_fr>"]`.
    pub bos_tokens: Vec<String>,
}

impl VocabConfig {
    fn default_pad() -> String {
        "<pad>".to_string()
    }
    fn default_eos() -> String {
        "</s>".to_string()
    }
    fn default_blank() -> String {
        "<blank>".to_string()
    }
    fn default_unk() -> String {
        "<unk>".to_string()
    }
}

/// Model hyper-parameters. Built once and shared by reference; nothing
/// downstream mutates it.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_d_ff")]
    pub d_ff: usize,
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    /// Longest sequence the positional table covers.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    pub languages: Vec<String>,
    pub vocab_sizes: Vec<usize>,
    #[serde(default = "default_true")]
    pub shared_embeddings: bool,
    #[serde(default)]
    pub variational: bool,
    /// Average only non-PAD positions when summarising a sentence for the
    /// latent covariance. Off means the plain mean over the sequence.
    #[serde(default)]
    pub masked_sentence_mean: bool,
    /// Decoder-input blanking probability, variational training only.
    #[serde(default)]
    pub word_drop: f32,
    #[serde(default)]
    pub vocab: Option<VocabConfig>,
}

impl ModelConfig {
    pub fn d_k(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn n_langs(&self) -> usize {
        self.languages.len()
    }

    pub fn vocab_size(&self, lang: usize) -> Result<usize> {
        match self.vocab_sizes.get(lang) {
            Some(&v) => Ok(v),
            None => bail!("unknown language id {lang} (model has {})", self.n_langs()),
        }
    }

    pub fn lang_id(&self, name: &str) -> Result<usize> {
        match self.languages.iter().position(|l| l == name) {
            Some(id) => Ok(id),
            None => bail!("unknown language {name:?}, expected one of {:?}", self.languages),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            bail!("d_model ({}) must be divisible by n_heads ({})", self.d_model, self.n_heads)
        }
        if self.d_model % 2 != 0 {
            bail!("d_model ({}) must be even for sinusoidal positions", self.d_model)
        }
        if self.n_layers == 0 || self.d_ff == 0 || self.max_len == 0 {
            bail!("n_layers, d_ff and max_len must be positive")
        }
        if self.languages.is_empty() || self.languages.len() != self.vocab_sizes.len() {
            bail!(
                "{} languages but {} vocab sizes",
                self.languages.len(),
                self.vocab_sizes.len()
            )
        }
        if self.vocab_sizes.contains(&0) {
            bail!("vocab sizes must be positive: {:?}", self.vocab_sizes)
        }
        if self.shared_embeddings && self.vocab_sizes.iter().any(|&v| v != self.vocab_sizes[0]) {
            bail!("shared embeddings need one vocab size, got {:?}", self.vocab_sizes)
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout)
        }
        if !(0.0..1.0).contains(&self.word_drop) {
            bail!("word_drop must be in [0, 1), got {}", self.word_drop)
        }
        if let Some(vocab) = &self.vocab {
            if vocab.bos_tokens.len() != self.languages.len() {
                bail!("need one BOS token per language, got {:?}", vocab.bos_tokens)
            }
        }
        Ok(())
    }

    /// Small configuration for tests and smoke runs.
    pub fn tiny(vocab_size: usize, n_langs: usize) -> Self {
        Self {
            d_model: 16,
            n_heads: 4,
            d_ff: 32,
            n_layers: 2,
            max_len: 64,
            dropout: 0.0,
            layer_norm_eps: default_layer_norm_eps(),
            languages: (0..n_langs).map(|i| format!("l{i}")).collect(),
            vocab_sizes: vec![vocab_size; n_langs],
            shared_embeddings: true,
            variational: false,
            masked_sentence_mean: false,
            word_drop: 0.0,
            vocab: None,
        }
    }
}
