use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::models::unmt::config::VocabConfig;

/// Reserved ids and per-language sizes. PAD, EOS and blank are shared by all
/// languages; every language has its own BOS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub pad_id: u32,
    pub eos_id: u32,
    pub blank_id: u32,
    #[serde(default)]
    pub unk_id: Option<u32>,
    pub bos_ids: Vec<u32>,
    pub vocab_sizes: Vec<usize>,
}

impl Vocabulary {
    pub fn n_langs(&self) -> usize {
        self.bos_ids.len()
    }

    pub fn bos(&self, lang: usize) -> Result<u32> {
        self.bos_ids
            .get(lang)
            .copied()
            .with_context(|| format!("unknown language id {lang} ({} languages)", self.n_langs()))
    }

    pub fn vocab_size(&self, lang: usize) -> Result<usize> {
        self.vocab_sizes
            .get(lang)
            .copied()
            .with_context(|| format!("unknown language id {lang} ({} languages)", self.n_langs()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bos_ids.is_empty() || self.bos_ids.len() != self.vocab_sizes.len() {
            anyhow::bail!(
                "{} BOS ids but {} vocab sizes",
                self.bos_ids.len(),
                self.vocab_sizes.len()
            );
        }
        for (lang, (&bos, &size)) in self.bos_ids.iter().zip(&self.vocab_sizes).enumerate() {
            for (name, id) in [
                ("pad", self.pad_id),
                ("eos", self.eos_id),
                ("blank", self.blank_id),
                ("bos", bos),
            ] {
                if id as usize >= size {
                    anyhow::bail!("{name} id {id} outside vocabulary of language {lang} ({size})");
                }
            }
        }
        Ok(())
    }

    /// Resolves special ids against one tokenizer per language. Shared
    /// specials must map to the same id everywhere.
    pub fn from_tokenizers(config: &VocabConfig, tokenizers: &[Tokenizer]) -> Result<Self> {
        if tokenizers.len() != config.bos_tokens.len() {
            anyhow::bail!(
                "{} tokenizers for {} BOS tokens",
                tokenizers.len(),
                config.bos_tokens.len()
            );
        }

        let shared = |token: &str| -> Result<u32> {
            let mut found = None;
            for (lang, tok) in tokenizers.iter().enumerate() {
                let id = tok
                    .token_to_id(token)
                    .with_context(|| format!("token {token:?} missing from tokenizer {lang}"))?;
                match found {
                    Some(prev) if prev != id => {
                        anyhow::bail!("token {token:?} has id {prev} and {id} across languages")
                    }
                    _ => found = Some(id),
                }
            }
            found.context("no tokenizers")
        };

        let pad_id = shared(&config.pad_token)?;
        let eos_id = shared(&config.eos_token)?;
        let blank_id = shared(&config.blank_token)?;
        let unk_id = shared(&config.unk_token).ok();

        let bos_ids = tokenizers
            .iter()
            .zip(&config.bos_tokens)
            .map(|(tok, bos)| {
                tok.token_to_id(bos)
                    .with_context(|| format!("BOS token {bos:?} missing from tokenizer"))
            })
            .collect::<Result<Vec<_>>>()?;
        let vocab_sizes = tokenizers.iter().map(|t| t.get_vocab_size(true)).collect();

        let vocab = Self {
            pad_id,
            eos_id,
            blank_id,
            unk_id,
            bos_ids,
            vocab_sizes,
        };
        vocab.validate()?;
        Ok(vocab)
    }
}

/// Id -> word table of one language.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    words: Vec<String>,
}

impl Dictionary {
    pub fn new(words: Vec<String>) -> Self {
        Self { words }
    }

    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        let vocab = tokenizer.get_vocab(true);
        let mut words = vec![String::new(); tokenizer.get_vocab_size(true)];
        for (word, id) in vocab {
            if let Some(slot) = words.get_mut(id as usize) {
                *slot = word;
            }
        }
        Self { words }
    }

    pub fn word(&self, id: usize) -> Option<&str> {
        self.words.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.words.iter().enumerate().map(|(i, w)| (i, w.as_str()))
    }
}
