use std::path::Path;

use anyhow::{Error as E, Result};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;

use super::config::ModelConfig;
use super::latent::LatentCode;
use super::modeling::Seq2SeqTransformer;
use crate::data::vocabulary::Vocabulary;
use crate::generation::based::Seq2SeqModel;
use crate::generation::{beam_search, sample_decode, BeamSearchConfig, SamplingConfig};
use crate::utils::hub::{self, ModelFiles};
use crate::utils::masks::source_mask;

impl Seq2SeqModel for Seq2SeqTransformer {
    fn device(&self) -> &Device {
        Seq2SeqTransformer::device(self)
    }

    fn vocab_size(&self, lang: usize) -> candle_core::Result<usize> {
        self.config().vocab_size(lang)
    }

    fn encode(&self, tokens: &Tensor, src_mask: &Tensor, src_lang: usize) -> candle_core::Result<Tensor> {
        Seq2SeqTransformer::encode(self, tokens, src_mask, src_lang)
    }

    fn sample_latent(&self, encoded: &Tensor, src_mask: &Tensor, n_samples: usize) -> candle_core::Result<LatentCode> {
        self.latent().apply(encoded, src_mask, n_samples)
    }

    fn decode_step(
        &self,
        prefix: &Tensor,
        latent: &Tensor,
        src_mask: &Tensor,
        tgt_mask: Option<&Tensor>,
        tgt_lang: usize,
    ) -> candle_core::Result<Tensor> {
        Seq2SeqTransformer::decode_step(self, prefix, latent, src_mask, tgt_mask, tgt_lang)
    }
}

/// How [`Model::translate`] decodes.
#[derive(Debug, Clone)]
pub enum Decoding {
    Beam(BeamSearchConfig),
    Sample(SamplingConfig),
}

/// A translation model with its tokenizers, ready for text in and text out.
pub struct Model {
    pub tokenizers: Vec<Tokenizer>,
    pub vocab: Vocabulary,
    pub device: Device,
    inner: Seq2SeqTransformer,
}

impl Model {
    /// Loads `config.json`, `*.safetensors` and one `tokenizer.<lang>.json`
    /// per language from a local directory.
    pub fn from_dir(model_path: impl AsRef<Path>, device: &Device, dtype: &DType) -> Result<Self> {
        let dir = model_path.as_ref();
        let languages = hub::read_languages(&dir.join("config.json"))?;
        let files = hub::local_files(dir, &languages)?;
        Self::from_files(&files, device, dtype)
    }

    pub fn from_hub(model_id: &str, revision: Option<&str>, device: &Device, dtype: &DType) -> Result<Self> {
        let files = hub::hub_files(model_id, revision)?;
        Self::from_files(&files, device, dtype)
    }

    fn from_files(files: &ModelFiles, device: &Device, dtype: &DType) -> Result<Self> {
        let config_data = std::fs::read(&files.config)?;
        let config: ModelConfig = serde_json::from_slice(&config_data)?;
        config.validate()?;

        let tokenizers = files
            .tokenizers
            .iter()
            .map(|path| Tokenizer::from_file(path).map_err(E::msg))
            .collect::<Result<Vec<_>>>()?;
        let vocab_config = config
            .vocab
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("config.json has no \"vocab\" section"))?;
        let vocab = Vocabulary::from_tokenizers(vocab_config, &tokenizers)?;
        for (lang, (&tok_size, &model_size)) in vocab.vocab_sizes.iter().zip(&config.vocab_sizes).enumerate() {
            if tok_size > model_size {
                anyhow::bail!(
                    "tokenizer of {} has {tok_size} entries, model only {model_size}",
                    config.languages[lang]
                );
            }
        }

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, *dtype, device) }?;
        let inner = Seq2SeqTransformer::new(&config, vb)?;

        Ok(Self {
            tokenizers,
            vocab,
            device: device.clone(),
            inner,
        })
    }

    pub fn inner(&self) -> &Seq2SeqTransformer {
        &self.inner
    }

    pub fn lang_id(&self, name: &str) -> Result<usize> {
        Ok(self.inner.config().lang_id(name)?)
    }

    /// `[BOS, ids.., EOS]` per sentence, right padded. Returns tokens, mask
    /// and lengths.
    pub fn prepare_inputs(&self, sentences: &[String], lang: usize) -> Result<(Tensor, Tensor, Vec<usize>)> {
        let tokenizer = self
            .tokenizers
            .get(lang)
            .ok_or_else(|| anyhow::anyhow!("no tokenizer for language {lang}"))?;
        let max_len = self.inner.config().max_len;
        let bos = self.vocab.bos(lang)?;

        let mut rows = Vec::with_capacity(sentences.len());
        for sentence in sentences {
            let encoding = tokenizer.encode(sentence.as_str(), false).map_err(E::msg)?;
            let mut ids = Vec::with_capacity(encoding.len() + 2);
            ids.push(bos);
            ids.extend(encoding.get_ids().iter().take(max_len.saturating_sub(2)));
            ids.push(self.vocab.eos_id);
            rows.push(ids);
        }
        let lengths = rows.iter().map(Vec::len).collect::<Vec<_>>();
        let width = lengths.iter().copied().max().unwrap_or(0);
        let flat = rows
            .into_iter()
            .flat_map(|mut ids| {
                ids.resize(width, self.vocab.pad_id);
                ids
            })
            .collect::<Vec<_>>();
        let tokens = Tensor::from_vec(flat, (sentences.len(), width), &self.device)?;
        let mask = source_mask(&tokens, self.vocab.pad_id)?;
        Ok((tokens, mask, lengths))
    }

    /// Detokenizes rows of a decode output, dropping BOS, EOS and PAD.
    pub fn decode_tokens(&self, tokens: &Tensor, lengths: &Tensor, lang: usize) -> Result<Vec<String>> {
        let tokenizer = self
            .tokenizers
            .get(lang)
            .ok_or_else(|| anyhow::anyhow!("no tokenizer for language {lang}"))?;
        let lengths = lengths.to_vec1::<u32>()?;
        if lengths.is_empty() {
            return Ok(Vec::new());
        }
        tokens
            .to_vec2::<u32>()?
            .into_iter()
            .zip(lengths)
            .map(|(row, len)| {
                let len = len as usize;
                let body = if len >= 2 { &row[1..len - 1] } else { &[][..] };
                tokenizer.decode(body, true).map_err(E::msg)
            })
            .collect()
    }

    pub fn translate(&self, sentences: &[String], src_lang: usize, tgt_lang: usize, decoding: &Decoding) -> Result<Vec<String>> {
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let (tokens, mask, _) = self.prepare_inputs(sentences, src_lang)?;
        let memory = self.inner.encode(&tokens, &mask, src_lang)?;
        let output = match decoding {
            Decoding::Beam(config) => beam_search(&self.inner, &memory, &mask, tgt_lang, &self.vocab, config)?,
            Decoding::Sample(config) => sample_decode(&self.inner, &memory, &mask, tgt_lang, &self.vocab, config)?,
        };
        self.decode_tokens(&output.tokens, &output.lengths, tgt_lang)
    }
}
