//! Seeding embedding tables from pretrained word vectors.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::vocabulary::Dictionary;
use crate::models::unmt::config::ModelConfig;
use crate::models::unmt::modeling::{embedding_weight_names, table_key};

/// Word vectors plus their word index.
#[derive(Debug, Clone, Default)]
pub struct PretrainedEmbeddings {
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
    pub word_to_id: HashMap<String, usize>,
}

impl PretrainedEmbeddings {
    pub fn lookup(&self, word: &str) -> Option<&[f32]> {
        self.word_to_id.get(word).map(|&i| self.vectors[i].as_slice())
    }

    /// Reads the fastText / word2vec text format: a `count dim` header, then
    /// one `word v1 .. vdim` line per word. Duplicate words keep the first vector.
    pub fn load_vec(path: impl AsRef<Path>, expected_dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let header = lines.next().context("empty embedding file")??;
        let mut parts = header.split_whitespace();
        let _count: usize = parts.next().context("missing count")?.parse()?;
        let dim: usize = parts.next().context("missing dimension")?.parse()?;
        if dim != expected_dim {
            anyhow::bail!("{} has dimension {dim}, model expects {expected_dim}", path.display());
        }

        let mut out = Self {
            dim,
            ..Default::default()
        };
        for (lineno, line) in lines.enumerate() {
            let line = line?;
            let mut parts = line.trim_end().split(' ');
            let Some(word) = parts.next() else { continue };
            let vector = parts.map(str::parse::<f32>).collect::<std::result::Result<Vec<_>, _>>()?;
            if vector.len() != dim {
                tracing::warn!("skipping line {} of {}: {} values", lineno + 2, path.display(), vector.len());
                continue;
            }
            if out.word_to_id.contains_key(word) {
                continue;
            }
            out.word_to_id.insert(word.to_string(), out.vectors.len());
            out.vectors.push(vector);
        }
        Ok(out)
    }
}

/// Where pretrained vectors come from.
#[derive(Debug, Clone)]
pub enum EmbeddingSource {
    Shared(PathBuf),
    PerLanguage(Vec<PathBuf>),
}

impl EmbeddingSource {
    /// Parses a comma separated list: one path means shared vectors.
    pub fn parse(list: &str) -> Option<Self> {
        let paths = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        match paths.len() {
            0 => None,
            1 => paths.into_iter().next().map(Self::Shared),
            _ => Some(Self::PerLanguage(paths)),
        }
    }

    /// Loads one `PretrainedEmbeddings` per table to seed.
    pub fn load(&self, config: &ModelConfig) -> Result<Vec<PretrainedEmbeddings>> {
        match self {
            Self::Shared(path) => Ok(vec![PretrainedEmbeddings::load_vec(path, config.d_model)?]),
            Self::PerLanguage(paths) => {
                if config.shared_embeddings {
                    anyhow::bail!("per-language embedding files need non-shared tables");
                }
                if paths.len() != config.n_langs() {
                    anyhow::bail!("{} embedding files for {} languages", paths.len(), config.n_langs());
                }
                paths
                    .iter()
                    .map(|p| PretrainedEmbeddings::load_vec(p, config.d_model))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub lang: usize,
    pub vocab_size: usize,
    pub found: usize,
    pub lowercased: usize,
}

/// Overwrites rows of the encoder/decoder embeddings and the output projection
/// with pretrained vectors, by vocabulary id. Exact spelling wins; the
/// lowercased word is the fallback.
///
/// `pretrained` holds either one entry (used for every language) or one per
/// language. With shared tables only language 0 is written.
pub fn initialize_embeddings(
    varmap: &VarMap,
    config: &ModelConfig,
    dictionaries: &[Dictionary],
    pretrained: &[PretrainedEmbeddings],
) -> Result<Vec<InitReport>> {
    if dictionaries.len() != config.n_langs() {
        anyhow::bail!("{} dictionaries for {} languages", dictionaries.len(), config.n_langs());
    }
    if pretrained.is_empty() || (pretrained.len() != 1 && pretrained.len() != config.n_langs()) {
        anyhow::bail!("{} pretrained tables for {} languages", pretrained.len(), config.n_langs());
    }

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;

    let n_tables = if config.shared_embeddings { 1 } else { config.n_langs() };
    let mut reports = Vec::with_capacity(config.n_langs());
    for lang in 0..n_tables {
        let key = table_key((!config.shared_embeddings).then_some(lang));
        let vectors = &pretrained[lang.min(pretrained.len() - 1)];
        if vectors.dim != config.d_model {
            anyhow::bail!("pretrained dimension {} != d_model {}", vectors.dim, config.d_model);
        }
        let dico = &dictionaries[lang];
        let vocab_size = config.vocab_size(lang)?;

        let mut found = 0;
        let mut lowercased = 0;
        let mut rows: Vec<(usize, &[f32])> = Vec::new();
        for (id, word) in dico.iter().take(vocab_size) {
            if let Some(v) = vectors.lookup(word) {
                found += 1;
                rows.push((id, v));
            } else if let Some(v) = vectors.lookup(&word.to_lowercase()) {
                found += 1;
                lowercased += 1;
                rows.push((id, v));
            }
        }

        for name in embedding_weight_names(&key) {
            let var = data
                .get(&name)
                .with_context(|| format!("no variable named {name}"))?;
            let mut weights = var.as_tensor().to_dtype(DType::F32)?.to_vec2::<f32>()?;
            for &(id, v) in rows.iter() {
                weights[id].copy_from_slice(v);
            }
            let (n, d) = var.as_tensor().dims2()?;
            let flat = weights.into_iter().flatten().collect::<Vec<_>>();
            let updated = Tensor::from_vec(flat, (n, d), var.device())?.to_dtype(var.dtype())?;
            var.set(&updated)?;
        }

        reports.push(InitReport {
            lang,
            vocab_size,
            found,
            lowercased,
        });
    }

    // Shared tables report the same numbers for every language.
    while reports.len() < config.n_langs() {
        let mut report = reports[0].clone();
        report.lang = reports.len();
        reports.push(report);
    }

    for r in reports.iter() {
        tracing::info!(
            "Initialized {} / {} word embeddings for \"{}\" (including {} after lowercasing).",
            r.found,
            r.vocab_size,
            config.languages[r.lang],
            r.lowercased
        );
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unmt::modeling::Seq2SeqTransformer;
    use candle_core::Device;
    use candle_nn::VarBuilder;

    fn write_vec_file(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn load_vec_reads_header_and_rows() {
        let path = write_vec_file("unmt-core-load.vec", "2 3\nhello 1 2 3\nworld 4 5 6\n");
        let emb = PretrainedEmbeddings::load_vec(&path, 3).unwrap();
        assert_eq!(emb.vectors.len(), 2);
        assert_eq!(emb.lookup("world"), Some(&[4.0f32, 5.0, 6.0][..]));
        assert!(PretrainedEmbeddings::load_vec(&path, 4).is_err());
    }

    #[test]
    fn source_parsing() {
        assert!(matches!(EmbeddingSource::parse("a.vec"), Some(EmbeddingSource::Shared(_))));
        assert!(matches!(
            EmbeddingSource::parse("a.vec,b.vec"),
            Some(EmbeddingSource::PerLanguage(p)) if p.len() == 2
        ));
        assert!(EmbeddingSource::parse("").is_none());
    }

    #[test]
    fn per_language_files_need_separate_tables() {
        let config = ModelConfig::tiny(6, 2);
        let source = EmbeddingSource::PerLanguage(vec!["a".into(), "b".into()]);
        assert!(source.load(&config).is_err());
    }

    #[test]
    fn seeds_rows_with_lowercase_fallback() -> Result<()> {
        let config = ModelConfig::tiny(4, 2);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2SeqTransformer::new(&config, vb)?;

        let mut pretrained = PretrainedEmbeddings {
            dim: 16,
            ..Default::default()
        };
        pretrained.word_to_id.insert("cat".into(), 0);
        pretrained.vectors.push(vec![0.5; 16]);
        pretrained.word_to_id.insert("Dog".into(), 1);
        pretrained.vectors.push(vec![-0.5; 16]);

        let dico = Dictionary::new(vec!["<s>".into(), "Cat".into(), "Dog".into(), "emu".into()]);
        let reports = initialize_embeddings(&varmap, &config, &[dico.clone(), dico], &[pretrained])?;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].found, 2);
        assert_eq!(reports[0].lowercased, 1);
        assert_eq!(reports[1], InitReport { lang: 1, ..reports[0].clone() });

        // The model shares storage with the variable map.
        let table = model.encoder().embeddings().get(1)?.embeddings().to_vec2::<f32>()?;
        assert_eq!(table[1], vec![0.5; 16]);
        assert_eq!(table[2], vec![-0.5; 16]);
        Ok(())
    }
}
