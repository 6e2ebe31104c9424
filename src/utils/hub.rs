use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};

/// Files needed to rebuild a translation model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    /// One tokenizer per language, in `config.languages` order.
    pub tokenizers: Vec<PathBuf>,
}

pub fn tokenizer_file_name(language: &str) -> String {
    format!("tokenizer.{language}.json")
}

/// All `*.safetensors` files of a directory, sorted by name.
pub fn get_safetensors_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    if files.is_empty() {
        anyhow::bail!("no .safetensors files found in {}", dir.display());
    }
    files.sort();
    Ok(files)
}

pub fn local_files(dir: impl AsRef<Path>, languages: &[String]) -> Result<ModelFiles> {
    let dir = dir.as_ref();
    let config = dir.join("config.json");
    if !config.exists() {
        anyhow::bail!("config.json not found at {}", config.display());
    }
    let mut tokenizers = Vec::with_capacity(languages.len());
    for lang in languages {
        let path = dir.join(tokenizer_file_name(lang));
        if !path.exists() {
            anyhow::bail!("tokenizer for language {lang} not found at {}", path.display());
        }
        tokenizers.push(path);
    }
    Ok(ModelFiles {
        config,
        weights: get_safetensors_files(dir)?,
        tokenizers,
    })
}

/// Downloads (or reuses the cached) config, weights and tokenizers of a hub repo.
pub fn hub_files(model_id: &str, revision: Option<&str>) -> Result<ModelFiles> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.unwrap_or("main").to_string(),
    ));

    let config = repo.get("config.json")?;
    let languages = read_languages(&config)?;
    let weights = vec![repo.get("model.safetensors")?];
    let tokenizers = languages
        .iter()
        .map(|lang| repo.get(&tokenizer_file_name(lang)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ModelFiles {
        config,
        weights,
        tokenizers,
    })
}

pub fn read_languages(config: &Path) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct Languages {
        languages: Vec<String>,
    }
    let data = std::fs::read(config).with_context(|| format!("reading {}", config.display()))?;
    let langs: Languages = serde_json::from_slice(&data)?;
    Ok(langs.languages)
}
