use std::io::{BufRead, Write};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unmt_core::generation::{BeamSearchConfig, LengthPenalty, SamplingConfig};
use unmt_core::models::unmt::{Decoding, Model};
use unmt_core::models::DType;
use unmt_core::utils::select_device;

// ═════════════════════════════════════════════════════════════
//  CLI
// ═════════════════════════════════════════════════════════════

#[derive(Parser, Debug)]
#[command(
    name = "unmt-translate",
    about = "Translate sentences read from stdin, one per line"
)]
struct Args {
    /// Local model directory (config.json, *.safetensors, tokenizer.<lang>.json)
    #[arg(long, conflicts_with = "hub_repo", required_unless_present = "hub_repo")]
    model_dir: Option<String>,

    /// Hugging Face Hub repository holding the same files
    #[arg(long)]
    hub_repo: Option<String>,

    #[arg(long)]
    revision: Option<String>,

    /// Source language name, as listed in config.json
    #[arg(long)]
    src_lang: String,

    /// Target language name
    #[arg(long)]
    tgt_lang: String,

    #[arg(long, default_value_t = 4)]
    beam_size: usize,

    /// Finished hypotheses collected per sentence
    #[arg(long, default_value_t = 1)]
    n_best: usize,

    /// Output tokens per sentence, EOS included
    #[arg(long, default_value_t = 100)]
    max_length: usize,

    /// Length penalty exponent; 0 ranks by raw log-probability
    #[arg(long, default_value_t = 0.7)]
    length_penalty: f32,

    /// Forbid repeating n-grams of this size (0 = off)
    #[arg(long, default_value_t = 0)]
    block_ngram: usize,

    /// Sample instead of beam search
    #[arg(long)]
    sample: bool,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Sentences per forward pass
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Use CPU even if GPU is available
    #[arg(long)]
    cpu: bool,
}

impl Args {
    fn decoding(&self) -> Decoding {
        if self.sample {
            return Decoding::Sample(SamplingConfig {
                temperature: self.temperature.or(Some(1.0)),
                top_p: self.top_p,
                max_length: self.max_length,
                seed: self.seed,
            });
        }
        let length_penalty = if self.length_penalty == 0.0 {
            LengthPenalty::None
        } else {
            LengthPenalty::Wu {
                alpha: self.length_penalty,
            }
        };
        Decoding::Beam(BeamSearchConfig {
            beam_size: self.beam_size,
            n_best: self.n_best,
            max_length: self.max_length,
            length_penalty,
            block_repeated_ngram: self.block_ngram,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be positive");
    }

    let device = select_device(args.cpu)?;
    let dtype = DType::F32;
    info!("Device: {:?}, dtype: {:?}", device, dtype);

    let model = match (&args.model_dir, &args.hub_repo) {
        (Some(dir), _) => Model::from_dir(dir, &device, &dtype)?,
        (None, Some(repo)) => Model::from_hub(repo, args.revision.as_deref(), &device, &dtype)?,
        (None, None) => anyhow::bail!("pass --model-dir or --hub-repo"),
    };
    let src_lang = model.lang_id(&args.src_lang)?;
    let tgt_lang = model.lang_id(&args.tgt_lang)?;
    let decoding = args.decoding();
    info!("Translating {} -> {} with {:?}", args.src_lang, args.tgt_lang, decoding);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut batch = Vec::with_capacity(args.batch_size);
    let mut translated = 0usize;
    let start = std::time::Instant::now();

    let mut lines = stdin.lock().lines();
    loop {
        let line = lines.next().transpose()?;
        let at_end = line.is_none();
        if let Some(line) = line {
            batch.push(line.trim().to_string());
        }
        if batch.len() == args.batch_size || (at_end && !batch.is_empty()) {
            for sentence in model.translate(&batch, src_lang, tgt_lang, &decoding)? {
                writeln!(out, "{sentence}")?;
            }
            out.flush()?;
            translated += batch.len();
            batch.clear();
        }
        if at_end {
            break;
        }
    }

    info!(
        "{translated} sentences translated in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
